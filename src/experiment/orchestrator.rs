//! Campaign orchestrator.
//!
//! The `Orchestrator` executes a [`LoopSpec`] tree depth-first, strictly in
//! declaration order, against one exclusively leased [`InstrumentSet`]:
//!
//! ```text
//! LoopSpec ──> apply set point ──> settle ──> post-settle delay ──> read back
//!                                                                     │
//!                       ┌─────────────────────────────────────────────┘
//!                       ▼
//!            for each child, in order:
//!            child LoopSpec (recurse) | SweepSpec ──> SweepController ──> DataRecorder
//! ```
//!
//! Any set-point or sweep failure aborts the whole campaign, remaining siblings
//! included; there is no partial recovery. Cancellation is observed before each set point, during post-settle
//! delays and between sweep positions. On abort or cancellation a
//! [`CampaignCheckpoint`] is written when a checkpoint directory is configured.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(instruments, recorder, OrchestratorConfig::default());
//! let summary = orchestrator.execute(&campaign, CancelToken::new()).await?;
//! println!("{} samples in {:?}", summary.samples_recorded, summary.elapsed);
//! ```

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::cancel::CancelToken;
use super::plan::{LoopAction, LoopSpec, Nesting, SetPoint, SetPointKind, SweepSpec};
use super::state::{CampaignCheckpoint, CampaignState, CampaignStatus};
use super::sweep::{RetryPolicy, SweepController};
use crate::data::recorder::DataRecorder;
use crate::data::sample::{ContextEntry, SetPointContext};
use crate::error::{AbortCause, CampaignError, InstrumentError, Location, SweepError};
use crate::hardware::{FieldControl, InstrumentSet, TemperatureControl};

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Retry policy handed to the sweep controller
    pub retry: RetryPolicy,
    /// Wait after the field reports stable
    pub field_delay: Duration,
    /// Wait after the temperature reports stable
    pub temperature_delay: Duration,
    /// Where checkpoints are written on abort or cancellation
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            field_delay: Duration::from_secs(2),
            temperature_delay: Duration::from_secs(60),
            checkpoint_dir: None,
        }
    }
}

/// Outcome of a completed campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignSummary {
    /// Run identifier
    pub run_id: String,
    /// Samples recorded
    pub samples_recorded: usize,
    /// Sweeps completed
    pub sweeps_completed: usize,
    /// Wall-clock duration
    pub elapsed: Duration,
}

/// Executes campaign trees. One campaign at a time per instrument set.
pub struct Orchestrator {
    instruments: InstrumentSet,
    sweeps: SweepController,
    config: OrchestratorConfig,
    status: Arc<RwLock<CampaignStatus>>,
}

impl Orchestrator {
    /// Orchestrator recording into `recorder`.
    pub fn new(
        instruments: InstrumentSet,
        recorder: Arc<DataRecorder>,
        config: OrchestratorConfig,
    ) -> Self {
        let sweeps =
            SweepController::new(instruments.clone(), recorder).with_retry_policy(config.retry);
        Self {
            instruments,
            sweeps,
            config,
            status: Arc::new(RwLock::new(CampaignStatus::default())),
        }
    }

    /// Recorder samples are appended to.
    pub fn recorder(&self) -> &Arc<DataRecorder> {
        self.sweeps.recorder()
    }

    /// Snapshot of the current or last started campaign.
    ///
    /// Calls to [`execute`](Self::execute) rejected before starting
    /// ([`CampaignError::InstrumentBusy`], [`CampaignError::InvalidSpec`]) leave it
    /// untouched, so a busy rejection never hides the campaign that is running.
    pub async fn status(&self) -> CampaignStatus {
        self.status.read().await.clone()
    }

    /// Execute `root` to completion, failure or cancellation.
    ///
    /// # Errors
    ///
    /// - [`CampaignError::InstrumentBusy`] when another campaign holds the instruments
    /// - [`CampaignError::InvalidSpec`] when the tree violates an invariant
    /// - [`CampaignError::LoopAborted`] on the first set-point or sweep failure
    /// - [`CampaignError::CampaignCancelled`] when `cancel` fires
    pub async fn execute(
        &self,
        root: &LoopSpec,
        cancel: CancelToken,
    ) -> Result<CampaignSummary, CampaignError> {
        let _lease = self
            .instruments
            .try_lease()
            .ok_or(CampaignError::InstrumentBusy)?;

        let ppms = &self.instruments.ppms;
        root.validate(ppms.field_range(), ppms.temperature_range())?;

        let run_id = Uuid::new_v4().to_string();
        *self.status.write().await = CampaignStatus {
            state: CampaignState::Running,
            run_id: Some(run_id.clone()),
            ..CampaignStatus::default()
        };
        info!(
            run_id = %run_id,
            campaign = %root.label,
            sweeps = root.sweep_count(),
            samples = root.sample_count(),
            "Starting campaign"
        );

        let started = Instant::now();
        let result = self
            .run_node(root, SetPointContext::root(), &cancel)
            .await;

        if let Err(e) = self.recorder().flush().await {
            warn!(run_id = %run_id, "Failed to flush recorded samples: {}", e);
        }

        let status = self.status().await;
        match result {
            Ok(()) => {
                self.status.write().await.state = CampaignState::Complete;
                info!(
                    run_id = %run_id,
                    samples = status.samples_recorded,
                    sweeps = status.sweeps_completed,
                    "Campaign complete"
                );
                Ok(CampaignSummary {
                    run_id,
                    samples_recorded: status.samples_recorded,
                    sweeps_completed: status.sweeps_completed,
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => {
                let state = match &e {
                    CampaignError::CampaignCancelled { .. } => {
                        warn!(run_id = %run_id, "Campaign cancelled: {}", e);
                        CampaignState::Cancelled
                    }
                    _ => {
                        error!(run_id = %run_id, "Campaign aborted: {}", e);
                        CampaignState::Error
                    }
                };
                {
                    let mut status = self.status.write().await;
                    status.state = state;
                    status.last_error = Some(e.to_string());
                }
                self.save_checkpoint(root, &run_id, state, &status, &e);
                Err(e)
            }
        }
    }

    fn save_checkpoint(
        &self,
        root: &LoopSpec,
        run_id: &str,
        state: CampaignState,
        status: &CampaignStatus,
        error: &CampaignError,
    ) {
        let Some(dir) = &self.config.checkpoint_dir else {
            return;
        };
        let checkpoint = CampaignCheckpoint {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            state,
            location: error.location().cloned().unwrap_or_default(),
            samples_recorded: status.samples_recorded,
            sweeps_completed: status.sweeps_completed,
            error: Some(error.to_string()),
            campaign: root.clone(),
        };
        let path = checkpoint.path_in(dir);
        match checkpoint.save(&path) {
            Ok(()) => info!("Checkpoint saved: {:?}", path),
            Err(e) => warn!("Failed to save checkpoint: {:#}", e),
        }
    }

    fn run_node<'a>(
        &'a self,
        node: &'a LoopSpec,
        context: SetPointContext,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<(), CampaignError>> {
        async move {
            for repetition in 1..=node.repetitions {
                match node.nesting {
                    Nesting::EachSetPoint => {
                        for set_point in &node.set_points {
                            let realized = self.apply(set_point, &context, cancel).await?;
                            if !node.measures_on(repetition) {
                                continue;
                            }
                            let child = context.child(ContextEntry {
                                node: node.label.clone(),
                                repetition,
                                set_point: Some(*set_point),
                                realized: Some(realized),
                            });
                            self.run_actions(&node.actions, child, cancel).await?;
                        }
                    }
                    Nesting::AfterSequence => {
                        let mut realized = None;
                        for set_point in &node.set_points {
                            realized = Some(self.apply(set_point, &context, cancel).await?);
                        }
                        if !node.measures_on(repetition) {
                            continue;
                        }
                        let child = context.child(ContextEntry {
                            node: node.label.clone(),
                            repetition,
                            set_point: None,
                            realized,
                        });
                        self.run_actions(&node.actions, child, cancel).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn run_actions(
        &self,
        actions: &[LoopAction],
        context: SetPointContext,
        cancel: &CancelToken,
    ) -> Result<(), CampaignError> {
        for action in actions {
            match action {
                LoopAction::Loop(child) => self.run_node(child, context.clone(), cancel).await?,
                LoopAction::Sweep(sweep) => self.run_sweep(sweep, context.clone(), cancel).await?,
            }
        }
        Ok(())
    }

    /// Apply one set point and return the value read back after settling.
    async fn apply(
        &self,
        set_point: &SetPoint,
        context: &SetPointContext,
        cancel: &CancelToken,
    ) -> Result<f64, CampaignError> {
        let location = || Location {
            context: context.clone(),
            set_point: Some(*set_point),
            position: None,
        };
        if cancel.is_cancelled() {
            return Err(CampaignError::CampaignCancelled {
                location: location(),
            });
        }

        info!(context = %context, "Applying {}", set_point);
        let ppms = &self.instruments.ppms;
        let aborted = |e: InstrumentError| CampaignError::LoopAborted {
            location: location(),
            cause: AbortCause::SetPoint(e),
        };
        let delay = match set_point.kind {
            SetPointKind::Field => {
                ppms.set_field(set_point.target, set_point.rate)
                    .await
                    .map_err(aborted)?;
                self.config.field_delay
            }
            SetPointKind::Temperature => {
                ppms.set_temperature(set_point.target, set_point.rate)
                    .await
                    .map_err(aborted)?;
                self.config.temperature_delay
            }
        };

        if !cancel.sleep(delay).await {
            return Err(CampaignError::CampaignCancelled {
                location: location(),
            });
        }

        let realized = match set_point.kind {
            SetPointKind::Field => ppms.field().await,
            SetPointKind::Temperature => ppms.temperature().await,
        }
        .map_err(aborted)?;
        Ok(realized)
    }

    async fn run_sweep(
        &self,
        sweep: &SweepSpec,
        context: SetPointContext,
        cancel: &CancelToken,
    ) -> Result<(), CampaignError> {
        if cancel.is_cancelled() {
            return Err(CampaignError::CampaignCancelled {
                location: Location {
                    context,
                    ..Location::default()
                },
            });
        }

        let mut samples = self
            .sweeps
            .run_with_cancel(sweep, context.clone(), cancel.clone());
        while let Some(item) = samples.next().await {
            match item {
                Ok(sample) => {
                    self.status.write().await.samples_recorded += 1;
                    if cancel.is_cancelled() {
                        return Err(CampaignError::CampaignCancelled {
                            location: Location {
                                context,
                                set_point: None,
                                position: Some(sample.position),
                            },
                        });
                    }
                }
                Err(SweepError::Cancelled { position, .. }) => {
                    return Err(CampaignError::CampaignCancelled {
                        location: Location {
                            context,
                            set_point: None,
                            position: Some(position),
                        },
                    });
                }
                Err(e) => {
                    return Err(CampaignError::LoopAborted {
                        location: Location {
                            context,
                            set_point: None,
                            position: Some(e.position()),
                        },
                        cause: AbortCause::Sweep(e),
                    });
                }
            }
        }
        self.status.write().await.sweeps_completed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plan::SourceConfig;
    use crate::hardware::mock::{MockPpms, PpmsCommand};

    fn instant_config() -> OrchestratorConfig {
        OrchestratorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                retry_delay: Duration::ZERO,
            },
            field_delay: Duration::ZERO,
            temperature_delay: Duration::ZERO,
            checkpoint_dir: None,
        }
    }

    #[tokio::test]
    async fn test_break_points_cycle_without_measuring() {
        let ppms = Arc::new(MockPpms::new());
        let instruments = InstrumentSet::new(
            ppms.clone(),
            Arc::new(crate::hardware::mock::MockVna::new()),
        );
        let orchestrator =
            Orchestrator::new(instruments, Arc::new(DataRecorder::new()), instant_config());

        let campaign = LoopSpec::cycle(
            "field_cycle",
            vec![SetPoint::field(-500.0, 200.0), SetPoint::field(500.0, 200.0)],
            4,
            LoopAction::Sweep(SweepSpec::field(
                0.0,
                100.0,
                50.0,
                SourceConfig::default(),
            )),
        )
        .with_measure_on(vec![2, 4]);

        let summary = orchestrator
            .execute(&campaign, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.sweeps_completed, 2);
        assert_eq!(summary.samples_recorded, 6);

        let cycle_commands = ppms
            .commands()
            .into_iter()
            .filter(|c| matches!(c, PpmsCommand::Field { target, .. } if target.abs() == 500.0))
            .count();
        assert_eq!(cycle_commands, 8);

        let status = orchestrator.status().await;
        assert_eq!(status.state, CampaignState::Complete);
        assert_eq!(status.samples_recorded, 6);
    }

    #[tokio::test]
    async fn test_invalid_campaign_rejected_before_any_command() {
        let ppms = Arc::new(MockPpms::new());
        let instruments = InstrumentSet::new(
            ppms.clone(),
            Arc::new(crate::hardware::mock::MockVna::new()),
        );
        let orchestrator =
            Orchestrator::new(instruments, Arc::new(DataRecorder::new()), instant_config());
        let campaign = LoopSpec::scan(
            "temperature",
            vec![SetPoint::temperature(1000.0, 5.0)],
            LoopAction::Sweep(SweepSpec::field(0.0, 100.0, 50.0, SourceConfig::default())),
        );

        let err = orchestrator
            .execute(&campaign, CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::InvalidSpec(_)));
        assert!(ppms.commands().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_campaign_leaves_status_of_last_run() {
        let instruments = InstrumentSet::new(
            Arc::new(MockPpms::new()),
            Arc::new(crate::hardware::mock::MockVna::new()),
        );
        let orchestrator = Orchestrator::new(
            instruments.clone(),
            Arc::new(DataRecorder::new()),
            instant_config(),
        );
        let sweep = SweepSpec::field(0.0, 100.0, 50.0, SourceConfig::default());
        let good = LoopSpec::scan(
            "temperature",
            vec![SetPoint::temperature(300.0, 5.0)],
            LoopAction::Sweep(sweep.clone()),
        );
        let summary = orchestrator
            .execute(&good, CancelToken::new())
            .await
            .unwrap();

        let bad = LoopSpec::scan(
            "temperature",
            vec![SetPoint::temperature(1000.0, 5.0)],
            LoopAction::Sweep(sweep),
        );
        assert!(orchestrator.execute(&bad, CancelToken::new()).await.is_err());
        let lease = instruments.try_lease().unwrap();
        assert!(matches!(
            orchestrator.execute(&good, CancelToken::new()).await,
            Err(CampaignError::InstrumentBusy)
        ));
        drop(lease);

        let status = orchestrator.status().await;
        assert_eq!(status.state, CampaignState::Complete);
        assert_eq!(status.run_id.as_deref(), Some(summary.run_id.as_str()));
        assert_eq!(status.samples_recorded, 3);
        assert!(status.last_error.is_none());
    }
}
