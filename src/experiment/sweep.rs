//! Single-sweep execution.
//!
//! The `SweepController` walks one [`SweepSpec`] position by position:
//!
//! ```text
//! move (set_field / configure_source) ──> acquire ──> record ──> yield
//!                                            │  ▲
//!                                  transient │  │ retry_delay
//!                                            ▼  │
//!                                          retry (≤ max_attempts)
//! ```
//!
//! The result is a lazy [`SampleStream`]: nothing moves until the stream is polled,
//! and dropping the stream between items stops the sweep without touching the next
//! position. Every sample is appended to the [`DataRecorder`] before it is yielded.
//! A [`CancelToken`] passed to [`SweepController::run_with_cancel`] interrupts the
//! pause between retries.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::cancel::CancelToken;
use super::plan::{SweepAxis, SweepSpec};
use crate::data::recorder::DataRecorder;
use crate::data::sample::{Sample, SetPointContext};
use crate::error::{InstrumentError, SweepError, SweepFailure};
use crate::hardware::{FieldControl, InstrumentSet, NetworkAnalyzer};

/// Lazy stream of recorded samples from one sweep.
///
/// Ends after the last position, or after yielding the first error.
pub type SampleStream<'a> = BoxStream<'a, Result<Arc<Sample>, SweepError>>;

/// Retry behaviour for transient acquisition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total acquisition attempts per position (at least 1)
    pub max_attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

struct SweepCursor {
    positions: Vec<f64>,
    next: usize,
    sweep_index: Option<u64>,
    context: SetPointContext,
    cancel: CancelToken,
}

/// Runs sweeps against an [`InstrumentSet`] and records into a [`DataRecorder`].
pub struct SweepController {
    instruments: InstrumentSet,
    recorder: Arc<DataRecorder>,
    policy: RetryPolicy,
}

impl SweepController {
    /// Controller with the default retry policy.
    pub fn new(instruments: InstrumentSet, recorder: Arc<DataRecorder>) -> Self {
        Self {
            instruments,
            recorder,
            policy: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = RetryPolicy {
            max_attempts: policy.max_attempts.max(1),
            ..policy
        };
        self
    }

    /// Recorder samples are appended to.
    pub fn recorder(&self) -> &Arc<DataRecorder> {
        &self.recorder
    }

    /// Start a sweep. The sweep index is reserved when the stream is first polled.
    pub fn run<'a>(&'a self, spec: &'a SweepSpec, context: SetPointContext) -> SampleStream<'a> {
        self.run_with_cancel(spec, context, CancelToken::new())
    }

    /// Start a sweep whose retry pauses end early when `cancel` fires.
    ///
    /// A cancelled pause ends the stream with [`SweepError::Cancelled`].
    pub fn run_with_cancel<'a>(
        &'a self,
        spec: &'a SweepSpec,
        context: SetPointContext,
        cancel: CancelToken,
    ) -> SampleStream<'a> {
        let cursor = SweepCursor {
            positions: spec.positions(),
            next: 0,
            sweep_index: None,
            context,
            cancel,
        };

        stream::try_unfold(cursor, move |mut cursor| async move {
            let Some(&position) = cursor.positions.get(cursor.next) else {
                return Ok::<_, SweepError>(None);
            };
            let sweep_index = *cursor
                .sweep_index
                .get_or_insert_with(|| self.recorder.begin_sweep());
            let point_index = cursor.next;
            cursor.next += 1;

            let sample = self
                .measure(spec, &cursor, sweep_index, point_index, position)
                .await?;
            Ok::<_, SweepError>(Some((sample, cursor)))
        })
        .boxed()
    }

    /// Run a sweep to completion and return its samples.
    pub async fn run_to_end(
        &self,
        spec: &SweepSpec,
        context: SetPointContext,
    ) -> Result<Vec<Arc<Sample>>, SweepError> {
        self.run(spec, context).try_collect().await
    }

    async fn measure(
        &self,
        spec: &SweepSpec,
        cursor: &SweepCursor,
        sweep_index: u64,
        point_index: usize,
        position: f64,
    ) -> Result<Arc<Sample>, SweepError> {
        self.move_to(spec, point_index, position)
            .await
            .map_err(|e| classify(position, 0, e))?;

        let mut attempt = 0;
        let s_parameters = loop {
            attempt += 1;
            match self
                .instruments
                .vna
                .acquire_s_parameters(&spec.ports, spec.dwell)
                .await
            {
                Ok(values) => break values,
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    warn!(
                        position,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        "Acquisition failed, retrying: {}",
                        e
                    );
                    if !cursor.cancel.sleep(self.policy.retry_delay).await {
                        return Err(SweepError::Cancelled {
                            position,
                            attempts: attempt,
                        });
                    }
                }
                Err(e) => return Err(classify(position, attempt, e)),
            }
        };

        let sample = Sample {
            sweep_index,
            point_index,
            context: cursor.context.clone(),
            axis: spec.axis,
            position,
            s_parameters,
            timestamp: Utc::now(),
        };
        let recorded = self
            .recorder
            .append(sample)
            .await
            .map_err(|e| SweepError::SweepFailed {
                position,
                attempts: attempt,
                cause: SweepFailure::Storage(e),
            })?;
        debug!(sweep = sweep_index, point_index, position, "sweep position done");
        Ok(recorded)
    }

    async fn move_to(
        &self,
        spec: &SweepSpec,
        point_index: usize,
        position: f64,
    ) -> Result<(), InstrumentError> {
        match spec.axis {
            SweepAxis::Field => {
                if point_index == 0 {
                    self.instruments
                        .vna
                        .configure_source(spec.source.frequency_hz, spec.source.power_dbm)
                        .await?;
                }
                self.instruments
                    .ppms
                    .set_field(position, spec.field_rate)
                    .await
            }
            SweepAxis::Frequency => {
                self.instruments
                    .vna
                    .configure_source(position, spec.source.power_dbm)
                    .await
            }
        }
    }
}

fn classify(position: f64, attempts: u32, error: InstrumentError) -> SweepError {
    if error.is_timeout() {
        SweepError::InstrumentUnresponsive {
            position,
            source: error,
        }
    } else {
        SweepError::SweepFailed {
            position,
            attempts,
            cause: SweepFailure::Instrument(error),
        }
    }
}
