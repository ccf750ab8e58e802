//! Campaign state management and checkpointing.
//!
//! This module provides state tracking for the orchestrator, including lifecycle
//! management and the checkpoint written when a campaign stops early so the
//! operator can resume it by hand.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::plan::LoopSpec;
use crate::error::Location;

/// Campaign execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──execute──> Running ──done──> Complete
///                     │
///                     ├──cancel──> Cancelled
///                     │
///                     └──failure─> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignState {
    /// No campaign started yet
    Idle,
    /// Campaign actively executing
    Running,
    /// Campaign completed successfully
    Complete,
    /// Campaign stopped on request
    Cancelled,
    /// Campaign aborted by a failure
    Error,
}

impl std::fmt::Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignState::Idle => write!(f, "Idle"),
            CampaignState::Running => write!(f, "Running"),
            CampaignState::Complete => write!(f, "Complete"),
            CampaignState::Cancelled => write!(f, "Cancelled"),
            CampaignState::Error => write!(f, "Error"),
        }
    }
}

impl CampaignState {
    /// Check if the state allows starting a new campaign.
    pub fn can_begin(&self) -> bool {
        !matches!(self, CampaignState::Running)
    }

    /// True for states a campaign ends in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignState::Complete | CampaignState::Cancelled | CampaignState::Error
        )
    }
}

/// Live view of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignStatus {
    /// Current state
    pub state: CampaignState,
    /// Run identifier of the current or last campaign
    pub run_id: Option<String>,
    /// Samples recorded by the current or last campaign
    pub samples_recorded: usize,
    /// Sweeps completed by the current or last campaign
    pub sweeps_completed: usize,
    /// Last error message (if state is Error or Cancelled)
    pub last_error: Option<String>,
}

impl Default for CampaignStatus {
    fn default() -> Self {
        Self {
            state: CampaignState::Idle,
            run_id: None,
            samples_recorded: 0,
            sweeps_completed: 0,
            last_error: None,
        }
    }
}

/// Serializable record of where a campaign stopped.
///
/// Carries the campaign tree itself so the operator can edit it and start again
/// from the failing point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignCheckpoint {
    /// Unique run identifier
    pub run_id: String,
    /// Checkpoint creation timestamp
    pub timestamp: DateTime<Utc>,
    /// State the campaign ended in
    pub state: CampaignState,
    /// Where it stopped
    pub location: Location,
    /// Samples recorded before stopping
    pub samples_recorded: usize,
    /// Sweeps completed before stopping
    pub sweeps_completed: usize,
    /// Error message, if the campaign failed
    pub error: Option<String>,
    /// The campaign tree
    pub campaign: LoopSpec,
}

impl CampaignCheckpoint {
    /// Save checkpoint to a JSON file, creating the parent directory.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the file write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize checkpoint")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create checkpoint directory")?;
        }

        fs::write(&path, json)
            .with_context(|| format!("Failed to write checkpoint to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load checkpoint from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or deserialized.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint from {:?}", path.as_ref()))?;

        let checkpoint = serde_json::from_str(&json).context("Failed to deserialize checkpoint")?;

        Ok(checkpoint)
    }

    /// Default filename: `checkpoint_<run_id>_<timestamp>.json`.
    pub fn default_filename(&self) -> String {
        format!(
            "checkpoint_{}_{}.json",
            self.run_id,
            self.timestamp.format("%Y%m%d_%H%M%S")
        )
    }

    /// Full path of this checkpoint inside `dir`.
    pub fn path_in(&self, dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(self.default_filename())
    }
}
