//! Error types for the measurement core.
//!
//! Every layer gets its own `thiserror` enum so that callers can match on the
//! failure class instead of parsing messages:
//!
//! - **`InstrumentError`**: raised by capability implementations. `Timeout` means the
//!   instrument never settled or answered and is never retried. `Acquisition` is a
//!   transient read failure and may be retried by the sweep controller.
//! - **`StorageError`**: persistence failures raised by a `SampleSink`.
//! - **`RecorderError`**: trace lookups on the `DataRecorder`.
//! - **`SpecError`**: a campaign definition that violates a data-model invariant.
//! - **`SweepError`**: terminal failure of one sweep.
//! - **`CampaignError`**: terminal failure of a whole campaign. Every variant raised after
//!   the campaign started carries a [`Location`] so the operator can resume by hand.
//! - **`FitError`**: input validation of the Q-factor fit. Never aborts a campaign.
//!
//! Application code (CLI, configuration loading) wraps these in `anyhow`.

use crate::data::sample::SetPointContext;
use crate::experiment::plan::SetPoint;
use crate::hardware::PortPair;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure reported by an instrument capability.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    /// The instrument did not settle or respond in time.
    #[error("{instrument} timed out during {operation}")]
    Timeout {
        /// Instrument name
        instrument: String,
        /// Operation that timed out
        operation: String,
    },

    /// Transient acquisition failure (overload, sync loss, garbled reply).
    #[error("acquisition failed: {0}")]
    Acquisition(String),

    /// The instrument refused the command (out of range, unsupported port).
    #[error("{instrument} rejected command: {reason}")]
    Command {
        /// Instrument name
        instrument: String,
        /// Reason given by the instrument
        reason: String,
    },
}

impl InstrumentError {
    /// True for timeouts, which abort immediately.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InstrumentError::Timeout { .. })
    }

    /// True for failures the sweep controller may retry at the same position.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InstrumentError::Acquisition(_))
    }
}

/// Persistence failure.
#[derive(Error, Debug)]
pub enum StorageError {
    /// File system failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding failure
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Record could not be serialised
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Sink no longer accepts samples
    #[error("Sink closed")]
    Closed,
}

/// Trace lookup failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    /// Filter matched nothing
    #[error("no recorded sweep matches the filter")]
    NoMatchingTrace,

    /// Filter matched more than one sweep
    #[error("filter matches {matches} sweeps; narrow it to a single sweep")]
    AmbiguousTrace {
        /// Number of distinct sweeps matching
        matches: usize,
    },
}

/// Invalid campaign definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpecError {
    /// Ramp rate not positive or not finite
    #[error("{what}: rate must be positive and finite, got {rate}")]
    InvalidRate {
        /// Offending element
        what: String,
        /// Rate given
        rate: f64,
    },

    /// Target outside the instrument's safe range
    #[error("{what}: {value} outside safe range [{min}, {max}]")]
    OutOfRange {
        /// Offending element
        what: String,
        /// Requested value
        value: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// Zero or non-finite step
    #[error("sweep step must be non-zero and finite, got {0}")]
    InvalidStep(f64),

    /// Step sign disagrees with `stop - start`
    #[error("sweep step {step} points away from stop (start {start}, stop {stop})")]
    StepDirection {
        /// Start position
        start: f64,
        /// Stop position
        stop: f64,
        /// Step
        step: f64,
    },

    /// Span over step exceeds the per-sweep position limit
    #[error("sweep from {start} to {stop} in steps of {step} has more than {max} positions")]
    TooManyPoints {
        /// Start position
        start: f64,
        /// Stop position
        stop: f64,
        /// Step
        step: f64,
        /// Position limit
        max: usize,
    },

    /// Empty port list
    #[error("sweep must acquire at least one port pair")]
    NoPorts,

    /// `repetitions` is zero
    #[error("loop '{0}' must repeat at least once")]
    ZeroRepetitions(String),

    /// Scan node without set points
    #[error("loop '{0}' scans set points but declares none")]
    EmptyScan(String),

    /// Node without child actions
    #[error("loop '{0}' has no actions")]
    NoActions(String),

    /// Break point outside `1..=repetitions`
    #[error("loop '{label}' measures on repetition {repetition} but only repeats {repetitions} times")]
    BreakPointOutOfRange {
        /// Loop label
        label: String,
        /// Requested repetition
        repetition: u32,
        /// Declared repetitions
        repetitions: u32,
    },
}

/// Why a sweep ended early.
#[derive(Error, Debug)]
pub enum SweepFailure {
    /// Move or acquisition failure
    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    /// Recorder sink rejected the sample
    #[error("failed to record sample: {0}")]
    Storage(#[from] StorageError),
}

/// Terminal failure of a single sweep.
#[derive(Error, Debug)]
pub enum SweepError {
    /// A timeout: not retried.
    #[error("instrument unresponsive at sweep position {position}: {source}")]
    InstrumentUnresponsive {
        /// Position being measured
        position: f64,
        /// Underlying timeout
        source: InstrumentError,
    },

    /// Retries exhausted, move rejected, or sample could not be stored.
    #[error("sweep failed at position {position} after {attempts} attempt(s): {cause}")]
    SweepFailed {
        /// Position being measured
        position: f64,
        /// Acquisition attempts made at this position
        attempts: u32,
        /// Last failure
        cause: SweepFailure,
    },

    /// Cancelled while waiting to retry an acquisition.
    #[error("sweep cancelled at position {position} after {attempts} attempt(s)")]
    Cancelled {
        /// Position being measured
        position: f64,
        /// Acquisition attempts made at this position
        attempts: u32,
    },
}

impl SweepError {
    /// Sweep position at which the failure happened.
    pub fn position(&self) -> f64 {
        match self {
            SweepError::InstrumentUnresponsive { position, .. }
            | SweepError::SweepFailed { position, .. }
            | SweepError::Cancelled { position, .. } => *position,
        }
    }
}

/// Where in the campaign tree a termination happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Ancestor set points realised so far
    pub context: SetPointContext,
    /// Set point being applied, if the failure happened while setting one
    pub set_point: Option<SetPoint>,
    /// Sweep position, if the failure happened inside a sweep
    pub position: Option<f64>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.context)?;
        if let Some(sp) = &self.set_point {
            write!(f, " set point {sp}")?;
        }
        if let Some(position) = self.position {
            write!(f, " position {position}")?;
        }
        Ok(())
    }
}

/// Cause of an aborted campaign.
#[derive(Error, Debug)]
pub enum AbortCause {
    /// Set point could not be applied or read back
    #[error("set point failed: {0}")]
    SetPoint(#[source] InstrumentError),

    /// Sweep ended with an error
    #[error(transparent)]
    Sweep(#[from] SweepError),
}

/// Terminal campaign failure.
#[derive(Error, Debug)]
pub enum CampaignError {
    /// Campaign tree failed validation; nothing was commanded
    #[error("invalid campaign: {0}")]
    InvalidSpec(#[from] SpecError),

    /// Another campaign holds the instruments
    #[error("instrument is busy with another campaign")]
    InstrumentBusy,

    /// Cancellation was requested
    #[error("campaign cancelled at {location}")]
    CampaignCancelled {
        /// Last known point
        location: Location,
    },

    /// First set-point or sweep failure
    #[error("campaign aborted at {location}: {cause}")]
    LoopAborted {
        /// Failing point
        location: Location,
        /// Underlying failure
        cause: AbortCause,
    },
}

impl CampaignError {
    /// Location carried by the error, if the campaign had started.
    pub fn location(&self) -> Option<&Location> {
        match self {
            CampaignError::CampaignCancelled { location }
            | CampaignError::LoopAborted { location, .. } => Some(location),
            CampaignError::InvalidSpec(_) | CampaignError::InstrumentBusy => None,
        }
    }
}

/// Fit input validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Too few points after port and window selection
    #[error("fit needs at least {required} points, got {points}")]
    InsufficientData {
        /// Points available
        points: usize,
        /// Minimum required
        required: usize,
    },

    /// All points share one frequency
    #[error("trace has no frequency variation")]
    DegenerateSweep,

    /// Trace is a field sweep
    #[error("trace was swept along the field axis; fitting needs a frequency sweep")]
    NotFrequencyAxis,

    /// Requested port not acquired
    #[error("port {0} missing from trace")]
    MissingPort(PortPair),

    /// Several ports and none chosen
    #[error("trace carries {0} port pairs; choose one")]
    AmbiguousPort(usize),

    /// NaN or infinite frequency or S-parameter
    #[error("trace contains non-finite values")]
    NonFiniteData,
}
