//! Campaign definitions and execution.
//!
//! - [`plan`]: the campaign tree (`LoopSpec`, `SetPoint`, `SweepSpec`)
//! - [`sweep`]: `SweepController`, one physical sweep
//! - [`orchestrator`]: `Orchestrator`, depth-first execution of a campaign tree
//! - [`state`]: lifecycle, status and checkpoints
//! - [`cancel`]: cooperative cancellation
//! - [`presets`]: standard coupling and FMR campaigns

pub mod cancel;
pub mod orchestrator;
pub mod plan;
pub mod presets;
pub mod state;
pub mod sweep;

pub use cancel::CancelToken;
pub use orchestrator::{CampaignSummary, Orchestrator, OrchestratorConfig};
pub use plan::{
    LoopAction, LoopSpec, Nesting, SetPoint, SetPointKind, SourceConfig, SweepAxis, SweepSpec,
    MAX_SWEEP_POINTS,
};
pub use state::{CampaignCheckpoint, CampaignState, CampaignStatus};
pub use sweep::{RetryPolicy, SampleStream, SweepController};
