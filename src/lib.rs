//! # FMR DAQ Core Library
//!
//! Measurement orchestration for ferromagnetic-resonance and cavity-coupling
//! experiments driven by a PPMS (field and temperature) and a vector network
//! analyzer, plus the resonator Q-factor fit used to analyse the recorded spectra.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: capability traits (`FieldControl`, `TemperatureControl`,
//!   `NetworkAnalyzer`), the exclusive `InstrumentSet` lease and mock instruments.
//! - **`experiment`**: the campaign tree (`LoopSpec`), the `SweepController` that runs
//!   one sweep, and the `Orchestrator` that walks the tree with cancellation and
//!   checkpoints.
//! - **`data`**: `Sample`/`Trace` records, the shared `DataRecorder` and CSV sinks.
//! - **`analysis`**: the `QFitEngine` loaded/unloaded Q-factor fit.
//! - **`config`**: layered TOML + environment configuration via figment.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: error types shared across modules.

pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
