//! Offline analysis of recorded sweeps.

pub mod linalg;
pub mod qfit;

pub use qfit::{FitOptions, FitResult, Geometry, QFitEngine};
