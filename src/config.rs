//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/fmr_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `FMR_DAQ_`, sections separated by `__`
//!
//! Every section has defaults, so a partial file (or none) is valid.
//!
//! # Example
//! ```no_run
//! use fmr_daq::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // FMR_DAQ_APPLICATION__LOG_LEVEL=debug overrides the file
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::qfit::FitOptions;
use crate::experiment::orchestrator::OrchestratorConfig;
use crate::experiment::sweep::RetryPolicy;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/fmr_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition retry settings
    pub acquisition: AcquisitionConfig,
    /// Post-settle delays
    pub settling: SettlingConfig,
    /// Q-factor fit defaults
    pub fit: FitOptions,
    /// Output locations
    pub storage: StorageConfig,
    /// Simulated instruments
    pub mock: MockConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "FMR DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Acquisition retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Total acquisition attempts per sweep position
    pub max_attempts: u32,
    /// Pause between attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            retry_delay: policy.retry_delay,
        }
    }
}

/// Settling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlingConfig {
    /// Wait after the field reports stable
    #[serde(with = "humantime_serde")]
    pub field_delay: Duration,
    /// Wait after the temperature reports stable
    #[serde(with = "humantime_serde")]
    pub temperature_delay: Duration,
}

impl Default for SettlingConfig {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            field_delay: defaults.field_delay,
            temperature_delay: defaults.temperature_delay,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for sample files
    pub output_dir: PathBuf,
    /// Persist samples as CSV
    pub write_csv: bool,
    /// Directory for abort/cancel checkpoints; none disables them
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            write_csv: true,
            checkpoint_dir: Some(PathBuf::from("checkpoints")),
        }
    }
}

/// Mock instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Ramp/dwell time multiplier (0 = instant)
    pub time_scale: f64,
    /// Uniform noise amplitude added to each quadrature
    pub noise: f64,
    /// Loaded resonant frequency of the simulated resonator (Hz)
    pub resonance_hz: f64,
    /// Loaded Q of the simulated resonator
    pub loaded_q: f64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            time_scale: 0.0,
            noise: 0.0,
            resonance_hz: 2.0e9,
            loaded_q: 10_000.0,
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/fmr_daq.toml` and environment variables
    ///
    /// Example override: `FMR_DAQ_ACQUISITION__MAX_ATTEMPTS=5`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FMR_DAQ_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.acquisition.max_attempts == 0 {
            return Err("acquisition.max_attempts must be at least 1".to_string());
        }

        self.fit.validate()?;

        if !(self.mock.time_scale.is_finite() && self.mock.time_scale >= 0.0) {
            return Err(format!(
                "Invalid mock.time_scale {}. Must be >= 0",
                self.mock.time_scale
            ));
        }
        if !(self.mock.resonance_hz > 0.0 && self.mock.loaded_q > 0.0) {
            return Err("mock.resonance_hz and mock.loaded_q must be positive".to_string());
        }

        Ok(())
    }

    /// Orchestrator settings derived from this configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: RetryPolicy {
                max_attempts: self.acquisition.max_attempts,
                retry_delay: self.acquisition.retry_delay,
            },
            field_delay: self.settling.field_delay,
            temperature_delay: self.settling.temperature_delay,
            checkpoint_dir: self.storage.checkpoint_dir.clone(),
        }
    }
}
