//! CLI Entry Point for fmr_daq
//!
//! Provides command-line interface for:
//! - Running a campaign tree against simulated instruments
//! - Inspecting a campaign tree without running it
//! - Fitting loaded/unloaded Q to a recorded spectrum
//!
//! # Usage
//!
//! Run a campaign:
//! ```bash
//! fmr_daq run config/campaign.example.toml
//! ```
//!
//! Fit a spectrum exported by the analyzer:
//! ```bash
//! fmr_daq fit spectrum.csv --geometry transmission --start-hz 1.99e9 --stop-hz 2.01e9
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fmr_daq::analysis::{FitOptions, Geometry, QFitEngine};
use fmr_daq::config::AppConfig;
use fmr_daq::data::DataRecorder;
use fmr_daq::experiment::{CancelToken, LoopSpec, Orchestrator};
use fmr_daq::hardware::mock::{MockPpms, MockVna, Resonance};
use fmr_daq::hardware::{FieldControl, InstrumentSet, PortPair, TemperatureControl};
use fmr_daq::logging;
use mimalloc::MiMalloc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "fmr_daq")]
#[command(about = "PPMS + VNA measurement orchestration and resonator Q fitting", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/fmr_daq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a campaign tree on simulated instruments
    Run {
        /// Campaign TOML file
        campaign: PathBuf,
    },

    /// Validate a campaign tree and print its size
    Plan {
        /// Campaign TOML file
        campaign: PathBuf,
    },

    /// Fit loaded and unloaded Q to a spectrum CSV
    Fit {
        /// Spectrum CSV file
        spectrum: PathBuf,

        /// Coupling geometry (reflection, transmission, notch)
        #[arg(long)]
        geometry: Option<String>,

        /// Port pair to fit when the file carries a `port` column
        #[arg(long, default_value = "S21")]
        port: PortPair,

        /// Lower edge of the fit window (Hz)
        #[arg(long, requires = "stop_hz")]
        start_hz: Option<f64>,

        /// Upper edge of the fit window (Hz)
        #[arg(long, requires = "start_hz")]
        stop_hz: Option<f64>,

        /// Frequency column (`position` for files written by `run`)
        #[arg(long, default_value = "Frequency (Hz)")]
        freq_col: String,

        /// Real part column
        #[arg(long, default_value = "X")]
        re_col: String,

        /// Imaginary part column
        #[arg(long, default_value = "Y")]
        im_col: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Run { campaign } => run_campaign(&config, &campaign).await,
        Commands::Plan { campaign } => plan_campaign(&campaign),
        Commands::Fit {
            spectrum,
            geometry,
            port,
            start_hz,
            stop_hz,
            freq_col,
            re_col,
            im_col,
            json,
        } => {
            let mut options = config.fit.clone();
            if let Some(geometry) = geometry {
                options.geometry = parse_geometry(&geometry)?;
            }
            if let (Some(low), Some(high)) = (start_hz, stop_hz) {
                options.frequency_window = Some((low, high));
            }
            options.validate().map_err(|e| anyhow!(e))?;
            fit_spectrum(&spectrum, options, port, [freq_col, re_col, im_col], json)
        }
    }
}

fn load_campaign(path: &Path) -> Result<LoopSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read campaign '{}'", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse campaign '{}'", path.display()))
}

fn plan_campaign(path: &Path) -> Result<()> {
    let campaign = load_campaign(path)?;
    let ppms = MockPpms::new();
    campaign.validate(ppms.field_range(), ppms.temperature_range())?;
    println!("Campaign '{}' is valid", campaign.label);
    println!("  sweeps:  {}", campaign.sweep_count());
    println!("  samples: {}", campaign.sample_count());
    Ok(())
}

async fn run_campaign(config: &AppConfig, path: &Path) -> Result<()> {
    let campaign = load_campaign(path)?;
    info!(
        campaign = %campaign.label,
        sweeps = campaign.sweep_count(),
        samples = campaign.sample_count(),
        "Loaded campaign"
    );

    let ppms = MockPpms::new().with_time_scale(config.mock.time_scale);
    let vna = MockVna::with_resonance(Resonance {
        f_l: config.mock.resonance_hz,
        q_l: config.mock.loaded_q,
        ..Resonance::default()
    })
    .with_noise(config.mock.noise)
    .with_time_scale(config.mock.time_scale);
    let instruments = InstrumentSet::new(Arc::new(ppms), Arc::new(vna));

    let recorder = Arc::new(recorder_for(config, &campaign.label)?);
    let orchestrator = Orchestrator::new(instruments, recorder, config.orchestrator_config());

    let cancel = CancelToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling campaign");
            ctrl_c.cancel();
        }
    });

    let summary = orchestrator.execute(&campaign, cancel).await?;
    println!("Campaign {} complete", summary.run_id);
    println!("  sweeps:  {}", summary.sweeps_completed);
    println!("  samples: {}", summary.samples_recorded);
    println!("  elapsed: {:.1?}", summary.elapsed);
    Ok(())
}

#[cfg(feature = "storage_csv")]
fn recorder_for(config: &AppConfig, label: &str) -> Result<DataRecorder> {
    use fmr_daq::data::CsvSink;

    if !config.storage.write_csv {
        return Ok(DataRecorder::new());
    }
    let sink = CsvSink::in_dir(&config.storage.output_dir, label)?;
    println!("Writing samples to {}", sink.path().display());
    Ok(DataRecorder::with_sink(Box::new(sink)))
}

#[cfg(not(feature = "storage_csv"))]
fn recorder_for(config: &AppConfig, _label: &str) -> Result<DataRecorder> {
    if config.storage.write_csv {
        warn!("CSV output requested but the storage_csv feature is disabled");
    }
    Ok(DataRecorder::new())
}

fn parse_geometry(name: &str) -> Result<Geometry> {
    match name.to_lowercase().as_str() {
        "reflection" => Ok(Geometry::Reflection),
        "transmission" => Ok(Geometry::Transmission),
        "notch" => Ok(Geometry::Notch),
        other => Err(anyhow!(
            "unknown geometry '{other}'; expected reflection, transmission or notch"
        )),
    }
}

#[cfg(feature = "storage_csv")]
fn fit_spectrum(
    path: &Path,
    options: FitOptions,
    port: PortPair,
    [frequency, real, imag]: [String; 3],
    json: bool,
) -> Result<()> {
    use fmr_daq::data::{read_spectrum_csv, SpectrumColumns};

    let columns = SpectrumColumns {
        frequency,
        real,
        imag,
    };
    let trace = read_spectrum_csv(path, &columns, port)
        .with_context(|| format!("failed to load spectrum '{}'", path.display()))?;
    let result = QFitEngine::new(options).fit(&trace)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("f_L = {:.6} GHz", result.f_l / 1e9);
        println!("Q_L = {:.1}", result.q_l);
        println!("Q_0 = {:.1}", result.q_0);
        println!("Q_c = {:.1}", result.q_coupling);
        println!(
            "residual = {:.3e} ({})",
            result.residual,
            if result.converged { "converged" } else { "not converged" }
        );
    }
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn fit_spectrum(
    _path: &Path,
    _options: FitOptions,
    _port: PortPair,
    _columns: [String; 3],
    _json: bool,
) -> Result<()> {
    Err(anyhow!("spectrum loading requires the storage_csv feature"))
}
