//! Sample persistence.
//!
//! The [`DataRecorder`](super::recorder::DataRecorder) hands every sample to an
//! optional [`SampleSink`] before making it visible to readers. The CSV sink writes
//! one row per sample and port pair with the columns
//!
//! ```text
//! timestamp,sweep_index,point_index,context,axis,position,port,X,Y,magnitude_db
//! ```
//!
//! [`read_spectrum_csv`] loads a frequency spectrum (frequency, real, imaginary
//! columns) for offline fitting.

use async_trait::async_trait;
#[cfg(feature = "storage_csv")]
use num_complex::Complex64;
#[cfg(feature = "storage_csv")]
use std::fs::File;
#[cfg(feature = "storage_csv")]
use std::path::{Path, PathBuf};
#[cfg(feature = "storage_csv")]
use tracing::info;

use super::sample::Sample;
use crate::error::StorageError;
#[cfg(feature = "storage_csv")]
use crate::experiment::plan::SweepAxis;
#[cfg(feature = "storage_csv")]
use crate::hardware::PortPair;

/// Destination for recorded samples.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Persist one sample. Called under the recorder's write lock.
    async fn write(&mut self, sample: &Sample) -> Result<(), StorageError>;

    /// Flush buffered output.
    async fn flush(&mut self) -> Result<(), StorageError>;
}

/// CSV file sink.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Create `path` (and its parent directory) and write the header row.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_writer(File::create(&path)?);
        writer.write_record([
            "timestamp",
            "sweep_index",
            "point_index",
            "context",
            "axis",
            "position",
            "port",
            "X",
            "Y",
            "magnitude_db",
        ])?;
        info!("CSV sink writing to '{}'", path.display());
        Ok(Self { path, writer })
    }

    /// Create `<dir>/<run_id>_<timestamp>.csv`.
    pub fn in_dir(dir: impl AsRef<Path>, run_id: &str) -> Result<Self, StorageError> {
        let file_name = format!(
            "{}_{}.csv",
            run_id,
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        Self::create(dir.as_ref().join(file_name))
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl SampleSink for CsvSink {
    async fn write(&mut self, sample: &Sample) -> Result<(), StorageError> {
        let axis = match sample.axis {
            SweepAxis::Field => "field",
            SweepAxis::Frequency => "frequency",
        };
        for (port, value) in &sample.s_parameters {
            self.writer.write_record(&[
                sample.timestamp.to_rfc3339(),
                sample.sweep_index.to_string(),
                sample.point_index.to_string(),
                sample.context.to_string(),
                axis.to_string(),
                sample.position.to_string(),
                port.to_string(),
                value.re.to_string(),
                value.im.to_string(),
                (20.0 * value.norm().log10()).to_string(),
            ])?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Column names of a spectrum CSV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectrumColumns {
    /// Frequency column (Hz)
    pub frequency: String,
    /// Real part column
    pub real: String,
    /// Imaginary part column
    pub imag: String,
}

impl Default for SpectrumColumns {
    fn default() -> Self {
        Self {
            frequency: "Frequency (Hz)".into(),
            real: "X".into(),
            imag: "Y".into(),
        }
    }
}

/// Load a spectrum CSV as a single-port frequency [`Trace`](super::sample::Trace).
///
/// The `port` column, when present, is used to keep only rows for `port`.
#[cfg(feature = "storage_csv")]
pub fn read_spectrum_csv(
    path: impl AsRef<Path>,
    columns: &SpectrumColumns,
    port: PortPair,
) -> Result<super::sample::Trace, StorageError> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let headers = reader.headers()?.clone();
    let index_of = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| StorageError::Serialization(format!("missing column '{name}'")))
    };
    let freq_idx = index_of(&columns.frequency)?;
    let re_idx = index_of(&columns.real)?;
    let im_idx = index_of(&columns.imag)?;
    let port_idx = headers.iter().position(|h| h.trim() == "port");

    let wanted = port.to_string();
    let mut points = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(idx) = port_idx {
            if record.get(idx).map(str::trim) != Some(wanted.as_str()) {
                continue;
            }
        }
        let field = |idx: usize| -> Result<f64, StorageError> {
            let raw = record.get(idx).unwrap_or_default().trim();
            raw.parse::<f64>()
                .map_err(|e| StorageError::Serialization(format!("bad number '{raw}': {e}")))
        };
        points.push((field(freq_idx)?, Complex64::new(field(re_idx)?, field(im_idx)?)));
    }

    Ok(super::sample::Trace::from_points(
        SweepAxis::Frequency,
        port,
        &points,
    ))
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::data::sample::SetPointContext;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_csv_sink_writes_one_row_per_port() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut sink = CsvSink::create(&path).unwrap();

        let sample = Sample {
            sweep_index: 0,
            point_index: 4,
            context: SetPointContext::root(),
            axis: SweepAxis::Field,
            position: 400.0,
            s_parameters: BTreeMap::from([
                (PortPair::S11, Complex64::new(-0.5, 0.1)),
                (PortPair::S21, Complex64::new(0.1, 0.0)),
            ]),
            timestamp: Utc::now(),
        };
        sink.write(&sample).await.unwrap();
        sink.flush().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,sweep_index"));
        assert!(lines[2].contains(",S21,0.1,0,"));
    }

    #[test]
    fn test_read_spectrum_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spectrum.csv");
        std::fs::write(
            &path,
            "Frequency (Hz),X,Y\n2.0e9,0.1,0.0\n2.1e9,0.05,-0.05\n",
        )
        .unwrap();

        let trace = read_spectrum_csv(&path, &SpectrumColumns::default(), PortPair::S21).unwrap();
        assert_eq!(trace.positions(), vec![2.0e9, 2.1e9]);
        assert_eq!(
            trace.points(PortPair::S21)[1].1,
            Complex64::new(0.05, -0.05)
        );
    }

    #[test]
    fn test_read_spectrum_csv_missing_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "f,X,Y\n1,2,3\n").unwrap();
        assert!(matches!(
            read_spectrum_csv(&path, &SpectrumColumns::default(), PortPair::S21),
            Err(StorageError::Serialization(_))
        ));
    }
}
