//! Recorded samples, the shared recorder and persistence sinks.
pub mod recorder;
pub mod sample;
pub mod storage;

pub use recorder::DataRecorder;
pub use sample::{ContextEntry, Sample, SetPointContext, Trace, TraceFilter};
pub use storage::SampleSink;
#[cfg(feature = "storage_csv")]
pub use storage::{read_spectrum_csv, CsvSink, SpectrumColumns};
