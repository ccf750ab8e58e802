//! Append-only sample log.
//!
//! The `DataRecorder` is the single owner of every recorded [`Sample`]. It has one
//! writer (the sweep controller of the running campaign) and any number of readers:
//!
//! - `append` persists the sample to the optional [`SampleSink`] and pushes it onto
//!   the in-memory log while holding the write lock, so a reader either sees the
//!   whole sample or none of it, and never sees a sample the sink rejected.
//! - `read_trace` / `read_traces` take the read lock and assemble [`Trace`] views.
//! - `subscribe` returns a broadcast receiver for live consumers (plots, online fits).
//!   Slow subscribers lag and drop samples; the log itself is never lossy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use super::sample::{Sample, Trace, TraceFilter};
use super::storage::SampleSink;
use crate::error::{RecorderError, StorageError};

/// Capacity of the live broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Append-only, shared sample log.
pub struct DataRecorder {
    samples: RwLock<Vec<Arc<Sample>>>,
    sink: Option<Mutex<Box<dyn SampleSink>>>,
    live: broadcast::Sender<Arc<Sample>>,
    next_sweep: AtomicU64,
}

impl DataRecorder {
    /// In-memory recorder without persistence.
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            samples: RwLock::new(Vec::new()),
            sink: None,
            live,
            next_sweep: AtomicU64::new(0),
        }
    }

    /// Recorder persisting every sample to `sink`.
    pub fn with_sink(sink: Box<dyn SampleSink>) -> Self {
        Self {
            sink: Some(Mutex::new(sink)),
            ..Self::new()
        }
    }

    /// Reserve the index of a new sweep.
    pub fn begin_sweep(&self) -> u64 {
        self.next_sweep.fetch_add(1, Ordering::SeqCst)
    }

    /// Persist and record `sample`.
    ///
    /// On a sink failure the sample is not recorded and the error is returned.
    pub async fn append(&self, sample: Sample) -> Result<Arc<Sample>, StorageError> {
        let mut samples = self.samples.write().await;
        if let Some(sink) = &self.sink {
            sink.lock().await.write(&sample).await?;
        }
        let sample = Arc::new(sample);
        samples.push(Arc::clone(&sample));
        drop(samples);

        // No receivers is not an error
        let _ = self.live.send(Arc::clone(&sample));
        debug!(
            sweep = sample.sweep_index,
            point = sample.point_index,
            position = sample.position,
            "sample recorded"
        );
        Ok(sample)
    }

    /// Flush the sink, if any.
    pub async fn flush(&self) -> Result<(), StorageError> {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.lock().await.flush().await {
                warn!("Failed to flush sample sink: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Number of recorded samples.
    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    /// True when nothing has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }

    /// Snapshot of all samples in recording order.
    pub async fn samples(&self) -> Vec<Arc<Sample>> {
        self.samples.read().await.clone()
    }

    /// Live feed of samples recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Sample>> {
        self.live.subscribe()
    }

    /// The single sweep matching `filter`.
    ///
    /// Fails with [`RecorderError::AmbiguousTrace`] when several sweeps match.
    pub async fn read_trace(&self, filter: &TraceFilter) -> Result<Trace, RecorderError> {
        let mut traces = self.read_traces(filter).await;
        match traces.len() {
            0 => Err(RecorderError::NoMatchingTrace),
            1 => traces.pop().ok_or(RecorderError::NoMatchingTrace),
            matches => Err(RecorderError::AmbiguousTrace { matches }),
        }
    }

    /// Every sweep matching `filter`, in sweep order.
    pub async fn read_traces(&self, filter: &TraceFilter) -> Vec<Trace> {
        let samples = self.samples.read().await;
        let mut by_sweep: BTreeMap<u64, Vec<Arc<Sample>>> = BTreeMap::new();
        for sample in samples.iter().filter(|s| filter.matches(s)) {
            by_sweep
                .entry(sample.sweep_index)
                .or_default()
                .push(Arc::clone(sample));
        }
        by_sweep.into_values().filter_map(Trace::from_samples).collect()
    }
}

impl Default for DataRecorder {
    fn default() -> Self {
        Self::new()
    }
}
