//! Recorded samples and trace views.
//!
//! A [`Sample`] is one acquisition at one sweep position. Samples are immutable once
//! handed to the [`DataRecorder`](super::recorder::DataRecorder) and shared as
//! `Arc<Sample>`. A [`Trace`] is the ordered run of samples from a single sweep;
//! [`TraceFilter`] selects which sweep to read back by its set-point context.

use chrono::{DateTime, Utc};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::experiment::plan::{SetPoint, SweepAxis};
use crate::hardware::PortPair;

/// One ancestor loop node of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Loop label
    pub node: String,
    /// 1-based repetition of that loop
    pub repetition: u32,
    /// Set point applied before the child ran (scans only)
    pub set_point: Option<SetPoint>,
    /// Value read back from the instrument after settling
    pub realized: Option<f64>,
}

impl fmt::Display for ContextEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.repetition)?;
        if let Some(sp) = &self.set_point {
            write!(f, "={}", sp.target)?;
        }
        if let Some(realized) = self.realized {
            write!(f, "({realized})")?;
        }
        Ok(())
    }
}

/// Set points in effect for a sweep, outermost loop first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetPointContext(Vec<ContextEntry>);

impl SetPointContext {
    /// Context of the campaign root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Child context with `entry` appended.
    pub fn child(&self, entry: ContextEntry) -> Self {
        let mut entries = self.0.clone();
        entries.push(entry);
        Self(entries)
    }

    /// Entries, outermost first.
    pub fn entries(&self) -> &[ContextEntry] {
        &self.0
    }

    /// Entry for loop `node`, if present.
    pub fn entry(&self, node: &str) -> Option<&ContextEntry> {
        self.0.iter().find(|e| e.node == node)
    }

    /// True at the campaign root.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SetPointContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "root");
        }
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " / ")?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

/// One acquisition at one sweep position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Sweep this sample belongs to (unique per recorder)
    pub sweep_index: u64,
    /// Position index within the sweep
    pub point_index: usize,
    /// Set points in effect
    pub context: SetPointContext,
    /// Swept quantity
    pub axis: SweepAxis,
    /// Sweep position (Oe or Hz)
    pub position: f64,
    /// Complex S-parameters by port pair
    pub s_parameters: BTreeMap<PortPair, Complex64>,
    /// Acquisition time
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Value for `port`.
    pub fn value(&self, port: PortPair) -> Option<Complex64> {
        self.s_parameters.get(&port).copied()
    }

    /// `20·log10|S|` for `port`.
    pub fn magnitude_db(&self, port: PortPair) -> Option<f64> {
        self.value(port).map(|s| 20.0 * s.norm().log10())
    }
}

/// Selects recorded samples by sweep and set-point context.
///
/// All conditions must hold. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    sweep: Option<u64>,
    targets: Vec<(String, f64)>,
    repetitions: Vec<(String, u32)>,
}

impl TraceFilter {
    /// Filter matching every sample.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only sweep `index`.
    pub fn sweep(mut self, index: u64) -> Self {
        self.sweep = Some(index);
        self
    }

    /// Loop `node` must have applied a set point with `target`.
    pub fn node(mut self, node: impl Into<String>, target: f64) -> Self {
        self.targets.push((node.into(), target));
        self
    }

    /// Loop `node` must be on 1-based `repetition`.
    pub fn repetition(mut self, node: impl Into<String>, repetition: u32) -> Self {
        self.repetitions.push((node.into(), repetition));
        self
    }

    /// True when `sample` satisfies every condition.
    pub fn matches(&self, sample: &Sample) -> bool {
        if self.sweep.is_some_and(|idx| idx != sample.sweep_index) {
            return false;
        }
        let targets_ok = self.targets.iter().all(|(node, target)| {
            sample.context.entries().iter().any(|e| {
                e.node == *node
                    && e.set_point
                        .is_some_and(|sp| (sp.target - target).abs() <= 1e-9 * target.abs().max(1.0))
            })
        });
        let reps_ok = self.repetitions.iter().all(|(node, rep)| {
            sample
                .context
                .entries()
                .iter()
                .any(|e| e.node == *node && e.repetition == *rep)
        });
        targets_ok && reps_ok
    }
}

/// Ordered samples of one sweep.
#[derive(Debug, Clone)]
pub struct Trace {
    sweep_index: u64,
    axis: SweepAxis,
    context: SetPointContext,
    samples: Vec<Arc<Sample>>,
}

impl Trace {
    /// Build a trace from the samples of a single sweep, in point order.
    ///
    /// Returns `None` when `samples` is empty.
    pub fn from_samples(mut samples: Vec<Arc<Sample>>) -> Option<Self> {
        samples.sort_by_key(|s| s.point_index);
        let first = samples.first()?;
        Some(Self {
            sweep_index: first.sweep_index,
            axis: first.axis,
            context: first.context.clone(),
            samples,
        })
    }

    /// Trace from `(position, value)` pairs for one port, outside any campaign.
    pub fn from_points(axis: SweepAxis, port: PortPair, points: &[(f64, Complex64)]) -> Self {
        let timestamp = Utc::now();
        let samples = points
            .iter()
            .enumerate()
            .map(|(point_index, (position, value))| {
                Arc::new(Sample {
                    sweep_index: 0,
                    point_index,
                    context: SetPointContext::root(),
                    axis,
                    position: *position,
                    s_parameters: BTreeMap::from([(port, *value)]),
                    timestamp,
                })
            })
            .collect();
        Self {
            sweep_index: 0,
            axis,
            context: SetPointContext::root(),
            samples,
        }
    }

    /// Recorder sweep index.
    pub fn sweep_index(&self) -> u64 {
        self.sweep_index
    }

    /// Swept quantity.
    pub fn axis(&self) -> SweepAxis {
        self.axis
    }

    /// Set points in effect.
    pub fn context(&self) -> &SetPointContext {
        &self.context
    }

    /// Samples in point order.
    pub fn samples(&self) -> &[Arc<Sample>] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the trace holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sweep positions.
    pub fn positions(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.position).collect()
    }

    /// Port pairs present in any sample.
    pub fn ports(&self) -> BTreeSet<PortPair> {
        self.samples
            .iter()
            .flat_map(|s| s.s_parameters.keys().copied())
            .collect()
    }

    /// `(position, value)` pairs for `port`; samples lacking the port are skipped.
    pub fn points(&self, port: PortPair) -> Vec<(f64, Complex64)> {
        self.samples
            .iter()
            .filter_map(|s| s.value(port).map(|v| (s.position, v)))
            .collect()
    }
}
