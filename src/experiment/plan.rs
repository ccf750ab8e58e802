//! Campaign definitions.
//!
//! A campaign is a tree of [`LoopSpec`] nodes whose leaves are [`SweepSpec`]s.
//! Each node applies set points (field or temperature) and then runs its child
//! actions in declaration order, either once per set point (a scan) or once per
//! pass through the whole set-point sequence (a pre-conditioning cycle). All
//! types derive `serde` so a campaign can be written as TOML:
//!
//! ```toml
//! label = "temperature"
//! set_points = [
//!     { kind = "temperature", target = 300.0, rate = 5.0 },
//!     { kind = "temperature", target = 295.0, rate = 5.0 },
//! ]
//!
//! [[actions]]
//! [actions.sweep]
//! axis = "field"
//! start = 0.0
//! stop = 1000.0
//! step = 100.0
//! dwell = "200ms"
//! ports = ["S21"]
//! source = { frequency_hz = 2.0e9, power_dbm = -10.0 }
//!
//! [[actions]]
//! [actions.sweep]
//! axis = "field"
//! start = 1000.0
//! stop = 0.0
//! step = -100.0
//! dwell = "200ms"
//! ports = ["S12"]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::SpecError;
use crate::hardware::{PortPair, SafeRange};

/// Relative tolerance used when deciding whether the last whole step lands on `stop`.
const STEP_EPSILON: f64 = 1e-9;

/// Most positions a single sweep may visit.
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

/// Quantity a set point drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetPointKind {
    /// Magnetic field in Oe, rate in Oe/s
    Field,
    /// Temperature in K, rate in K/min
    Temperature,
}

/// One target the PPMS is driven to before the child action runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetPoint {
    /// Field or temperature
    pub kind: SetPointKind,
    /// Target value (Oe or K)
    pub target: f64,
    /// Ramp rate (Oe/s or K/min)
    pub rate: f64,
}

impl SetPoint {
    /// Field set point in Oe, ramped at `rate` Oe/s.
    pub fn field(target: f64, rate: f64) -> Self {
        Self {
            kind: SetPointKind::Field,
            target,
            rate,
        }
    }

    /// Temperature set point in K, ramped at `rate` K/min.
    pub fn temperature(target: f64, rate: f64) -> Self {
        Self {
            kind: SetPointKind::Temperature,
            target,
            rate,
        }
    }

    /// Check rate and target against the instrument's safe range.
    pub fn validate(&self, range: SafeRange) -> Result<(), SpecError> {
        let what = self.to_string();
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(SpecError::InvalidRate {
                what,
                rate: self.rate,
            });
        }
        if !self.target.is_finite() || !range.contains(self.target) {
            return Err(SpecError::OutOfRange {
                what,
                value: self.target,
                min: range.min,
                max: range.max,
            });
        }
        Ok(())
    }
}

impl fmt::Display for SetPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SetPointKind::Field => write!(f, "field {} Oe @ {} Oe/s", self.target, self.rate),
            SetPointKind::Temperature => {
                write!(f, "temperature {} K @ {} K/min", self.target, self.rate)
            }
        }
    }
}

/// Physical quantity swept by a [`SweepSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepAxis {
    /// Field in Oe, fixed microwave source (FMR)
    Field,
    /// Source frequency in Hz (resonator spectroscopy)
    Frequency,
}

impl fmt::Display for SweepAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepAxis::Field => write!(f, "Field (Oe)"),
            SweepAxis::Frequency => write!(f, "Frequency (Hz)"),
        }
    }
}

/// Network analyzer source settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// CW frequency (Hz); ignored by frequency sweeps
    pub frequency_hz: f64,
    /// Output power (dBm)
    pub power_dbm: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 2.0e9,
            power_dbm: -10.0,
        }
    }
}

fn default_field_rate() -> f64 {
    200.0
}

/// One physical sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// Swept quantity
    pub axis: SweepAxis,
    /// First position
    pub start: f64,
    /// Last position (reached exactly)
    pub stop: f64,
    /// Signed step; must point from `start` towards `stop`
    pub step: f64,
    /// VNA integration time per position
    #[serde(with = "humantime_serde")]
    pub dwell: Duration,
    /// Port pairs acquired at every position
    pub ports: Vec<PortPair>,
    /// Source settings
    #[serde(default)]
    pub source: SourceConfig,
    /// Field ramp rate (Oe/s) used between field positions
    #[serde(default = "default_field_rate")]
    pub field_rate: f64,
}

impl SweepSpec {
    /// Field sweep at a fixed source frequency and power.
    pub fn field(start: f64, stop: f64, step: f64, source: SourceConfig) -> Self {
        Self {
            axis: SweepAxis::Field,
            start,
            stop,
            step,
            dwell: Duration::ZERO,
            ports: vec![PortPair::S21],
            source,
            field_rate: default_field_rate(),
        }
    }

    /// Frequency sweep at `power_dbm`.
    pub fn frequency(start_hz: f64, stop_hz: f64, step_hz: f64, power_dbm: f64) -> Self {
        Self {
            axis: SweepAxis::Frequency,
            start: start_hz,
            stop: stop_hz,
            step: step_hz,
            dwell: Duration::ZERO,
            ports: vec![PortPair::S21],
            source: SourceConfig {
                frequency_hz: start_hz,
                power_dbm,
            },
            field_rate: default_field_rate(),
        }
    }

    /// Replace the acquired port pairs.
    pub fn with_ports(mut self, ports: Vec<PortPair>) -> Self {
        self.ports = ports;
        self
    }

    /// Set the dwell time per position.
    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    /// Positions visited, in order.
    pub fn positions(&self) -> Vec<f64> {
        linear_positions(self.start, self.stop, self.step)
    }

    /// Number of positions, computed without materialising them.
    pub fn point_count(&self) -> usize {
        linear_point_count(self.start, self.stop, self.step)
    }

    /// Check step, ports and ranges.
    pub fn validate(&self, field_range: SafeRange) -> Result<(), SpecError> {
        if !(self.step.is_finite() && self.step != 0.0) {
            return Err(SpecError::InvalidStep(self.step));
        }
        if self.stop != self.start && (self.stop - self.start).signum() != self.step.signum() {
            return Err(SpecError::StepDirection {
                start: self.start,
                stop: self.stop,
                step: self.step,
            });
        }
        if self.point_count() > MAX_SWEEP_POINTS {
            return Err(SpecError::TooManyPoints {
                start: self.start,
                stop: self.stop,
                step: self.step,
                max: MAX_SWEEP_POINTS,
            });
        }
        if self.ports.is_empty() {
            return Err(SpecError::NoPorts);
        }

        match self.axis {
            SweepAxis::Field => {
                if !(self.field_rate.is_finite() && self.field_rate > 0.0) {
                    return Err(SpecError::InvalidRate {
                        what: "field sweep".into(),
                        rate: self.field_rate,
                    });
                }
                for value in [self.start, self.stop] {
                    if !value.is_finite() || !field_range.contains(value) {
                        return Err(SpecError::OutOfRange {
                            what: "field sweep".into(),
                            value,
                            min: field_range.min,
                            max: field_range.max,
                        });
                    }
                }
                check_frequency("source frequency", self.source.frequency_hz)
            }
            SweepAxis::Frequency => {
                check_frequency("frequency sweep", self.start)?;
                check_frequency("frequency sweep", self.stop)
            }
        }
    }
}

fn check_frequency(what: &str, hz: f64) -> Result<(), SpecError> {
    if hz.is_finite() && hz > 0.0 {
        Ok(())
    } else {
        Err(SpecError::OutOfRange {
            what: what.into(),
            value: hz,
            min: 0.0,
            max: f64::INFINITY,
        })
    }
}

/// Number of positions [`linear_positions`] yields for an unbounded span.
///
/// Saturates at `usize::MAX`; never allocates.
pub fn linear_point_count(start: f64, stop: f64, step: f64) -> usize {
    if start == stop || step == 0.0 || !step.is_finite() {
        return 1;
    }
    let span = (stop - start) / step;
    if !span.is_finite() {
        return usize::MAX;
    }
    let whole_steps = (span + STEP_EPSILON).floor().max(0.0);
    let last = start + whole_steps * step;
    let extra = if ((stop - last) / step).abs() <= STEP_EPSILON {
        1
    } else {
        2
    };
    // `as` saturates for values beyond usize::MAX
    (whole_steps as usize).saturating_add(extra)
}

/// Positions `start + i·step` up to `stop`, clamping the last one to `stop`.
///
/// A zero-width span yields the single position `start`. The caller guarantees
/// that `step` is non-zero and points towards `stop`. Spans with more than
/// [`MAX_SWEEP_POINTS`] positions are cut off after that many positions without
/// reaching `stop`; [`SweepSpec::validate`] rejects such sweeps.
pub fn linear_positions(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if start == stop || step == 0.0 || !step.is_finite() {
        return vec![start];
    }

    let count = linear_point_count(start, stop, step);
    if count > MAX_SWEEP_POINTS {
        return (0..MAX_SWEEP_POINTS).map(|i| start + i as f64 * step).collect();
    }
    let mut positions: Vec<f64> = (0..count).map(|i| start + i as f64 * step).collect();
    if let Some(end) = positions.last_mut() {
        *end = stop;
    }
    positions
}

/// How a loop node combines its set points with its child actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nesting {
    /// Apply each set point in turn and run the child actions after every one.
    #[default]
    EachSetPoint,
    /// Apply the whole set-point sequence, then run the child actions once.
    AfterSequence,
}

/// One child of a loop node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAction {
    /// Nested loop
    Loop(Box<LoopSpec>),
    /// Leaf sweep
    Sweep(SweepSpec),
}

fn default_repetitions() -> u32 {
    1
}

/// A node of the campaign tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Name recorded in every sample's context
    pub label: String,
    /// Passes over the set points (at least one)
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    /// Scan or pre-conditioning cycle
    #[serde(default)]
    pub nesting: Nesting,
    /// Set points, applied in declaration order
    #[serde(default)]
    pub set_points: Vec<SetPoint>,
    /// 1-based repetitions on which the child actions run; all when absent
    #[serde(default)]
    pub measure_on: Option<Vec<u32>>,
    /// Child actions, run in declaration order
    pub actions: Vec<LoopAction>,
}

impl LoopSpec {
    /// Scan: run `action` after each set point.
    pub fn scan(label: impl Into<String>, set_points: Vec<SetPoint>, action: LoopAction) -> Self {
        Self {
            label: label.into(),
            repetitions: 1,
            nesting: Nesting::EachSetPoint,
            set_points,
            measure_on: None,
            actions: vec![action],
        }
    }

    /// Cycle: apply `set_points` `repetitions` times, running `action` after each pass.
    pub fn cycle(
        label: impl Into<String>,
        set_points: Vec<SetPoint>,
        repetitions: u32,
        action: LoopAction,
    ) -> Self {
        Self {
            label: label.into(),
            repetitions,
            nesting: Nesting::AfterSequence,
            set_points,
            measure_on: None,
            actions: vec![action],
        }
    }

    /// Append a sibling action, run after the existing ones.
    pub fn then(mut self, action: LoopAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Restrict the child actions to the listed 1-based repetitions.
    pub fn with_measure_on(mut self, repetitions: Vec<u32>) -> Self {
        self.measure_on = Some(repetitions);
        self
    }

    /// True when the child actions run on 1-based `repetition`.
    pub fn measures_on(&self, repetition: u32) -> bool {
        self.measure_on
            .as_ref()
            .map_or(true, |reps| reps.contains(&repetition))
    }

    /// Validate the whole subtree.
    pub fn validate(
        &self,
        field_range: SafeRange,
        temperature_range: SafeRange,
    ) -> Result<(), SpecError> {
        if self.repetitions == 0 {
            return Err(SpecError::ZeroRepetitions(self.label.clone()));
        }
        if self.nesting == Nesting::EachSetPoint && self.set_points.is_empty() {
            return Err(SpecError::EmptyScan(self.label.clone()));
        }
        if self.actions.is_empty() {
            return Err(SpecError::NoActions(self.label.clone()));
        }
        if let Some(reps) = &self.measure_on {
            if let Some(bad) = reps.iter().find(|r| **r == 0 || **r > self.repetitions) {
                return Err(SpecError::BreakPointOutOfRange {
                    label: self.label.clone(),
                    repetition: *bad,
                    repetitions: self.repetitions,
                });
            }
        }
        for sp in &self.set_points {
            match sp.kind {
                SetPointKind::Field => sp.validate(field_range)?,
                SetPointKind::Temperature => sp.validate(temperature_range)?,
            }
        }
        for action in &self.actions {
            match action {
                LoopAction::Loop(child) => child.validate(field_range, temperature_range)?,
                LoopAction::Sweep(sweep) => sweep.validate(field_range)?,
            }
        }
        Ok(())
    }

    /// Number of times the child actions run for one execution of this node.
    fn action_runs(&self) -> usize {
        let measured = (1..=self.repetitions)
            .filter(|rep| self.measures_on(*rep))
            .count();
        match self.nesting {
            Nesting::EachSetPoint => measured * self.set_points.len(),
            Nesting::AfterSequence => measured,
        }
    }

    /// Total sweeps the campaign will run. Saturates at `usize::MAX`.
    pub fn sweep_count(&self) -> usize {
        let per_run = self
            .actions
            .iter()
            .map(|action| match action {
                LoopAction::Loop(child) => child.sweep_count(),
                LoopAction::Sweep(_) => 1,
            })
            .fold(0, usize::saturating_add);
        self.action_runs().saturating_mul(per_run)
    }

    /// Total samples the campaign will record. Saturates at `usize::MAX`.
    pub fn sample_count(&self) -> usize {
        let per_run = self
            .actions
            .iter()
            .map(|action| match action {
                LoopAction::Loop(child) => child.sample_count(),
                LoopAction::Sweep(sweep) => sweep.point_count(),
            })
            .fold(0, usize::saturating_add);
        self.action_runs().saturating_mul(per_run)
    }
}
