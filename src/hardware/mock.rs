//! Mock Instrument Implementations
//!
//! Provides simulated instruments for testing without a cryostat or network analyzer.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockPpms` - Simulated field/temperature source with ramp timing and a command log
//! - `MockVna` - Simulated network analyzer measuring a single resonator, with scripted faults
//!
//! # Timing
//!
//! Ramp time is `|Δ| / rate`, multiplied by `time_scale`. A `time_scale` of zero
//! (the default) makes every command complete immediately.

use async_trait::async_trait;
use num_complex::Complex64;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::debug;

use super::capabilities::{FieldControl, NetworkAnalyzer, TemperatureControl};
use super::{PortPair, SafeRange};
use crate::error::InstrumentError;

/// Command received by [`MockPpms`], in arrival order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PpmsCommand {
    /// `set_field(target, rate)`
    Field {
        /// Oe
        target: f64,
        /// Oe/s
        rate: f64,
    },
    /// `set_temperature(target, rate)`
    Temperature {
        /// K
        target: f64,
        /// K/min
        rate: f64,
    },
}

// =============================================================================
// MockPpms - Simulated field and temperature source
// =============================================================================

/// Mock PPMS with ramp timing and fault injection.
///
/// # Example
///
/// ```rust,ignore
/// let ppms = MockPpms::new();
/// ppms.set_field(1000.0, 200.0).await?;
/// assert_eq!(ppms.field().await?, 1000.0);
/// ```
pub struct MockPpms {
    field_oe: RwLock<f64>,
    temperature_k: RwLock<f64>,
    field_range: SafeRange,
    temperature_range: SafeRange,
    time_scale: f64,
    field_timeouts: Mutex<Vec<f64>>,
    temperature_timeouts: Mutex<Vec<f64>>,
    commands: Mutex<Vec<PpmsCommand>>,
}

impl MockPpms {
    /// Mock at 0 Oe and 300 K, 9 T magnet, 1.8–400 K cryostat, instant ramps.
    pub fn new() -> Self {
        Self {
            field_oe: RwLock::new(0.0),
            temperature_k: RwLock::new(300.0),
            field_range: SafeRange::new(-90_000.0, 90_000.0),
            temperature_range: SafeRange::new(1.8, 400.0),
            time_scale: 0.0,
            field_timeouts: Mutex::new(Vec::new()),
            temperature_timeouts: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Scale simulated ramp times (1.0 = real time).
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale.max(0.0);
        self
    }

    /// Override the declared field range.
    pub fn with_field_range(mut self, range: SafeRange) -> Self {
        self.field_range = range;
        self
    }

    /// Make the next command to `target` Oe time out.
    pub fn fail_field_at(&self, target: f64) {
        lock(&self.field_timeouts).push(target);
    }

    /// Make the next command to `target` K time out.
    pub fn fail_temperature_at(&self, target: f64) {
        lock(&self.temperature_timeouts).push(target);
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<PpmsCommand> {
        lock(&self.commands).clone()
    }

    async fn ramp(&self, distance: f64, rate_per_s: f64) {
        if self.time_scale > 0.0 && rate_per_s > 0.0 {
            let secs = distance.abs() / rate_per_s * self.time_scale;
            sleep(Duration::from_secs_f64(secs)).await;
        }
    }
}

impl Default for MockPpms {
    fn default() -> Self {
        Self::new()
    }
}

fn take_fault(faults: &Mutex<Vec<f64>>, target: f64) -> bool {
    let mut faults = lock(faults);
    match faults.iter().position(|t| (t - target).abs() < 1e-9) {
        Some(idx) => {
            faults.remove(idx);
            true
        }
        None => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl FieldControl for MockPpms {
    async fn set_field(&self, oe: f64, rate_oe_per_s: f64) -> Result<(), InstrumentError> {
        lock(&self.commands).push(PpmsCommand::Field {
            target: oe,
            rate: rate_oe_per_s,
        });
        if !self.field_range.contains(oe) {
            return Err(InstrumentError::Command {
                instrument: "MockPpms".into(),
                reason: format!("field {oe} Oe outside magnet range"),
            });
        }
        if take_fault(&self.field_timeouts, oe) {
            return Err(InstrumentError::Timeout {
                instrument: "MockPpms".into(),
                operation: format!("set_field({oe})"),
            });
        }

        let current = *self.field_oe.read().await;
        self.ramp(oe - current, rate_oe_per_s).await;
        *self.field_oe.write().await = oe;
        debug!(field_oe = oe, "MockPpms: field settled");
        Ok(())
    }

    async fn field(&self) -> Result<f64, InstrumentError> {
        Ok(*self.field_oe.read().await)
    }

    fn field_range(&self) -> SafeRange {
        self.field_range
    }
}

#[async_trait]
impl TemperatureControl for MockPpms {
    async fn set_temperature(
        &self,
        kelvin: f64,
        rate_k_per_min: f64,
    ) -> Result<(), InstrumentError> {
        lock(&self.commands).push(PpmsCommand::Temperature {
            target: kelvin,
            rate: rate_k_per_min,
        });
        if take_fault(&self.temperature_timeouts, kelvin) {
            return Err(InstrumentError::Timeout {
                instrument: "MockPpms".into(),
                operation: format!("set_temperature({kelvin})"),
            });
        }

        let current = *self.temperature_k.read().await;
        self.ramp(kelvin - current, rate_k_per_min / 60.0).await;
        *self.temperature_k.write().await = kelvin;
        debug!(temperature_k = kelvin, "MockPpms: temperature settled");
        Ok(())
    }

    async fn temperature(&self) -> Result<f64, InstrumentError> {
        Ok(*self.temperature_k.read().await)
    }

    fn temperature_range(&self) -> SafeRange {
        self.temperature_range
    }
}

// =============================================================================
// MockVna - Simulated network analyzer
// =============================================================================

/// Scripted acquisition fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// Acquisition fails with a retryable error
    Transient,
    /// Acquisition times out
    Timeout,
}

/// Resonator simulated by [`MockVna`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resonance {
    /// Loaded resonant frequency (Hz)
    pub f_l: f64,
    /// Loaded quality factor
    pub q_l: f64,
    /// Complex circle diameter
    pub diameter: Complex64,
    /// Detuned background
    pub offset: Complex64,
    /// Cable delay (s)
    pub delay_s: f64,
}

impl Resonance {
    /// Evaluate the resonator response at `freq_hz`.
    pub fn response(&self, freq_hz: f64) -> Complex64 {
        let t = (freq_hz - self.f_l) / self.f_l;
        let lorentz = self.diameter / Complex64::new(1.0, 2.0 * self.q_l * t);
        let delay = Complex64::from_polar(1.0, -2.0 * PI * self.delay_s * freq_hz);
        delay * (self.offset + lorentz)
    }
}

impl Default for Resonance {
    fn default() -> Self {
        // Transmission resonator with Q_L = 10 000, Q_0 = 12 000.
        Self {
            f_l: 2.0e9,
            q_l: 10_000.0,
            diameter: Complex64::new(1.0 / 6.0, 0.0),
            offset: Complex64::new(0.0, 0.0),
            delay_s: 0.0,
        }
    }
}

/// Mock network analyzer measuring one resonator at the configured CW frequency.
///
/// Faults can be scheduled on specific acquisition calls (counted from 1).
pub struct MockVna {
    resonance: Resonance,
    source: RwLock<(f64, f64)>,
    noise: f64,
    time_scale: f64,
    calls: AtomicU64,
    faults: Mutex<HashMap<u64, MockFault>>,
}

impl MockVna {
    /// Mock measuring the default resonator with no noise.
    pub fn new() -> Self {
        Self::with_resonance(Resonance::default())
    }

    /// Mock measuring `resonance`.
    pub fn with_resonance(resonance: Resonance) -> Self {
        Self {
            resonance,
            source: RwLock::new((resonance.f_l, -10.0)),
            noise: 0.0,
            time_scale: 0.0,
            calls: AtomicU64::new(0),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Add uniform noise of amplitude `amplitude` to each quadrature.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// Scale simulated dwell times (1.0 = real time).
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale.max(0.0);
        self
    }

    /// Fail acquisition call number `call` (1-based) with `fault`.
    pub fn fail_call(&self, call: u64, fault: MockFault) {
        lock(&self.faults).insert(call, fault);
    }

    /// Number of acquisition calls made so far, failed ones included.
    pub fn acquisition_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Present source frequency and power.
    pub async fn source(&self) -> (f64, f64) {
        *self.source.read().await
    }
}

impl Default for MockVna {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkAnalyzer for MockVna {
    async fn configure_source(&self, freq_hz: f64, power_dbm: f64) -> Result<(), InstrumentError> {
        if !(freq_hz.is_finite() && freq_hz > 0.0) {
            return Err(InstrumentError::Command {
                instrument: "MockVna".into(),
                reason: format!("invalid source frequency {freq_hz}"),
            });
        }
        *self.source.write().await = (freq_hz, power_dbm);
        Ok(())
    }

    async fn acquire_s_parameters(
        &self,
        ports: &[PortPair],
        dwell: Duration,
    ) -> Result<BTreeMap<PortPair, Complex64>, InstrumentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.time_scale > 0.0 {
            sleep(dwell.mul_f64(self.time_scale)).await;
        }

        match lock(&self.faults).remove(&call) {
            Some(MockFault::Transient) => {
                return Err(InstrumentError::Acquisition(format!(
                    "MockVna: scripted transient fault on call {call}"
                )))
            }
            Some(MockFault::Timeout) => {
                return Err(InstrumentError::Timeout {
                    instrument: "MockVna".into(),
                    operation: format!("acquisition call {call}"),
                })
            }
            None => {}
        }

        let (freq, _power) = *self.source.read().await;
        let clean = self.resonance.response(freq);
        let mut rng = rand::thread_rng();
        let mut values = BTreeMap::new();
        for port in ports {
            let value = if port.is_reflection() {
                // Off-resonance reflection from an undercoupled port
                Complex64::new(-1.0, 0.0) + clean
            } else {
                clean
            };
            let noisy = if self.noise > 0.0 {
                value
                    + Complex64::new(
                        rng.gen_range(-self.noise..self.noise),
                        rng.gen_range(-self.noise..self.noise),
                    )
            } else {
                value
            };
            values.insert(*port, noisy);
        }
        Ok(values)
    }
}
