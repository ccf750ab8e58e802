//! Atomic Instrument Capabilities
//!
//! This module defines fine-grained capability traits that instruments implement.
//! Instead of one monolithic "measurement station" object with dozens of methods,
//! each device implements only what it actually does:
//!
//! - A PPMS implements: `FieldControl + TemperatureControl`
//! - A vector network analyzer implements: `NetworkAnalyzer`
//! - A simple electromagnet with a Hall probe might implement only `FieldControl`
//!
//! This keeps the orchestration code hardware-agnostic and lets every capability
//! be mocked on its own.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns typed [`InstrumentError`]s so callers can tell timeouts from transient faults
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn park<P: FieldControl + TemperatureControl>(ppms: &P) -> Result<(), InstrumentError> {
//!     ppms.set_field(0.0, 200.0).await?;
//!     ppms.set_temperature(300.0, 5.0).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use num_complex::Complex64;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{PortPair, SafeRange};
use crate::error::InstrumentError;

/// Capability: Magnetic Field Control
///
/// Superconducting magnets and electromagnets.
///
/// # Contract
/// - Field in Oe, ramp rate in Oe/s
/// - `set_field` blocks until the instrument reports the field stable, or fails with
///   [`InstrumentError::Timeout`]
/// - `field` returns the field as currently read back
#[async_trait]
pub trait FieldControl: Send + Sync {
    /// Ramp to `oe` at `rate_oe_per_s` and wait until settled.
    async fn set_field(&self, oe: f64, rate_oe_per_s: f64) -> Result<(), InstrumentError>;

    /// Read back the present field.
    async fn field(&self) -> Result<f64, InstrumentError>;

    /// Range the magnet may be commanded to.
    fn field_range(&self) -> SafeRange {
        SafeRange::unbounded()
    }
}

/// Capability: Sample Temperature Control
///
/// # Contract
/// - Temperature in K, ramp rate in K/min
/// - `set_temperature` blocks until the temperature is stable, or fails with
///   [`InstrumentError::Timeout`]
#[async_trait]
pub trait TemperatureControl: Send + Sync {
    /// Ramp to `kelvin` at `rate_k_per_min` and wait until settled.
    async fn set_temperature(&self, kelvin: f64, rate_k_per_min: f64)
        -> Result<(), InstrumentError>;

    /// Read back the present temperature.
    async fn temperature(&self) -> Result<f64, InstrumentError>;

    /// Range the cryostat may be commanded to.
    fn temperature_range(&self) -> SafeRange {
        SafeRange::unbounded()
    }
}

/// Capability: Scattering-Parameter Acquisition
///
/// Vector network analyzers, also used as a CW microwave source for FMR.
///
/// # Contract
/// - `configure_source` sets the CW frequency (Hz) and power (dBm) used for the next
///   acquisition
/// - `acquire_s_parameters` clears averaging, integrates for `dwell`, and returns one
///   complex value per requested port pair
/// - Transient failures are reported as [`InstrumentError::Acquisition`]
#[async_trait]
pub trait NetworkAnalyzer: Send + Sync {
    /// Set source frequency and power.
    async fn configure_source(&self, freq_hz: f64, power_dbm: f64) -> Result<(), InstrumentError>;

    /// Acquire the requested port pairs.
    async fn acquire_s_parameters(
        &self,
        ports: &[PortPair],
        dwell: Duration,
    ) -> Result<BTreeMap<PortPair, Complex64>, InstrumentError>;
}

/// Combined trait for instruments that control both field and temperature.
///
/// This trait exists solely to enable trait objects. Implement the individual
/// traits and get this automatically via blanket impl.
pub trait Ppms: FieldControl + TemperatureControl {}

/// Blanket implementation - any type implementing both traits gets Ppms for free
impl<T: FieldControl + TemperatureControl> Ppms for T {}

/// Campaign locks, one per live instrument, keyed by the instrument's address.
///
/// Entries are weak: a lock lives as long as some [`InstrumentSet`] holds it, and
/// every set holds its instruments, so an address cannot be reused while its lock
/// is alive.
type LockRegistry = std::sync::Mutex<HashMap<usize, Weak<Mutex<()>>>>;

fn lock_registry() -> &'static LockRegistry {
    static REGISTRY: OnceLock<LockRegistry> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

fn instrument_key<T: ?Sized>(instrument: &Arc<T>) -> usize {
    Arc::as_ptr(instrument).cast::<()>() as usize
}

/// Campaign lock shared by every [`InstrumentSet`] built over the instrument at `key`.
fn instrument_lock(key: usize) -> Arc<Mutex<()>> {
    let mut registry = lock_registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(lock) = registry.get(&key).and_then(Weak::upgrade) {
        return lock;
    }
    registry.retain(|_, lock| lock.strong_count() > 0);
    let lock = Arc::new(Mutex::new(()));
    registry.insert(key, Arc::downgrade(&lock));
    lock
}

/// The instruments driven by one campaign.
///
/// The exclusive lease belongs to the instruments themselves: every set built over
/// the same PPMS or network analyzer `Arc`, and every clone of such a set, contends
/// for the same lock, so only one campaign may drive an instrument at a time.
#[derive(Clone)]
pub struct InstrumentSet {
    /// Field and temperature source
    pub ppms: Arc<dyn Ppms>,
    /// Network analyzer / microwave source
    pub vna: Arc<dyn NetworkAnalyzer>,
    locks: Vec<Arc<Mutex<()>>>,
}

/// Proof of exclusive access to an [`InstrumentSet`]. Released on drop.
pub struct InstrumentLease {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl InstrumentSet {
    /// Bundle a PPMS and a network analyzer.
    pub fn new(ppms: Arc<dyn Ppms>, vna: Arc<dyn NetworkAnalyzer>) -> Self {
        let ppms_key = instrument_key(&ppms);
        let vna_key = instrument_key(&vna);
        let mut locks = vec![instrument_lock(ppms_key)];
        // One device may serve as both PPMS and analyzer
        if vna_key != ppms_key {
            locks.push(instrument_lock(vna_key));
        }
        Self { ppms, vna, locks }
    }

    /// Take the exclusive lease on every instrument without waiting.
    ///
    /// Returns `None` when another campaign already holds any of them.
    pub fn try_lease(&self) -> Option<InstrumentLease> {
        let guards = self
            .locks
            .iter()
            .map(|lock| Arc::clone(lock).try_lock_owned().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(InstrumentLease { _guards: guards })
    }

    /// True while a campaign holds the lease on any of the instruments.
    pub fn is_leased(&self) -> bool {
        self.locks.iter().any(|lock| lock.try_lock().is_err())
    }
}
