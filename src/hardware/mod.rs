//! Instrument abstractions.
//!
//! The measurement core only talks to instruments through the capability traits in
//! [`capabilities`]. Transport layers (GPIB/VISA for the network analyzer, the PPMS
//! network client) live outside this crate and implement those traits. [`mock`]
//! provides deterministic simulated instruments for tests and dry runs.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    FieldControl, InstrumentLease, InstrumentSet, NetworkAnalyzer, Ppms, TemperatureControl,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scattering-parameter port pair, written `S<receiver><source>` (e.g. `S21`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PortPair {
    /// Port the wave is measured at
    pub receiver: u8,
    /// Port the wave is launched from
    pub source: u8,
}

impl PortPair {
    /// Reflection at port 1
    pub const S11: PortPair = PortPair::new(1, 1);
    /// Transmission from port 1 to port 2
    pub const S21: PortPair = PortPair::new(2, 1);
    /// Transmission from port 2 to port 1
    pub const S12: PortPair = PortPair::new(1, 2);
    /// Reflection at port 2
    pub const S22: PortPair = PortPair::new(2, 2);

    /// Create a port pair.
    pub const fn new(receiver: u8, source: u8) -> Self {
        Self { receiver, source }
    }

    /// True for `Sii` parameters.
    pub fn is_reflection(&self) -> bool {
        self.receiver == self.source
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}{}", self.receiver, self.source)
    }
}

impl FromStr for PortPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('S')
            .or_else(|| s.strip_prefix('s'))
            .ok_or_else(|| format!("port pair '{s}' must start with 'S'"))?;
        let mut chars = digits.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(r), Some(src), None) => {
                let receiver = r
                    .to_digit(10)
                    .filter(|d| *d > 0)
                    .ok_or_else(|| format!("invalid receiver port in '{s}'"))?;
                let source = src
                    .to_digit(10)
                    .filter(|d| *d > 0)
                    .ok_or_else(|| format!("invalid source port in '{s}'"))?;
                Ok(PortPair::new(receiver as u8, source as u8))
            }
            _ => Err(format!("port pair '{s}' must look like S21")),
        }
    }
}

impl From<PortPair> for String {
    fn from(value: PortPair) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for PortPair {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Closed interval an instrument declares safe to command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafeRange {
    /// Lower bound (inclusive)
    pub min: f64,
    /// Upper bound (inclusive)
    pub max: f64,
}

impl SafeRange {
    /// Create a range.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Unbounded range.
    pub const fn unbounded() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }

    /// True when `value` lies inside the range.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}
