//! Ready-made campaign trees for the two standard measurements.
//!
//! - **Coupling**: step the temperature; at each temperature optionally cycle the
//!   field between two values (magnetic pre-conditioning), measuring after the
//!   cycles listed as break points; each measurement is one full sweep per
//!   selected port pair, in the order the ports are listed.
//! - **FMR**: park the field at zero, go to the start field, then sweep the field
//!   with the network analyzer as a fixed-frequency microwave source.

use serde::{Deserialize, Serialize};

use super::plan::{
    linear_positions, LoopAction, LoopSpec, Nesting, SetPoint, SweepAxis, SweepSpec,
};

/// Temperature staircase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSteps {
    /// First temperature (K)
    pub start: f64,
    /// Last temperature (K)
    pub stop: f64,
    /// Signed step (K)
    pub step: f64,
    /// Ramp rate (K/min)
    pub rate: f64,
}

impl TemperatureSteps {
    /// A single temperature.
    pub fn at(kelvin: f64, rate: f64) -> Self {
        Self {
            start: kelvin,
            stop: kelvin,
            step: 1.0,
            rate,
        }
    }

    fn set_points(&self) -> Vec<SetPoint> {
        linear_positions(self.start, self.stop, self.step)
            .into_iter()
            .map(|t| SetPoint::temperature(t, self.rate))
            .collect()
    }
}

/// Field pre-conditioning cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCycle {
    /// First field of each cycle (Oe)
    pub low: f64,
    /// Second field of each cycle (Oe)
    pub high: f64,
    /// Ramp rate (Oe/s)
    pub rate: f64,
    /// Number of cycles
    pub cycles: u32,
    /// 1-based cycles after which to measure; every cycle when absent
    #[serde(default)]
    pub break_points: Option<Vec<u32>>,
}

/// One sweep per port pair of `sweep`, in the listed order.
pub fn port_sweeps(sweep: &SweepSpec) -> Vec<LoopAction> {
    sweep
        .ports
        .iter()
        .map(|port| LoopAction::Sweep(sweep.clone().with_ports(vec![*port])))
        .collect()
}

/// Temperature scan, optional field cycling, one sweep per port at each stop.
pub fn coupling_campaign(
    temperatures: TemperatureSteps,
    cycle: Option<FieldCycle>,
    sweep: SweepSpec,
) -> LoopSpec {
    let measurements = port_sweeps(&sweep);
    let actions = match cycle {
        Some(cycle) => {
            let node = LoopSpec {
                label: "field_cycle".into(),
                repetitions: cycle.cycles,
                nesting: Nesting::AfterSequence,
                set_points: vec![
                    SetPoint::field(cycle.low, cycle.rate),
                    SetPoint::field(cycle.high, cycle.rate),
                ],
                measure_on: cycle.break_points,
                actions: measurements,
            };
            vec![LoopAction::Loop(Box::new(node))]
        }
        None => measurements,
    };
    LoopSpec {
        label: "temperature".into(),
        repetitions: 1,
        nesting: Nesting::EachSetPoint,
        set_points: temperatures.set_points(),
        measure_on: None,
        actions,
    }
}

/// Field sweep at a fixed source, preceded by a field reset through zero.
///
/// `sweep` must be a field sweep; a frequency sweep is used as given.
pub fn fmr_campaign(sweep: SweepSpec, temperatures: Option<TemperatureSteps>) -> LoopSpec {
    let reset = if sweep.axis == SweepAxis::Field {
        vec![
            SetPoint::field(0.0, sweep.field_rate),
            SetPoint::field(sweep.start, sweep.field_rate),
        ]
    } else {
        Vec::new()
    };
    let fmr = LoopSpec::cycle("field_reset", reset, 1, LoopAction::Sweep(sweep));
    match temperatures {
        Some(temperatures) => LoopSpec::scan(
            "temperature",
            temperatures.set_points(),
            LoopAction::Loop(Box::new(fmr)),
        ),
        None => fmr,
    }
}
