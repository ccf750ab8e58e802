//! Loaded/unloaded Q-factor extraction from complex resonator spectra.
//!
//! The measured response of a single resonance is modelled as
//!
//! ```text
//! S(f) = e^{-jθx} · ( a + d / (1 + 2j·Q_L·t) ),   x = (f - f_c)/f_c,  t = (f - f_L)/f_L
//! ```
//!
//! where `a` is the detuned background, `d` the circle diameter, `θ` the residual
//! cable delay and `f_c` the centre of the analysed span. The fit runs in four
//! stages:
//!
//! 1. **Delay removal**: the unwrapped phase is regressed on the lower and upper
//!    edge windows, the two slopes are averaged and the trace is rotated back.
//! 2. **Initial estimate**: peak and half-power search, refined by a weighted
//!    linear fractional fit `S = (b1 + b2·x) / (1 + b3·x)` solved as complex normal
//!    equations.
//! 3. **Levenberg–Marquardt** over `{Re a, Im a, Re d, Im d, Q_L, x_L, θ}` with an
//!    analytic Jacobian.
//! 4. **Coupling correction**: `Q_c = k·Q_L / (|d|/A)` and `1/Q_0 = 1/Q_L − 1/Q_c`.
//!
//! The engine is stateless; one instance can fit many traces concurrently.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, warn};

use super::linalg;
use crate::data::sample::Trace;
use crate::error::FitError;
use crate::experiment::plan::SweepAxis;
use crate::hardware::PortPair;

/// Fewest points the fit accepts.
pub const MIN_POINTS: usize = 5;

const J: Complex64 = Complex64::new(0.0, 1.0);

/// Coupling geometry of the measured port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Geometry {
    /// One-port reflection (S11), circle diameter `2β/(1+β)`
    Reflection,
    /// Two-port transmission through the resonator (S21)
    #[default]
    Transmission,
    /// Transmission past a side-coupled resonator (dip in S21)
    Notch,
}

impl Geometry {
    fn coupling_factor(self) -> f64 {
        match self {
            Geometry::Reflection => 2.0,
            Geometry::Transmission | Geometry::Notch => 1.0,
        }
    }
}

/// Fit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Coupling geometry; never inferred from the data
    pub geometry: Geometry,
    /// Port to fit; required when the trace holds several
    pub port: Option<PortPair>,
    /// Largest normalised residual still reported as converged
    pub residual_threshold: f64,
    /// Levenberg–Marquardt iteration cap
    pub max_iterations: usize,
    /// Estimate and fit the cable delay
    pub remove_delay: bool,
    /// Share of points on each side used for the delay estimate
    pub edge_fraction: f64,
    /// Only fit points inside `[low, high]` Hz
    pub frequency_window: Option<(f64, f64)>,
    /// Reference magnitude `A`; defaults by geometry when absent
    pub reference_magnitude: Option<f64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            geometry: Geometry::Transmission,
            port: None,
            residual_threshold: 1e-3,
            max_iterations: 200,
            remove_delay: true,
            edge_fraction: 0.1,
            frequency_window: None,
            reference_magnitude: None,
        }
    }
}

impl FitOptions {
    /// Options for `geometry` with every other setting at its default.
    pub fn for_geometry(geometry: Geometry) -> Self {
        Self {
            geometry,
            ..Self::default()
        }
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.residual_threshold.is_finite() && self.residual_threshold > 0.0) {
            return Err(format!(
                "fit.residual_threshold must be positive, got {}",
                self.residual_threshold
            ));
        }
        if self.max_iterations == 0 {
            return Err("fit.max_iterations must be at least 1".to_string());
        }
        if !(self.edge_fraction > 0.0 && self.edge_fraction <= 0.5) {
            return Err(format!(
                "fit.edge_fraction must lie in (0, 0.5], got {}",
                self.edge_fraction
            ));
        }
        if let Some((low, high)) = self.frequency_window {
            if !(low.is_finite() && high.is_finite() && low < high) {
                return Err(format!("fit.frequency_window [{low}, {high}] is empty"));
            }
        }
        if let Some(a) = self.reference_magnitude {
            if !(a.is_finite() && a > 0.0) {
                return Err(format!("fit.reference_magnitude must be positive, got {a}"));
            }
        }
        Ok(())
    }
}

/// Fitted resonator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Loaded resonant frequency (Hz)
    pub f_l: f64,
    /// Loaded quality factor
    pub q_l: f64,
    /// Unloaded quality factor (`INFINITY` when coupling loss exceeds total loss)
    pub q_0: f64,
    /// `Σ|S − model|² / Σ|S|²`
    pub residual: f64,
    /// `residual ≤ residual_threshold`
    pub converged: bool,
    /// External (coupling) quality factor
    pub q_coupling: f64,
    /// Circle diameter `d`, phase referenced to `f_L`
    pub coupling_diameter: Complex64,
    /// Detuned background `a`, phase referenced to `f_L`
    pub offset: Complex64,
    /// Cable delay removed from the data (s)
    pub electrical_delay_s: f64,
    /// Levenberg–Marquardt iterations used
    pub iterations: usize,
}

impl FitResult {
    /// Evaluate the fitted network at `freqs` (Hz).
    pub fn evaluate(&self, freqs: &[f64]) -> Vec<Complex64> {
        freqs
            .iter()
            .map(|&f| {
                let t = (f - self.f_l) / self.f_l;
                let delay = Complex64::from_polar(1.0, -2.0 * PI * self.electrical_delay_s * (f - self.f_l));
                delay * (self.offset + self.coupling_diameter / Complex64::new(1.0, 2.0 * self.q_l * t))
            })
            .collect()
    }
}

/// Resonator Q-factor fit.
#[derive(Debug, Clone, Default)]
pub struct QFitEngine {
    options: FitOptions,
}

/// Model parameters in normalised frequency.
#[derive(Debug, Clone, Copy)]
struct Params {
    a: Complex64,
    d: Complex64,
    q: f64,
    x_l: f64,
    theta: f64,
}

impl Params {
    fn to_vec(self, with_delay: bool) -> Vec<f64> {
        let mut v = vec![self.a.re, self.a.im, self.d.re, self.d.im, self.q, self.x_l];
        if with_delay {
            v.push(self.theta);
        }
        v
    }

    fn from_slice(p: &[f64]) -> Self {
        Self {
            a: Complex64::new(p[0], p[1]),
            d: Complex64::new(p[2], p[3]),
            q: p[4],
            x_l: p[5],
            theta: p.get(6).copied().unwrap_or(0.0),
        }
    }

    fn is_valid(&self) -> bool {
        self.q > 0.0
            && self.x_l > -1.0
            && [self.a.re, self.a.im, self.d.re, self.d.im, self.q, self.x_l, self.theta]
                .iter()
                .all(|v| v.is_finite())
    }

    fn model(&self, x: f64) -> Complex64 {
        let t = (x - self.x_l) / (1.0 + self.x_l);
        let lorentz = Complex64::new(1.0, 2.0 * self.q * t).inv();
        Complex64::from_polar(1.0, -self.theta * x) * (self.a + self.d * lorentz)
    }
}

impl QFitEngine {
    /// Engine with `options`.
    pub fn new(options: FitOptions) -> Self {
        Self { options }
    }

    /// Current options.
    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    /// Fit one recorded frequency sweep.
    pub fn fit(&self, trace: &Trace) -> Result<FitResult, FitError> {
        if trace.axis() != SweepAxis::Frequency {
            return Err(FitError::NotFrequencyAxis);
        }
        let port = match self.options.port {
            Some(port) => {
                if !trace.ports().contains(&port) {
                    return Err(FitError::MissingPort(port));
                }
                port
            }
            None => {
                let ports = trace.ports();
                if ports.len() > 1 {
                    return Err(FitError::AmbiguousPort(ports.len()));
                }
                match ports.into_iter().next() {
                    Some(port) => port,
                    None => {
                        return Err(FitError::InsufficientData {
                            points: 0,
                            required: MIN_POINTS,
                        })
                    }
                }
            }
        };
        self.fit_points(&trace.points(port))
    }

    /// Fit `(frequency Hz, S)` pairs in any order.
    pub fn fit_points(&self, points: &[(f64, Complex64)]) -> Result<FitResult, FitError> {
        let mut points: Vec<(f64, Complex64)> = match self.options.frequency_window {
            Some((low, high)) => points
                .iter()
                .copied()
                .filter(|(f, _)| *f >= low && *f <= high)
                .collect(),
            None => points.to_vec(),
        };
        if points
            .iter()
            .any(|(f, s)| !(f.is_finite() && s.re.is_finite() && s.im.is_finite()))
        {
            return Err(FitError::NonFiniteData);
        }
        if points.len() < MIN_POINTS {
            return Err(FitError::InsufficientData {
                points: points.len(),
                required: MIN_POINTS,
            });
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let f_min = points[0].0;
        let f_max = points[points.len() - 1].0;
        let f_c = 0.5 * (f_min + f_max);
        if f_max <= f_min || f_c <= 0.0 {
            return Err(FitError::DegenerateSweep);
        }

        let x: Vec<f64> = points.iter().map(|(f, _)| (f - f_c) / f_c).collect();
        let raw: Vec<Complex64> = points.iter().map(|(_, s)| *s).collect();

        let theta0 = if self.options.remove_delay {
            edge_phase_slope(&x, &raw, self.options.edge_fraction)
        } else {
            0.0
        };
        let y: Vec<Complex64> = raw
            .iter()
            .zip(&x)
            .map(|(s, xi)| s * Complex64::from_polar(1.0, theta0 * xi))
            .collect();

        let initial = initial_estimate(&x, &y);
        debug!(
            q = initial.q,
            x_l = initial.x_l,
            theta0,
            "Q fit initial estimate"
        );
        let (params, iterations) = self.levenberg_marquardt(&x, &y, initial);

        let sse: f64 = x
            .iter()
            .zip(&y)
            .map(|(xi, yi)| (yi - params.model(*xi)).norm_sqr())
            .sum();
        let power: f64 = y.iter().map(|v| v.norm_sqr()).sum();
        let residual = if power > 0.0 { sse / power } else { f64::INFINITY };

        Ok(self.finish(params, theta0, f_c, residual, iterations))
    }

    /// Evaluate a fitted network at `freqs` (Hz), for overlaying fit and data.
    pub fn model(&self, result: &FitResult, freqs: &[f64]) -> Vec<Complex64> {
        result.evaluate(freqs)
    }

    fn finish(
        &self,
        params: Params,
        theta0: f64,
        f_c: f64,
        residual: f64,
        iterations: usize,
    ) -> FitResult {
        let f_l = f_c * (1.0 + params.x_l);
        let theta_total = theta0 + params.theta;
        let electrical_delay_s = theta_total / (2.0 * PI * f_c);
        // Re-reference the delay phase from f_c to f_L
        let rephase = Complex64::from_polar(1.0, -2.0 * PI * electrical_delay_s * (f_l - f_c));
        let offset = params.a * rephase;
        let coupling_diameter = params.d * rephase;

        let reference = self.options.reference_magnitude.unwrap_or(match self.options.geometry {
            Geometry::Transmission => 1.0,
            Geometry::Reflection | Geometry::Notch => offset.norm(),
        });
        let diameter = coupling_diameter.norm();
        let q_coupling = if diameter > 0.0 && reference > 0.0 {
            self.options.geometry.coupling_factor() * params.q * reference / diameter
        } else {
            f64::INFINITY
        };
        let inverse_q0 = 1.0 / params.q - 1.0 / q_coupling;
        let q_0 = if inverse_q0 > 0.0 {
            1.0 / inverse_q0
        } else {
            warn!(
                q_l = params.q,
                q_coupling,
                "Coupling loss exceeds total loss; check geometry and reference magnitude"
            );
            f64::INFINITY
        };

        let converged = residual <= self.options.residual_threshold;
        if !converged {
            warn!(
                residual,
                threshold = self.options.residual_threshold,
                "Q fit did not converge"
            );
        }

        FitResult {
            f_l,
            q_l: params.q,
            q_0,
            residual,
            converged,
            q_coupling,
            coupling_diameter,
            offset,
            electrical_delay_s,
            iterations,
        }
    }

    fn levenberg_marquardt(&self, x: &[f64], y: &[Complex64], start: Params) -> (Params, usize) {
        let with_delay = self.options.remove_delay;
        let sse = |p: &Params| -> f64 {
            x.iter()
                .zip(y)
                .map(|(xi, yi)| (yi - p.model(*xi)).norm_sqr())
                .sum()
        };

        let mut params = start;
        let mut current = sse(&params);
        let mut lambda = 1e-3;
        let mut iterations = 0;

        while iterations < self.options.max_iterations {
            iterations += 1;
            let (normal, gradient) = normal_equations(x, y, &params, with_delay);

            let n = gradient.len();
            let scale: Vec<f64> = (0..n)
                .map(|i| {
                    let s = normal[i][i].sqrt();
                    if s > 0.0 && s.is_finite() {
                        s
                    } else {
                        1.0
                    }
                })
                .collect();

            let mut improved = false;
            while lambda < 1e16 {
                let damped: Vec<Vec<f64>> = (0..n)
                    .map(|i| {
                        (0..n)
                            .map(|k| {
                                let v = normal[i][k] / (scale[i] * scale[k]);
                                if i == k {
                                    v + lambda
                                } else {
                                    v
                                }
                            })
                            .collect()
                    })
                    .collect();
                let rhs: Vec<f64> = (0..n).map(|i| gradient[i] / scale[i]).collect();

                let Some(step) = linalg::solve(damped, rhs) else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate_vec: Vec<f64> = params
                    .to_vec(with_delay)
                    .iter()
                    .zip(&step)
                    .zip(&scale)
                    .map(|((p, dp), s)| p + dp / s)
                    .collect();
                let candidate = Params::from_slice(&candidate_vec);
                if !candidate.is_valid() {
                    lambda *= 10.0;
                    continue;
                }
                let trial = sse(&candidate);
                if trial < current {
                    let relative_gain = (current - trial) / current.max(f64::MIN_POSITIVE);
                    params = candidate;
                    current = trial;
                    lambda = (lambda / 10.0).max(1e-12);
                    improved = relative_gain > 1e-12;
                    break;
                }
                lambda *= 10.0;
            }

            if !improved || current == 0.0 {
                break;
            }
        }
        (params, iterations)
    }
}

/// `JᵀJ` and `Jᵀr` of the stacked real/imaginary residuals.
fn normal_equations(
    x: &[f64],
    y: &[Complex64],
    p: &Params,
    with_delay: bool,
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let n = if with_delay { 7 } else { 6 };
    let mut normal = vec![vec![0.0; n]; n];
    let mut gradient = vec![0.0; n];
    let mut row = vec![Complex64::new(0.0, 0.0); n];

    for (&xi, &yi) in x.iter().zip(y) {
        let e = Complex64::from_polar(1.0, -p.theta * xi);
        let t = (xi - p.x_l) / (1.0 + p.x_l);
        let l = Complex64::new(1.0, 2.0 * p.q * t).inv();
        let l2 = l * l;
        let m = e * (p.a + p.d * l);

        row[0] = e;
        row[1] = J * e;
        row[2] = e * l;
        row[3] = J * e * l;
        row[4] = e * p.d * (-2.0 * J * t * l2);
        let dt_dxl = -(1.0 + xi) / ((1.0 + p.x_l) * (1.0 + p.x_l));
        row[5] = e * p.d * (-2.0 * J * p.q * l2) * dt_dxl;
        if with_delay {
            row[6] = -J * xi * m;
        }

        let r = yi - m;
        for i in 0..n {
            gradient[i] += row[i].re * r.re + row[i].im * r.im;
            for k in 0..n {
                normal[i][k] += row[i].re * row[k].re + row[i].im * row[k].im;
            }
        }
    }
    (normal, gradient)
}

/// Average phase slope (per unit `x`) of the two edge windows, sign-flipped.
fn edge_phase_slope(x: &[f64], s: &[Complex64], edge_fraction: f64) -> f64 {
    let n = x.len();
    let window = ((edge_fraction * n as f64).ceil() as usize).max(2).min(n / 2);
    if window < 2 {
        return 0.0;
    }
    let phase = unwrap_phase(s);
    let low = slope(&x[..window], &phase[..window]);
    let high = slope(&x[n - window..], &phase[n - window..]);
    -0.5 * (low + high)
}

fn unwrap_phase(s: &[Complex64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(s.len());
    let mut offset = 0.0;
    let mut previous: Option<f64> = None;
    for v in s {
        let raw = v.arg();
        if let Some(prev) = previous {
            let mut delta = raw + offset - prev;
            while delta > PI {
                offset -= 2.0 * PI;
                delta -= 2.0 * PI;
            }
            while delta < -PI {
                offset += 2.0 * PI;
                delta += 2.0 * PI;
            }
        }
        let unwrapped = raw + offset;
        out.push(unwrapped);
        previous = Some(unwrapped);
    }
    out
}

fn slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let (num, den) = x.iter().zip(y).fold((0.0, 0.0), |(num, den), (xi, yi)| {
        (
            num + (xi - mean_x) * (yi - mean_y),
            den + (xi - mean_x) * (xi - mean_x),
        )
    });
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Peak/half-power estimate refined by the weighted linear fractional fit.
fn initial_estimate(x: &[f64], y: &[Complex64]) -> Params {
    let n = x.len();
    let background = 0.5 * (y[0] + y[n - 1]);
    let (peak, peak_height) = y
        .iter()
        .map(|v| (v - background).norm())
        .enumerate()
        .fold((0, 0.0), |best, (i, h)| if h > best.1 { (i, h) } else { best });

    let half = peak_height / 2.0_f64.sqrt();
    let mut lo = peak;
    while lo > 0 && (y[lo - 1] - background).norm() >= half {
        lo -= 1;
    }
    let mut hi = peak;
    while hi + 1 < n && (y[hi + 1] - background).norm() >= half {
        hi += 1;
    }
    let step = (x[n - 1] - x[0]) / (n - 1) as f64;
    let width = (x[hi] - x[lo]).max(step);
    let x_peak = x[peak];
    let q_peak = ((1.0 + x_peak) / width).max(1.0);

    let fallback = Params {
        a: background,
        d: y[peak] - background,
        q: q_peak,
        x_l: x_peak,
        theta: 0.0,
    };

    let mut estimate = fallback;
    for _ in 0..3 {
        match linear_fractional_fit(x, y, &estimate) {
            Some(refined) => estimate = refined,
            None => break,
        }
    }
    estimate
}

/// One weighted pass of `y = b1 + b2·x − b3·x·y`.
fn linear_fractional_fit(x: &[f64], y: &[Complex64], guess: &Params) -> Option<Params> {
    let columns = |xi: f64, yi: Complex64| [Complex64::new(1.0, 0.0), Complex64::new(xi, 0.0), -xi * yi];

    let weights: Vec<f64> = x
        .iter()
        .map(|&xi| {
            let t = (xi - guess.x_l) / (1.0 + guess.x_l);
            1.0 / (1.0 + 4.0 * guess.q * guess.q * t * t)
        })
        .collect();

    let mut scale = [0.0_f64; 3];
    for ((&xi, &yi), w) in x.iter().zip(y).zip(&weights) {
        for (s, u) in scale.iter_mut().zip(columns(xi, yi)) {
            *s += w * u.norm_sqr();
        }
    }
    if scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return None;
    }
    let scale = scale.map(f64::sqrt);

    let zero = Complex64::new(0.0, 0.0);
    let mut normal = vec![vec![zero; 3]; 3];
    let mut rhs = vec![zero; 3];
    for ((&xi, &yi), w) in x.iter().zip(y).zip(&weights) {
        let u = columns(xi, yi);
        for i in 0..3 {
            let ui = u[i] / scale[i];
            rhs[i] += ui.conj() * yi * *w;
            for k in 0..3 {
                normal[i][k] += ui.conj() * (u[k] / scale[k]) * *w;
            }
        }
    }

    let solution = linalg::solve(normal, rhs)?;
    let b1 = solution[0] / scale[0];
    let b2 = solution[1] / scale[1];
    let b3 = solution[2] / scale[2];
    if b3.norm() == 0.0 {
        return None;
    }

    let inv_b3 = b3.inv();
    let x_l = -inv_b3.re;
    let q = -(1.0 + x_l) / (2.0 * inv_b3.im);
    let a = b2 / b3;
    let d = (b1 - a) * (Complex64::new(1.0, 0.0) - 2.0 * J * q * x_l / (1.0 + x_l));

    let params = Params {
        a,
        d,
        q,
        x_l,
        theta: 0.0,
    };
    if params.is_valid() && x_l >= x[0] - (x[x.len() - 1] - x[0]) && x_l <= 2.0 * x[x.len() - 1] - x[0] {
        Some(params)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lorentzian(f_l: f64, q_l: f64, d: Complex64, a: Complex64, f: f64) -> Complex64 {
        a + d / Complex64::new(1.0, 2.0 * q_l * (f - f_l) / f_l)
    }

    fn synthetic(n: usize) -> Vec<(f64, Complex64)> {
        let d = Complex64::new(1.0 / 6.0, 0.0);
        let a = Complex64::new(0.0, 0.0);
        (0..n)
            .map(|i| {
                let f = 1.999e9 + 2.0e6 * i as f64 / (n - 1) as f64;
                (f, lorentzian(2.0e9, 1.0e4, d, a, f))
            })
            .collect()
    }

    #[test]
    fn test_phase_unwrap_is_continuous() {
        let s: Vec<Complex64> = (0..50)
            .map(|i| Complex64::from_polar(1.0, -0.3 * i as f64))
            .collect();
        let phase = unwrap_phase(&s);
        for (i, p) in phase.iter().enumerate() {
            assert!((p + 0.3 * i as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn test_linear_fractional_fit_is_exact_on_clean_data() {
        let points = synthetic(41);
        let f_c = 2.0e9;
        let x: Vec<f64> = points.iter().map(|(f, _)| (f - f_c) / f_c).collect();
        let y: Vec<Complex64> = points.iter().map(|(_, s)| *s).collect();
        let estimate = initial_estimate(&x, &y);
        assert!((estimate.q - 1.0e4).abs() / 1.0e4 < 1e-6);
        assert!(estimate.x_l.abs() < 1e-12);
        assert!((estimate.d - Complex64::new(1.0 / 6.0, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn test_model_reproduces_fit_input() {
        let engine = QFitEngine::new(FitOptions::default());
        let points = synthetic(101);
        let result = engine.fit_points(&points).unwrap();
        let freqs: Vec<f64> = points.iter().map(|(f, _)| *f).collect();
        let model = engine.model(&result, &freqs);
        for ((_, measured), fitted) in points.iter().zip(model) {
            assert!((measured - fitted).norm() < 1e-6);
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(FitOptions::default().validate().is_ok());
        let bad = FitOptions {
            edge_fraction: 0.9,
            ..FitOptions::default()
        };
        assert!(bad.validate().is_err());
        let bad = FitOptions {
            frequency_window: Some((2.0e9, 1.0e9)),
            ..FitOptions::default()
        };
        assert!(bad.validate().is_err());
    }
}
