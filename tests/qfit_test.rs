//! Integration tests for QFitEngine
//!
//! Synthetic spectra come from the mock analyzer's resonator model, so the
//! expected Q values follow directly from the simulated parameters.

use fmr_daq::analysis::{FitOptions, Geometry, QFitEngine};
use fmr_daq::data::{DataRecorder, SetPointContext, Trace, TraceFilter};
use fmr_daq::error::FitError;
use fmr_daq::experiment::{RetryPolicy, SweepAxis, SweepController, SweepSpec};
use fmr_daq::hardware::mock::{MockPpms, MockVna, Resonance};
use fmr_daq::hardware::{InstrumentSet, PortPair};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn spectrum(resonance: &Resonance, points: usize, span_hz: f64) -> Vec<(f64, Complex64)> {
    let start = resonance.f_l - span_hz / 2.0;
    (0..points)
        .map(|i| {
            let f = start + span_hz * i as f64 / (points - 1) as f64;
            (f, resonance.response(f))
        })
        .collect()
}

fn trace(points: &[(f64, Complex64)]) -> Trace {
    Trace::from_points(SweepAxis::Frequency, PortPair::S21, points)
}

fn assert_close(got: f64, want: f64, rel: f64, what: &str) {
    assert!(
        ((got - want) / want).abs() <= rel,
        "{what}: got {got}, want {want} (±{:.2}%)",
        rel * 100.0
    );
}

// =============================================================================
// Accuracy
// =============================================================================

#[test]
fn test_transmission_recovers_loaded_and_unloaded_q() {
    let resonance = Resonance::default();
    let points = spectrum(&resonance, 201, 4.0e6);
    let engine = QFitEngine::new(FitOptions::for_geometry(Geometry::Transmission));

    let result = engine.fit(&trace(&points)).unwrap();

    assert!(result.converged, "residual {}", result.residual);
    assert_close(result.q_l, 10_000.0, 0.01, "Q_L");
    assert_close(result.q_0, 12_000.0, 0.01, "Q_0");
    assert_close(result.q_coupling, 60_000.0, 0.01, "Q_c");
    assert!((result.f_l - 2.0e9).abs() < 2.0e9 / 10_000.0 * 0.01);
    assert!(result.residual < 1e-8);
}

#[test]
fn test_reflection_geometry() {
    let resonance = Resonance {
        offset: Complex64::new(-1.0, 0.0),
        ..Resonance::default()
    };
    let points = spectrum(&resonance, 201, 4.0e6);
    let engine = QFitEngine::new(FitOptions::for_geometry(Geometry::Reflection));

    let result = engine.fit(&trace(&points)).unwrap();

    // Q_c = 2·Q_L·|a|/|d| = 120 000, 1/Q_0 = 1/Q_L − 1/Q_c
    assert!(result.converged);
    assert_close(result.q_l, 10_000.0, 0.01, "Q_L");
    assert_close(result.q_coupling, 120_000.0, 0.01, "Q_c");
    assert_close(result.q_0, 120_000.0 / 11.0, 0.01, "Q_0");
}

#[test]
fn test_notch_geometry() {
    let resonance = Resonance {
        offset: Complex64::new(1.0, 0.0),
        diameter: Complex64::new(-0.4, 0.0),
        ..Resonance::default()
    };
    let points = spectrum(&resonance, 201, 4.0e6);
    let engine = QFitEngine::new(FitOptions::for_geometry(Geometry::Notch));

    let result = engine.fit(&trace(&points)).unwrap();

    assert_close(result.q_l, 10_000.0, 0.01, "Q_L");
    assert_close(result.q_coupling, 25_000.0, 0.01, "Q_c");
    assert_close(result.q_0, 1.0 / (1.0e-4 - 4.0e-5), 0.01, "Q_0");
}

#[test]
fn test_cable_delay_is_removed() {
    let resonance = Resonance {
        delay_s: 5.0e-9,
        ..Resonance::default()
    };
    let points = spectrum(&resonance, 201, 4.0e6);
    let engine = QFitEngine::new(FitOptions::default());

    let result = engine.fit(&trace(&points)).unwrap();

    assert!(result.converged, "residual {}", result.residual);
    assert_close(result.q_l, 10_000.0, 0.01, "Q_L");
    assert_close(result.q_0, 12_000.0, 0.01, "Q_0");
    assert!((result.electrical_delay_s - 5.0e-9).abs() < 5.0e-11);
}

#[test]
fn test_seeded_noise_within_one_percent() {
    let resonance = Resonance::default();
    let mut rng = StdRng::seed_from_u64(7);
    let points: Vec<(f64, Complex64)> = spectrum(&resonance, 401, 4.0e6)
        .into_iter()
        .map(|(f, s)| {
            let noise = Complex64::new(rng.gen_range(-1e-3..1e-3), rng.gen_range(-1e-3..1e-3));
            (f, s + noise)
        })
        .collect();
    let engine = QFitEngine::new(FitOptions::default());

    let result = engine.fit(&trace(&points)).unwrap();

    assert_close(result.q_l, 10_000.0, 0.01, "Q_L");
    assert_close(result.q_0, 12_000.0, 0.01, "Q_0");
}

#[test]
fn test_fit_model_overlays_data() {
    let resonance = Resonance {
        delay_s: 1.0e-9,
        ..Resonance::default()
    };
    let points = spectrum(&resonance, 101, 4.0e6);
    let engine = QFitEngine::new(FitOptions::default());
    let result = engine.fit(&trace(&points)).unwrap();

    let freqs: Vec<f64> = points.iter().map(|(f, _)| *f).collect();
    let model = engine.model(&result, &freqs);
    assert_eq!(model.len(), points.len());
    for ((_, measured), fitted) in points.iter().zip(&model) {
        assert!((measured - fitted).norm() < 1e-5);
    }
}

#[test]
#[traced_test]
fn test_overcoupled_reference_gives_infinite_q0() {
    let points = spectrum(&Resonance::default(), 201, 4.0e6);
    let engine = QFitEngine::new(FitOptions {
        reference_magnitude: Some(0.1),
        ..FitOptions::default()
    });

    let result = engine.fit(&trace(&points)).unwrap();
    assert_close(result.q_l, 10_000.0, 0.01, "Q_L");
    assert!(result.q_0.is_infinite());
    assert!(logs_contain("Coupling loss exceeds total loss"));
}

#[test]
fn test_frequency_window_selects_one_resonance() {
    let first = Resonance::default();
    let second = Resonance {
        f_l: 2.05e9,
        q_l: 2_000.0,
        ..Resonance::default()
    };
    let points: Vec<(f64, Complex64)> = (0..2001)
        .map(|i| {
            let f = 1.99e9 + 7.0e7 * i as f64 / 2000.0;
            (f, first.response(f) + second.response(f))
        })
        .collect();
    let engine = QFitEngine::new(FitOptions {
        frequency_window: Some((1.998e9, 2.002e9)),
        ..FitOptions::default()
    });

    let result = engine.fit(&trace(&points)).unwrap();
    assert!((result.f_l - 2.0e9).abs() < 1.0e4);
    assert_close(result.q_l, 10_000.0, 0.01, "Q_L");
}

#[test]
fn test_fit_is_deterministic() {
    let points = spectrum(&Resonance::default(), 201, 4.0e6);
    let engine = QFitEngine::new(FitOptions::default());

    let first = engine.fit(&trace(&points)).unwrap();
    let second = engine.fit(&trace(&points)).unwrap();
    assert_eq!(first, second);

    let mut shuffled = points.clone();
    shuffled.reverse();
    assert_eq!(engine.fit_points(&shuffled).unwrap(), first);
}

#[test]
fn test_non_converged_fit_still_returns_parameters() {
    let mut rng = StdRng::seed_from_u64(11);
    let points: Vec<(f64, Complex64)> = spectrum(&Resonance::default(), 201, 4.0e6)
        .into_iter()
        .map(|(f, s)| {
            (
                f,
                s + Complex64::new(rng.gen_range(-1e-2..1e-2), rng.gen_range(-1e-2..1e-2)),
            )
        })
        .collect();
    let engine = QFitEngine::new(FitOptions {
        residual_threshold: 1e-9,
        ..FitOptions::default()
    });

    let result = engine.fit(&trace(&points)).unwrap();
    assert!(!result.converged);
    assert!(result.residual > 1e-9);
    assert!(result.q_l.is_finite() && result.q_l > 0.0);
}

#[test]
fn test_parallel_fits_share_one_engine() {
    let engine = Arc::new(QFitEngine::new(FitOptions::default()));
    let handles: Vec<_> = [5_000.0, 10_000.0, 20_000.0, 40_000.0]
        .into_iter()
        .map(|q_l| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let resonance = Resonance {
                    q_l,
                    ..Resonance::default()
                };
                let span = 40.0 * resonance.f_l / q_l;
                let result = engine
                    .fit(&trace(&spectrum(&resonance, 201, span)))
                    .unwrap();
                (q_l, result.q_l)
            })
        })
        .collect();

    for handle in handles {
        let (want, got) = handle.join().unwrap();
        assert_close(got, want, 0.01, "Q_L");
    }
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_too_few_points() {
    let engine = QFitEngine::new(FitOptions::default());
    for n in [3, 4] {
        let points = spectrum(&Resonance::default(), n, 4.0e6);
        let err = engine.fit(&trace(&points)).unwrap_err();
        assert!(
            matches!(err, FitError::InsufficientData { points, required: 5 } if points == n),
            "{err}"
        );
    }
    assert!(engine
        .fit(&trace(&spectrum(&Resonance::default(), 5, 4.0e6)))
        .is_ok());
}

#[test]
fn test_window_leaving_too_few_points() {
    let points = spectrum(&Resonance::default(), 201, 4.0e6);
    let engine = QFitEngine::new(FitOptions {
        frequency_window: Some((2.0e9, 2.00003e9)),
        ..FitOptions::default()
    });
    assert!(matches!(
        engine.fit(&trace(&points)),
        Err(FitError::InsufficientData { .. })
    ));
}

#[test]
fn test_degenerate_sweep() {
    let points = vec![(2.0e9, Complex64::new(0.1, 0.0)); 8];
    let engine = QFitEngine::new(FitOptions::default());
    assert!(matches!(
        engine.fit(&trace(&points)),
        Err(FitError::DegenerateSweep)
    ));
}

#[test]
fn test_non_finite_data() {
    let mut points = spectrum(&Resonance::default(), 21, 4.0e6);
    points[10].1 = Complex64::new(f64::NAN, 0.0);
    let engine = QFitEngine::new(FitOptions::default());
    assert!(matches!(
        engine.fit(&trace(&points)),
        Err(FitError::NonFiniteData)
    ));
}

#[test]
fn test_field_sweep_is_rejected() {
    let points = spectrum(&Resonance::default(), 21, 4.0e6);
    let field_trace = Trace::from_points(SweepAxis::Field, PortPair::S21, &points);
    let engine = QFitEngine::new(FitOptions::default());
    assert!(matches!(
        engine.fit(&field_trace),
        Err(FitError::NotFrequencyAxis)
    ));
}

#[test]
fn test_missing_port() {
    let points = spectrum(&Resonance::default(), 21, 4.0e6);
    let engine = QFitEngine::new(FitOptions {
        port: Some(PortPair::S11),
        ..FitOptions::default()
    });
    assert!(matches!(
        engine.fit(&trace(&points)),
        Err(FitError::MissingPort(PortPair::S11))
    ));
}

// =============================================================================
// End to end: sweep -> recorder -> fit
// =============================================================================

#[tokio::test]
async fn test_fit_recorded_frequency_sweep() {
    let instruments = InstrumentSet::new(Arc::new(MockPpms::new()), Arc::new(MockVna::new()));
    let recorder = Arc::new(DataRecorder::new());
    let controller = SweepController::new(instruments, recorder.clone()).with_retry_policy(
        RetryPolicy {
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        },
    );
    let spec = SweepSpec::frequency(1.998e9, 2.002e9, 2.0e4, -10.0)
        .with_ports(vec![PortPair::S11, PortPair::S21]);
    controller
        .run_to_end(&spec, SetPointContext::root())
        .await
        .unwrap();

    let trace = recorder.read_trace(&TraceFilter::new()).await.unwrap();
    assert_eq!(trace.len(), 201);

    let ambiguous = QFitEngine::new(FitOptions::default()).fit(&trace);
    assert!(matches!(ambiguous, Err(FitError::AmbiguousPort(2))));

    let transmission = QFitEngine::new(FitOptions {
        port: Some(PortPair::S21),
        ..FitOptions::default()
    })
    .fit(&trace)
    .unwrap();
    assert_close(transmission.q_l, 10_000.0, 0.01, "Q_L");
    assert_close(transmission.q_0, 12_000.0, 0.01, "Q_0");

    let reflection = QFitEngine::new(FitOptions {
        geometry: Geometry::Reflection,
        port: Some(PortPair::S11),
        ..FitOptions::default()
    })
    .fit(&trace)
    .unwrap();
    assert_close(reflection.q_l, 10_000.0, 0.01, "Q_L");
}
