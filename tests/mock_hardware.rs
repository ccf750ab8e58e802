//! Integration tests for mock hardware implementations
//!
//! These tests verify that MockPpms and MockVna correctly implement
//! the capability traits and exhibit realistic behavior.

use fmr_daq::hardware::mock::{MockFault, MockPpms, MockVna, PpmsCommand, Resonance};
use fmr_daq::hardware::{
    FieldControl, InstrumentSet, NetworkAnalyzer, PortPair, Ppms, SafeRange, TemperatureControl,
};
use num_complex::Complex64;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// MockPpms Tests
// =============================================================================

#[tokio::test]
async fn test_mock_ppms_through_trait_object() {
    let ppms: Arc<dyn Ppms> = Arc::new(MockPpms::new());

    ppms.set_field(1500.0, 200.0).await.unwrap();
    ppms.set_temperature(10.0, 5.0).await.unwrap();

    assert_eq!(ppms.field().await.unwrap(), 1500.0);
    assert_eq!(ppms.temperature().await.unwrap(), 10.0);
    assert!(ppms.field_range().contains(90_000.0));
    assert!(!ppms.temperature_range().contains(1.0));
}

#[tokio::test(start_paused = true)]
async fn test_mock_ppms_field_ramp_timing() {
    let ppms = MockPpms::new().with_time_scale(1.0);

    // 1000 Oe at 200 Oe/s should take 5 seconds
    let start = Instant::now();
    ppms.set_field(1000.0, 200.0).await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5100),
        "Expected ~5s, got {:?}",
        elapsed
    );
}

#[tokio::test(start_paused = true)]
async fn test_mock_ppms_temperature_rate_is_per_minute() {
    let ppms = MockPpms::new().with_time_scale(1.0);

    // 300 K -> 290 K at 5 K/min should take 2 minutes
    let start = Instant::now();
    ppms.set_temperature(290.0, 5.0).await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(120) && elapsed < Duration::from_secs(121));
}

#[tokio::test]
async fn test_mock_ppms_rejects_out_of_range_field() {
    let ppms = MockPpms::new().with_field_range(SafeRange::new(-1000.0, 1000.0));

    let err = ppms.set_field(5000.0, 200.0).await.unwrap_err();
    assert!(!err.is_timeout());
    assert!(!err.is_retryable());
    assert_eq!(ppms.field().await.unwrap(), 0.0);
    assert_eq!(
        ppms.commands(),
        vec![PpmsCommand::Field {
            target: 5000.0,
            rate: 200.0
        }]
    );
}

#[tokio::test]
async fn test_mock_ppms_temperature_fault_fires_once() {
    let ppms = MockPpms::new();
    ppms.fail_temperature_at(4.0);

    assert!(ppms.set_temperature(4.0, 5.0).await.unwrap_err().is_timeout());
    assert_eq!(ppms.temperature().await.unwrap(), 300.0);
    ppms.set_temperature(4.0, 5.0).await.unwrap();
    assert_eq!(ppms.temperature().await.unwrap(), 4.0);
}

// =============================================================================
// MockVna Tests
// =============================================================================

#[tokio::test]
async fn test_mock_vna_follows_resonator_model() {
    let resonance = Resonance {
        f_l: 9.0e9,
        q_l: 500.0,
        diameter: Complex64::new(0.3, 0.0),
        offset: Complex64::new(0.0, 0.0),
        delay_s: 0.0,
    };
    let vna: Arc<dyn NetworkAnalyzer> = Arc::new(MockVna::with_resonance(resonance));

    // Half-power point: |S21| = d / sqrt(2)
    let half_power = 9.0e9 * (1.0 + 1.0 / (2.0 * 500.0));
    vna.configure_source(half_power, 0.0).await.unwrap();
    let value = vna
        .acquire_s_parameters(&[PortPair::S21], Duration::ZERO)
        .await
        .unwrap()[&PortPair::S21];
    assert!((value.norm() - 0.3 / 2.0_f64.sqrt()).abs() < 1e-12);
}

#[tokio::test]
async fn test_mock_vna_reflection_port_sits_on_background() {
    let vna = MockVna::new();
    vna.configure_source(3.0e9, -10.0).await.unwrap();

    let values = vna
        .acquire_s_parameters(&[PortPair::S11, PortPair::S21], Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(values.len(), 2);
    // Far off resonance: reflection ~ -1, transmission ~ 0
    assert!((values[&PortPair::S11] - Complex64::new(-1.0, 0.0)).norm() < 1e-3);
    assert!(values[&PortPair::S21].norm() < 1e-3);
}

#[tokio::test]
async fn test_mock_vna_noise_is_bounded() {
    let vna = MockVna::new().with_noise(1e-3);
    vna.configure_source(2.0e9, -10.0).await.unwrap();

    for _ in 0..50 {
        let value = vna
            .acquire_s_parameters(&[PortPair::S21], Duration::ZERO)
            .await
            .unwrap()[&PortPair::S21];
        assert!((value.re - 1.0 / 6.0).abs() <= 1e-3);
        assert!(value.im.abs() <= 1e-3);
    }
}

#[tokio::test(start_paused = true)]
async fn test_mock_vna_dwell_timing() {
    let vna = MockVna::new().with_time_scale(1.0);

    let start = Instant::now();
    vna.acquire_s_parameters(&[PortPair::S21], Duration::from_millis(250))
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn test_mock_vna_rejects_invalid_source() {
    let vna = MockVna::new();
    assert!(vna.configure_source(0.0, -10.0).await.is_err());
    assert!(vna.configure_source(f64::NAN, -10.0).await.is_err());
    assert_eq!(vna.source().await, (2.0e9, -10.0));
}

#[tokio::test]
async fn test_mock_vna_fault_counts_as_call() {
    let vna = MockVna::new();
    vna.fail_call(1, MockFault::Transient);

    assert!(vna
        .acquire_s_parameters(&[PortPair::S21], Duration::ZERO)
        .await
        .is_err());
    assert!(vna
        .acquire_s_parameters(&[PortPair::S21], Duration::ZERO)
        .await
        .is_ok());
    assert_eq!(vna.acquisition_count(), 2);
}

// =============================================================================
// InstrumentSet Tests
// =============================================================================

#[tokio::test]
async fn test_instrument_set_lease_released_on_drop() {
    let set = InstrumentSet::new(Arc::new(MockPpms::new()), Arc::new(MockVna::new()));
    let other = set.clone();

    let lease = set.try_lease().unwrap();
    assert!(other.is_leased());
    assert!(other.try_lease().is_none());

    drop(lease);
    assert!(!set.is_leased());
    assert!(other.try_lease().is_some());
}

#[tokio::test]
async fn test_instrument_sets_over_same_mocks_share_lease() {
    let ppms = Arc::new(MockPpms::new());
    let vna = Arc::new(MockVna::new());
    let first = InstrumentSet::new(ppms.clone(), vna.clone());
    let second = InstrumentSet::new(ppms.clone(), vna.clone());
    let analyzer_only = InstrumentSet::new(Arc::new(MockPpms::new()), vna);

    let lease = first.try_lease().unwrap();
    assert!(second.is_leased());
    assert!(second.try_lease().is_none());
    assert!(analyzer_only.try_lease().is_none());

    drop(lease);
    assert!(second.try_lease().is_some());
}
