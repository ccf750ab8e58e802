//! Integration tests for DataRecorder
//!
//! Runs small campaigns and reads the results back through trace filters, the live
//! feed and the CSV sink.

#![cfg(feature = "storage_csv")]

use fmr_daq::analysis::{FitOptions, QFitEngine};
use fmr_daq::data::{CsvSink, DataRecorder, SpectrumColumns, TraceFilter};
use fmr_daq::error::RecorderError;
use fmr_daq::experiment::{
    CancelToken, LoopAction, LoopSpec, Orchestrator, OrchestratorConfig, RetryPolicy, SetPoint,
    SourceConfig, SweepSpec,
};
use fmr_daq::hardware::mock::{MockPpms, MockVna};
use fmr_daq::hardware::{InstrumentSet, PortPair};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn instant_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        },
        field_delay: Duration::ZERO,
        temperature_delay: Duration::ZERO,
        checkpoint_dir: None,
    }
}

fn orchestrator(recorder: Arc<DataRecorder>) -> Orchestrator {
    let instruments = InstrumentSet::new(Arc::new(MockPpms::new()), Arc::new(MockVna::new()));
    Orchestrator::new(instruments, recorder, instant_config())
}

/// Two temperatures, three field cycles each, measuring after cycles 1 and 3.
fn cycled_campaign() -> LoopSpec {
    let cycle = LoopSpec::cycle(
        "field_cycle",
        vec![SetPoint::field(620.0, 200.0), SetPoint::field(700.0, 200.0)],
        3,
        LoopAction::Sweep(SweepSpec::field(
            0.0,
            400.0,
            100.0,
            SourceConfig::default(),
        )),
    )
    .with_measure_on(vec![1, 3]);
    LoopSpec::scan(
        "temperature",
        vec![
            SetPoint::temperature(300.0, 5.0),
            SetPoint::temperature(10.0, 5.0),
        ],
        LoopAction::Loop(Box::new(cycle)),
    )
}

#[tokio::test]
async fn test_filters_select_sweeps_by_context() {
    let recorder = Arc::new(DataRecorder::new());
    orchestrator(recorder.clone())
        .execute(&cycled_campaign(), CancelToken::new())
        .await
        .unwrap();
    assert_eq!(recorder.len().await, 2 * 2 * 5);

    let all = recorder.read_traces(&TraceFilter::new()).await;
    assert_eq!(all.len(), 4);

    let cold = recorder
        .read_traces(&TraceFilter::new().node("temperature", 10.0))
        .await;
    assert_eq!(cold.len(), 2);

    let trace = recorder
        .read_trace(
            &TraceFilter::new()
                .node("temperature", 10.0)
                .repetition("field_cycle", 3),
        )
        .await
        .unwrap();
    assert_eq!(trace.len(), 5);
    assert_eq!(trace.positions(), vec![0.0, 100.0, 200.0, 300.0, 400.0]);
    assert_eq!(trace.context().entry("field_cycle").unwrap().repetition, 3);

    // Cycle 2 was never measured
    assert_eq!(
        recorder
            .read_trace(&TraceFilter::new().repetition("field_cycle", 2))
            .await
            .unwrap_err(),
        RecorderError::NoMatchingTrace
    );
    assert_eq!(
        recorder
            .read_trace(&TraceFilter::new().node("temperature", 300.0))
            .await
            .unwrap_err(),
        RecorderError::AmbiguousTrace { matches: 2 }
    );

    let by_index = recorder
        .read_trace(&TraceFilter::new().sweep(trace.sweep_index()))
        .await
        .unwrap();
    assert_eq!(by_index.samples(), trace.samples());
}

#[tokio::test]
async fn test_live_feed_sees_every_sample_in_order() {
    let recorder = Arc::new(DataRecorder::new());
    let mut feed = recorder.subscribe();

    orchestrator(recorder.clone())
        .execute(&cycled_campaign(), CancelToken::new())
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Ok(sample) = feed.try_recv() {
        received.push(sample);
    }
    let logged = recorder.samples().await;
    assert_eq!(received.len(), logged.len());
    for (live, stored) in received.iter().zip(&logged) {
        assert!(Arc::ptr_eq(live, stored));
    }
}

#[tokio::test]
async fn test_reader_during_campaign_sees_whole_samples() {
    let recorder = Arc::new(DataRecorder::new());
    let mut feed = recorder.subscribe();
    let reader = {
        let recorder = recorder.clone();
        tokio::spawn(async move {
            let mut seen = 0;
            while feed.recv().await.is_ok() {
                let samples = recorder.samples().await;
                assert!(samples.len() >= seen);
                assert!(samples.iter().all(|s| s.value(PortPair::S21).is_some()));
                seen = samples.len();
                if seen == 20 {
                    break;
                }
            }
            seen
        })
    };

    orchestrator(recorder.clone())
        .execute(&cycled_campaign(), CancelToken::new())
        .await
        .unwrap();
    assert_eq!(reader.await.unwrap(), 20);
}

#[tokio::test]
async fn test_csv_sink_round_trip_through_fit() {
    let dir = tempdir().unwrap();
    let sink = CsvSink::in_dir(dir.path(), "resonator").unwrap();
    let path = sink.path().to_path_buf();
    let recorder = Arc::new(DataRecorder::with_sink(Box::new(sink)));

    let campaign = LoopSpec::scan(
        "temperature",
        vec![SetPoint::temperature(300.0, 5.0)],
        LoopAction::Sweep(
            SweepSpec::frequency(1.998e9, 2.002e9, 2.0e4, -10.0)
                .with_ports(vec![PortPair::S11, PortPair::S21]),
        ),
    );
    let summary = orchestrator(recorder.clone())
        .execute(&campaign, CancelToken::new())
        .await
        .unwrap();
    assert_eq!(summary.samples_recorded, 201);

    let columns = SpectrumColumns {
        frequency: "position".into(),
        ..SpectrumColumns::default()
    };
    let trace = fmr_daq::data::read_spectrum_csv(&path, &columns, PortPair::S21).unwrap();
    assert_eq!(trace.len(), 201);

    let result = QFitEngine::new(FitOptions::default()).fit(&trace).unwrap();
    assert!(((result.q_l - 10_000.0) / 10_000.0).abs() < 0.01);
}
