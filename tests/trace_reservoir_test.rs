//! Integration tests for the trace reservoir subsystem: sampling bounds,
//! checkpoint durability, and the maintenance loop.

use procsift::core::config::TraceReservoirConfig;
use procsift::core::types::{Span, SpanId, SpanStatus, TraceId};
use procsift::monitoring::{gauge, InMemoryReporter};
use procsift::trace::TraceReservoirProcessor;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn span(trace: u64, n: u64) -> Span {
    Span::builder()
        .trace_id(TraceId::new(format!("{trace:032x}")).unwrap())
        .span_id(SpanId::new(format!("{n:016x}")).unwrap())
        .name(format!("operation-{n}"))
        .start_ns(n * 1_000)
        .end_ns(n * 1_000 + 250)
        .attribute("service.name", "checkout")
        .status(SpanStatus::Ok)
        .build()
        .unwrap()
}

#[test]
fn reservoir_round_trip_preserves_identities() {
    // K=10, 20 spans in, checkpoint, reset, load: same 10 identities.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reservoir.ckpt");
    let config = TraceReservoirConfig {
        reservoir_size: 10,
        window_duration: Duration::from_secs(3600),
        trace_aware: false,
        checkpoint_path: path.clone(),
        ..Default::default()
    };

    let processor =
        TraceReservoirProcessor::new(config.clone(), Arc::new(InMemoryReporter::new())).unwrap();
    for n in 0..20 {
        processor.add_span(span(n, n));
    }
    assert_eq!(processor.reservoir().size(), 10);

    let before: HashSet<String> = processor
        .reservoir()
        .get_all_spans_with_keys()
        .into_keys()
        .collect();
    processor.checkpoint().unwrap();
    let window_before = processor.window().current();

    processor.reservoir().reset();
    assert_eq!(processor.reservoir().size(), 0);
    drop(processor);

    let restored =
        TraceReservoirProcessor::new(config, Arc::new(InMemoryReporter::new())).unwrap();
    assert_eq!(restored.reservoir().size(), 10);
    assert_eq!(restored.reservoir().stream_count(), 20);
    let after: HashSet<String> = restored
        .reservoir()
        .get_all_spans_with_keys()
        .into_keys()
        .collect();
    assert_eq!(after, before);
    assert_eq!(restored.window().current(), window_before);
}

#[test]
fn shutdown_persists_a_final_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reservoir.ckpt");
    let config = TraceReservoirConfig {
        reservoir_size: 5,
        trace_aware: false,
        checkpoint_path: path.clone(),
        ..Default::default()
    };

    let processor =
        TraceReservoirProcessor::new(config.clone(), Arc::new(InMemoryReporter::new())).unwrap();
    for n in 0..3 {
        processor.add_span(span(n, n));
    }
    processor.shutdown().unwrap();
    drop(processor);

    let restored =
        TraceReservoirProcessor::new(config, Arc::new(InMemoryReporter::new())).unwrap();
    assert_eq!(restored.reservoir().size(), 3);
    assert_eq!(restored.reservoir().stream_count(), 3);
}

#[test]
fn trace_aware_mode_samples_whole_traces() {
    let config = TraceReservoirConfig {
        reservoir_size: 100,
        trace_aware: true,
        max_trace_buffer: 10,
        trace_inactivity_timeout: Duration::from_millis(40),
        checkpoint_path: Default::default(),
        ..Default::default()
    };
    let reporter = Arc::new(InMemoryReporter::new());
    let processor = TraceReservoirProcessor::new(config, reporter.clone()).unwrap();

    // Two traces with three spans each.
    for t in 0..2 {
        for n in 0..3 {
            processor.add_span(span(t, t * 10 + n));
        }
    }
    assert_eq!(processor.reservoir().size(), 0);
    assert_eq!(reporter.gauge_value(gauge::TRACE_BUFFER_SIZE), Some(2.0));

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(processor.collect_completed(), 2);
    assert_eq!(processor.reservoir().size(), 6);
    assert_eq!(reporter.gauge_value(gauge::TRACE_BUFFER_SIZE), Some(0.0));
}

#[tokio::test]
async fn maintenance_loop_completes_traces_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reservoir.ckpt");
    let config = TraceReservoirConfig {
        reservoir_size: 100,
        trace_aware: true,
        max_trace_buffer: 100,
        trace_inactivity_timeout: Duration::from_millis(50),
        window_duration: Duration::from_secs(3600),
        checkpoint_path: path.clone(),
        checkpoint_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let processor =
        Arc::new(TraceReservoirProcessor::new(config, Arc::new(InMemoryReporter::new())).unwrap());

    let cancel = CancellationToken::new();
    let task = {
        let processor = Arc::clone(&processor);
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run_maintenance(cancel).await })
    };

    for n in 0..4 {
        processor.add_span(span(1, n));
    }
    // Give the loop time to complete the trace and write a checkpoint.
    tokio::time::sleep(Duration::from_millis(700)).await;
    cancel.cancel();
    task.await.unwrap();

    assert_eq!(processor.reservoir().size(), 4);
    assert!(path.exists(), "maintenance loop should have checkpointed");
}

#[test]
fn concurrent_producers_are_safe() {
    let config = TraceReservoirConfig {
        reservoir_size: 50,
        trace_aware: false,
        checkpoint_path: Default::default(),
        ..Default::default()
    };
    let processor =
        Arc::new(TraceReservoirProcessor::new(config, Arc::new(InMemoryReporter::new())).unwrap());

    let mut handles = Vec::new();
    for t in 0..4 {
        let processor = Arc::clone(&processor);
        handles.push(std::thread::spawn(move || {
            for n in 0..250 {
                processor.add_span(span(t, t * 1000 + n));
            }
        }));
    }
    for h in handles {
        h.join().expect("producer panicked");
    }
    assert_eq!(processor.reservoir().stream_count(), 1000);
    assert_eq!(processor.reservoir().size(), 50);
}
