//! Trace reservoir subsystem: window-based Algorithm-R span sampling with
//! trace completion and durable checkpoints.
//!
//! This subsystem is independent of the metric pipeline; an integrator may
//! compose the two. Spans enter through [`TraceReservoirProcessor::add_span`],
//! which is safe to call from multiple ingestion threads. A maintenance
//! loop collects completed traces, rolls the sampling window, and persists
//! crash-safe checkpoints.

pub mod buffer;
pub mod checkpoint;
pub mod reservoir;
pub mod window;

pub use buffer::{CompletedTrace, CompletionReason, TraceBuffer};
pub use checkpoint::{CheckpointSnapshot, CheckpointStore};
pub use reservoir::SpanReservoir;
pub use window::{TimeWindow, WindowState};

use crate::core::config::TraceReservoirConfig;
use crate::core::types::Span;
use crate::core::Result;
use crate::monitoring::MetricsReporter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives the reservoir contents drained at each window rollover.
pub type DrainConsumer = Box<dyn Fn(u64, Vec<Span>) + Send + Sync>;

/// Cadence of the maintenance loop.
const MAINTENANCE_TICK: Duration = Duration::from_millis(250);

/// Span sampling processor: buffer, reservoir, window and checkpoints.
pub struct TraceReservoirProcessor {
    config: TraceReservoirConfig,
    reservoir: SpanReservoir,
    buffer: Option<TraceBuffer>,
    window: TimeWindow,
    store: Option<CheckpointStore>,
    drain_consumer: Mutex<Option<DrainConsumer>>,
}

impl TraceReservoirProcessor {
    /// Builds the processor and restores the last checkpoint when one
    /// exists.
    pub fn new(config: TraceReservoirConfig, reporter: Arc<dyn MetricsReporter>) -> Result<Self> {
        config.validate()?;

        let reservoir = SpanReservoir::new(config.reservoir_size, Arc::clone(&reporter));
        let buffer = config.trace_aware.then(|| {
            TraceBuffer::new(
                config.max_trace_buffer,
                config.trace_inactivity_timeout,
                Arc::clone(&reporter),
            )
        });
        let window = TimeWindow::new(config.window_duration);

        let store = if config.checkpointing_enabled() {
            Some(CheckpointStore::new(
                config.checkpoint_path.clone(),
                config.checkpoint_target_size_bytes,
                Arc::clone(&reporter),
            )?)
        } else {
            None
        };

        let processor = Self {
            config,
            reservoir,
            buffer,
            window,
            store,
            drain_consumer: Mutex::new(None),
        };
        processor.restore_from_checkpoint()?;
        Ok(processor)
    }

    /// Registers the downstream consumer for window drains.
    pub fn set_drain_consumer(&self, consumer: DrainConsumer) {
        *self.drain_consumer.lock() = Some(consumer);
    }

    /// Called once before ingestion begins.
    pub fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Final checkpoint before the processor goes away.
    pub fn shutdown(&self) -> Result<()> {
        self.checkpoint()
    }

    /// Ingests one span. Safe to call concurrently from many producers.
    pub fn add_span(&self, span: Span) {
        match &self.buffer {
            Some(buffer) => {
                if let Some(evicted) = buffer.add_span(span) {
                    self.sample_completed(evicted);
                }
            }
            None => {
                self.reservoir.add_span(span);
            }
        }
    }

    /// The reservoir backing this processor.
    pub fn reservoir(&self) -> &SpanReservoir {
        &self.reservoir
    }

    /// The active sampling window.
    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    /// Drains timed-out traces from the buffer into the reservoir.
    /// Returns the number of traces completed.
    pub fn collect_completed(&self) -> usize {
        let Some(buffer) = &self.buffer else {
            return 0;
        };
        let completed = buffer.collect_completed();
        let count = completed.len();
        for trace in completed {
            self.sample_completed(trace);
        }
        count
    }

    fn sample_completed(&self, trace: CompletedTrace) {
        debug!(
            trace_id = %trace.trace_id,
            spans = trace.spans.len(),
            reason = ?trace.reason,
            "sampling completed trace"
        );
        for span in trace.spans {
            self.reservoir.add_span(span);
        }
    }

    /// Rolls the window over when the wall clock has crossed its end,
    /// draining the reservoir to the registered consumer.
    ///
    /// Returns the finished window when a rollover happened.
    pub fn maybe_rollover(&self) -> Option<WindowState> {
        self.window.record_stream_count(self.reservoir.stream_count());
        let finished = self.window.maybe_rollover()?;
        let drained = self.reservoir.get_sample();
        self.reservoir.reset();
        info!(
            window_id = finished.window_id,
            drained = drained.len(),
            "window rolled over"
        );
        if let Some(consumer) = self.drain_consumer.lock().as_ref() {
            consumer(finished.window_id, drained);
        }
        Some(finished)
    }

    /// Persists the current window and reservoir state.
    ///
    /// A write failure is surfaced to the caller; the reservoir keeps
    /// operating from in-memory state and the caller may retry.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        self.window.record_stream_count(self.reservoir.stream_count());
        let window = self.window.current();
        let snapshot = CheckpointSnapshot {
            window_id: window.window_id,
            start: window.start,
            end: window.end,
            stream_count: window.stream_count,
            spans: self.reservoir.get_all_spans_with_keys(),
        };
        store.checkpoint(&snapshot)?;
        store.compact()?;
        Ok(())
    }

    fn restore_from_checkpoint(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = store.load_checkpoint()?;
        if snapshot.is_empty() {
            return Ok(());
        }
        self.window.set_state(
            snapshot.window_id,
            snapshot.start,
            snapshot.end,
            snapshot.stream_count,
        );
        let stream_count = snapshot.stream_count;
        let spans: Vec<Span> = snapshot.spans.into_values().collect();
        info!(
            window_id = snapshot.window_id,
            spans = spans.len(),
            stream_count,
            "restored reservoir from checkpoint"
        );
        self.reservoir.restore(spans, stream_count);
        Ok(())
    }

    /// Runs trace completion, window rollover and periodic checkpoints
    /// until cancelled. Checkpoint writes are skipped once cancellation is
    /// observed, leaving storage in its last committed state.
    pub async fn run_maintenance(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_checkpoint = Instant::now();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.collect_completed();
                    self.maybe_rollover();

                    if self.store.is_some()
                        && last_checkpoint.elapsed() >= self.config.checkpoint_interval
                    {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Err(e) = self.checkpoint() {
                            warn!(error = %e, "checkpoint failed, continuing from memory");
                        }
                        last_checkpoint = Instant::now();
                    }
                    if let Some(store) = &self.store {
                        store.report_age();
                    }
                }
            }
        }
        debug!("maintenance loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{SpanId, TraceId};
    use crate::monitoring::InMemoryReporter;
    use std::path::PathBuf;

    fn span(trace: u64, n: u64) -> Span {
        Span::builder()
            .trace_id(TraceId::new(format!("{trace:032x}")).unwrap())
            .span_id(SpanId::new(format!("{n:016x}")).unwrap())
            .name("op")
            .start_ns(n)
            .end_ns(n + 10)
            .build()
            .unwrap()
    }

    fn config(checkpoint_path: PathBuf) -> TraceReservoirConfig {
        TraceReservoirConfig {
            reservoir_size: 10,
            window_duration: Duration::from_secs(3600),
            trace_aware: false,
            checkpoint_path,
            ..Default::default()
        }
    }

    #[test]
    fn test_span_mode_samples_directly() {
        let processor = TraceReservoirProcessor::new(
            config(PathBuf::new()),
            Arc::new(InMemoryReporter::new()),
        )
        .unwrap();
        for n in 0..20 {
            processor.add_span(span(n, n));
        }
        assert_eq!(processor.reservoir().size(), 10);
        assert_eq!(processor.reservoir().stream_count(), 20);
    }

    #[test]
    fn test_trace_aware_waits_for_completion() {
        let cfg = TraceReservoirConfig {
            trace_aware: true,
            max_trace_buffer: 100,
            trace_inactivity_timeout: Duration::from_millis(30),
            checkpoint_path: PathBuf::new(),
            ..config(PathBuf::new())
        };
        let processor =
            TraceReservoirProcessor::new(cfg, Arc::new(InMemoryReporter::new())).unwrap();
        processor.add_span(span(1, 1));
        processor.add_span(span(1, 2));
        // Still buffered, nothing sampled yet.
        assert_eq!(processor.reservoir().size(), 0);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(processor.collect_completed(), 1);
        assert_eq!(processor.reservoir().size(), 2);
    }

    #[test]
    fn test_eviction_feeds_the_reservoir() {
        let cfg = TraceReservoirConfig {
            trace_aware: true,
            max_trace_buffer: 1,
            trace_inactivity_timeout: Duration::from_secs(60),
            ..config(PathBuf::new())
        };
        let processor =
            TraceReservoirProcessor::new(cfg, Arc::new(InMemoryReporter::new())).unwrap();
        processor.add_span(span(1, 1));
        // Second trace evicts the first, whose span lands in the reservoir.
        processor.add_span(span(2, 2));
        assert_eq!(processor.reservoir().size(), 1);
    }

    #[test]
    fn test_checkpoint_restore_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reservoir.ckpt");
        let reporter: Arc<InMemoryReporter> = Arc::new(InMemoryReporter::new());

        let processor =
            TraceReservoirProcessor::new(config(path.clone()), reporter.clone()).unwrap();
        for n in 0..20 {
            processor.add_span(span(n, n));
        }
        assert_eq!(processor.reservoir().size(), 10);
        let identities: std::collections::HashSet<String> = processor
            .reservoir()
            .get_all_spans_with_keys()
            .into_keys()
            .collect();
        processor.checkpoint().unwrap();
        let window_before = processor.window().current();

        // Reset simulates a crash losing in-memory state.
        processor.reservoir().reset();
        assert_eq!(processor.reservoir().size(), 0);
        drop(processor);

        let restored = TraceReservoirProcessor::new(config(path), reporter).unwrap();
        assert_eq!(restored.reservoir().size(), 10);
        assert_eq!(restored.reservoir().stream_count(), 20);
        let restored_identities: std::collections::HashSet<String> = restored
            .reservoir()
            .get_all_spans_with_keys()
            .into_keys()
            .collect();
        assert_eq!(restored_identities, identities);
        assert_eq!(restored.window().current(), window_before);
    }

    #[test]
    fn test_rollover_drains_to_consumer() {
        let cfg = TraceReservoirConfig {
            window_duration: Duration::from_millis(20),
            ..config(PathBuf::new())
        };
        let processor =
            TraceReservoirProcessor::new(cfg, Arc::new(InMemoryReporter::new())).unwrap();
        let drained: Arc<Mutex<Vec<(u64, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&drained);
        processor.set_drain_consumer(Box::new(move |window_id, spans| {
            sink.lock().push((window_id, spans.len()));
        }));

        for n in 0..5 {
            processor.add_span(span(n, n));
        }
        std::thread::sleep(Duration::from_millis(30));
        let finished = processor.maybe_rollover().expect("window should roll");
        assert_eq!(finished.window_id, 0);
        assert_eq!(processor.reservoir().size(), 0);
        assert_eq!(drained.lock().as_slice(), &[(0, 5)]);
    }

    #[tokio::test]
    async fn test_maintenance_loop_stops_on_cancel() {
        let processor = Arc::new(
            TraceReservoirProcessor::new(
                config(PathBuf::new()),
                Arc::new(InMemoryReporter::new()),
            )
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        let handle = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move { processor.run_maintenance(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.expect("maintenance task panicked");
    }
}
