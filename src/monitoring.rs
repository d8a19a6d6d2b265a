//! Pluggable metrics-reporting surface.
//!
//! Every component reports its operational counters and gauges through a
//! [`MetricsReporter`] trait object: an in-memory implementation backs the
//! tests, and production embedders bridge to their metrics backend. The
//! core never depends on a concrete reporter.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Well-known gauge names.
pub mod gauge {
    /// Current span reservoir occupancy.
    pub const RESERVOIR_SIZE: &str = "reservoir_size";
    /// Number of currently open traces in the buffer.
    pub const TRACE_BUFFER_SIZE: &str = "trace_buffer_size";
    /// Seconds since the last durable checkpoint.
    pub const CHECKPOINT_AGE_SECONDS: &str = "checkpoint_age_seconds";
    /// Checkpoint store size in bytes.
    pub const DB_SIZE_BYTES: &str = "db_size_bytes";
    /// Current K of the AdaptiveTopK stage.
    pub const CURRENT_K_VALUE: &str = "current_k_value";
    /// Reservoir occupancy over capacity for the metrics sampler.
    pub const RESERVOIR_FILL_RATIO: &str = "reservoir_fill_ratio";
    /// Identities currently resident in the metrics sampler reservoir.
    pub const SELECTED_IDENTITIES: &str = "selected_identities";
}

/// Well-known counter names.
pub mod counter {
    /// Spans stored by the trace reservoir.
    pub const SAMPLED_SPANS: &str = "sampled_spans";
    /// Traces evicted from the buffer by LRU pressure.
    pub const LRU_EVICTIONS: &str = "lru_evictions";
    /// Checkpoint store compactions.
    pub const COMPACTIONS: &str = "compactions";
    /// Unique processes tagged critical by the tagger.
    pub const TAGGED_PROCESSES: &str = "tagged_processes";
    /// Non-critical processes selected into the top K.
    pub const TOPK_SELECTED: &str = "topk_selected";
    /// Unique eligible identities first seen by the metrics sampler.
    pub const ELIGIBLE_IDENTITIES_SEEN: &str = "eligible_identities_seen";
    /// Identities admitted into the metrics sampler reservoir.
    pub const IDENTITIES_ADDED: &str = "identities_added";
    /// Synthetic `_other_` series emitted by the rollup.
    pub const AGGREGATED_SERIES: &str = "aggregated_series";
    /// Distinct input pids folded into rollup aggregates.
    pub const INPUT_SERIES_ROLLED_UP: &str = "input_series_rolled_up";
}

/// Observability surface shared by every component.
///
/// Names are flat strings; per-stage series are prefixed with the stage
/// name (`prioritytagger.processed_points`). Implementations must be cheap
/// and non-blocking, since stages call them on the batch path.
pub trait MetricsReporter: Send + Sync {
    /// Adds to a named monotonic counter.
    fn add_counter(&self, name: &str, delta: u64);

    /// Sets a named gauge.
    fn set_gauge(&self, name: &str, value: f64);

    /// Reports current span reservoir occupancy.
    fn report_reservoir_size(&self, size: usize) {
        self.set_gauge(gauge::RESERVOIR_SIZE, size as f64);
    }

    /// Reports spans stored by the trace reservoir.
    fn report_sampled_spans(&self, count: usize) {
        self.add_counter(counter::SAMPLED_SPANS, count as u64);
    }

    /// Reports the number of open traces in the buffer.
    fn report_trace_buffer_size(&self, size: usize) {
        self.set_gauge(gauge::TRACE_BUFFER_SIZE, size as f64);
    }

    /// Reports traces completed by LRU eviction.
    fn report_evictions(&self, count: usize) {
        self.add_counter(counter::LRU_EVICTIONS, count as u64);
    }

    /// Reports the age of the last durable checkpoint.
    fn report_checkpoint_age(&self, age: Duration) {
        self.set_gauge(gauge::CHECKPOINT_AGE_SECONDS, age.as_secs_f64());
    }

    /// Reports checkpoint store size.
    fn report_db_size(&self, size_bytes: u64) {
        self.set_gauge(gauge::DB_SIZE_BYTES, size_bytes as f64);
    }

    /// Reports checkpoint store compactions.
    fn report_compactions(&self, count: usize) {
        self.add_counter(counter::COMPACTIONS, count as u64);
    }
}

/// Reporter that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl MetricsReporter for NoopReporter {
    fn add_counter(&self, _name: &str, _delta: u64) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
}

/// Concurrent in-memory reporter, used by tests and local inspection.
#[derive(Debug, Default)]
pub struct InMemoryReporter {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicU64>,
}

impl InMemoryReporter {
    /// Creates an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if never touched.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current value of a gauge, None if never set.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .get(name)
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
    }
}

impl MetricsReporter for InMemoryReporter {
    fn add_counter(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }
}
