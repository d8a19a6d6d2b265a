//! Trace completion buffer.
//!
//! Spans are grouped by trace until the trace is complete: either no span
//! has arrived for the inactivity timeout, or the buffer is at capacity and
//! the least-recently-updated trace is evicted to make room. Span order
//! within a trace is arrival order.

use crate::core::types::{Span, TraceId};
use crate::monitoring::MetricsReporter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct OpenTrace {
    spans: Vec<Span>,
    last_update: Instant,
}

/// A completed trace together with the reason it completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// No span arrived for the inactivity timeout.
    Inactivity,
    /// The buffer was full and this trace was least recently updated.
    Evicted,
}

/// A trace removed from the buffer, ready for sampling.
pub struct CompletedTrace {
    /// The trace identifier.
    pub trace_id: TraceId,
    /// Spans in arrival order.
    pub spans: Vec<Span>,
    /// Why the trace was declared complete.
    pub reason: CompletionReason,
}

/// Bounded map of open traces with LRU eviction and inactivity timeout.
pub struct TraceBuffer {
    max_traces: usize,
    inactivity_timeout: Duration,
    traces: Mutex<HashMap<TraceId, OpenTrace>>,
    reporter: Arc<dyn MetricsReporter>,
}

impl TraceBuffer {
    /// Creates an empty buffer for at most `max_traces` concurrent traces.
    pub fn new(
        max_traces: usize,
        inactivity_timeout: Duration,
        reporter: Arc<dyn MetricsReporter>,
    ) -> Self {
        Self {
            max_traces,
            inactivity_timeout,
            traces: Mutex::new(HashMap::new()),
            reporter,
        }
    }

    /// Adds a span to its trace.
    ///
    /// If a new trace would exceed capacity, the least-recently-updated
    /// trace is evicted and returned as completed-by-eviction.
    pub fn add_span(&self, span: Span) -> Option<CompletedTrace> {
        let mut traces = self.traces.lock();
        let now = Instant::now();

        if let Some(open) = traces.get_mut(&span.trace_id) {
            open.spans.push(span);
            open.last_update = now;
            return None;
        }

        let mut evicted = None;
        if traces.len() >= self.max_traces {
            // Capacity is strict: make room before inserting.
            if let Some(lru_id) = traces
                .iter()
                .min_by_key(|(_, open)| open.last_update)
                .map(|(id, _)| id.clone())
            {
                if let Some(open) = traces.remove(&lru_id) {
                    self.reporter.report_evictions(1);
                    debug!(trace_id = %lru_id, spans = open.spans.len(), "evicted LRU trace");
                    evicted = Some(CompletedTrace {
                        trace_id: lru_id,
                        spans: open.spans,
                        reason: CompletionReason::Evicted,
                    });
                }
            }
        }

        traces.insert(
            span.trace_id.clone(),
            OpenTrace {
                spans: vec![span],
                last_update: now,
            },
        );
        self.reporter.report_trace_buffer_size(traces.len());
        evicted
    }

    /// Removes and returns every trace idle for at least the inactivity
    /// timeout.
    pub fn collect_completed(&self) -> Vec<CompletedTrace> {
        let mut traces = self.traces.lock();
        let now = Instant::now();
        let expired: Vec<TraceId> = traces
            .iter()
            .filter(|(_, open)| now.duration_since(open.last_update) >= self.inactivity_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut completed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(open) = traces.remove(&id) {
                completed.push(CompletedTrace {
                    trace_id: id,
                    spans: open.spans,
                    reason: CompletionReason::Inactivity,
                });
            }
        }
        if !completed.is_empty() {
            self.reporter.report_trace_buffer_size(traces.len());
        }
        completed
    }

    /// Number of currently open traces.
    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    /// Returns true when no traces are open.
    pub fn is_empty(&self) -> bool {
        self.traces.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{SpanId, TraceId};
    use crate::monitoring::{counter, InMemoryReporter};

    fn span(trace: &str, span_n: u64) -> Span {
        Span::builder()
            .trace_id(TraceId::new(trace.to_string()).unwrap())
            .span_id(SpanId::new(format!("{span_n:016x}")).unwrap())
            .name("op")
            .build()
            .unwrap()
    }

    fn buffer(cap: usize, timeout: Duration) -> (TraceBuffer, Arc<InMemoryReporter>) {
        let reporter = Arc::new(InMemoryReporter::new());
        (TraceBuffer::new(cap, timeout, reporter.clone()), reporter)
    }

    #[test]
    fn test_spans_group_by_trace_in_arrival_order() {
        let (buf, _) = buffer(10, Duration::from_millis(50));
        buf.add_span(span("t1", 1));
        buf.add_span(span("t1", 2));
        buf.add_span(span("t2", 3));
        assert_eq!(buf.len(), 2);

        std::thread::sleep(Duration::from_millis(60));
        let mut completed = buf.collect_completed();
        assert_eq!(completed.len(), 2);
        completed.sort_by(|a, b| a.trace_id.as_str().cmp(b.trace_id.as_str()));
        assert_eq!(completed[0].spans.len(), 2);
        assert_eq!(completed[0].spans[0].span_id.as_str(), format!("{:016x}", 1));
        assert_eq!(completed[0].spans[1].span_id.as_str(), format!("{:016x}", 2));
        assert_eq!(completed[0].reason, CompletionReason::Inactivity);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recently_updated() {
        let (buf, reporter) = buffer(2, Duration::from_secs(60));
        buf.add_span(span("t1", 1));
        std::thread::sleep(Duration::from_millis(5));
        buf.add_span(span("t2", 2));
        std::thread::sleep(Duration::from_millis(5));
        // Touch t1 so t2 becomes the LRU.
        buf.add_span(span("t1", 3));
        std::thread::sleep(Duration::from_millis(5));

        let evicted = buf.add_span(span("t3", 4)).expect("eviction expected");
        assert_eq!(evicted.trace_id.as_str(), "t2");
        assert_eq!(evicted.reason, CompletionReason::Evicted);
        assert_eq!(buf.len(), 2);
        assert_eq!(reporter.counter_value(counter::LRU_EVICTIONS), 1);
    }

    #[test]
    fn test_active_traces_are_not_collected() {
        let (buf, _) = buffer(10, Duration::from_millis(80));
        buf.add_span(span("t1", 1));
        std::thread::sleep(Duration::from_millis(50));
        // Recent activity keeps the trace open.
        buf.add_span(span("t1", 2));
        std::thread::sleep(Duration::from_millis(50));
        assert!(buf.collect_completed().is_empty());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_existing_trace_update_never_evicts() {
        let (buf, reporter) = buffer(1, Duration::from_secs(60));
        buf.add_span(span("t1", 1));
        assert!(buf.add_span(span("t1", 2)).is_none());
        assert_eq!(reporter.counter_value(counter::LRU_EVICTIONS), 0);
    }

    #[test]
    fn test_concurrent_adds() {
        use std::thread;
        let (buf, _) = buffer(1000, Duration::from_secs(60));
        let buf = Arc::new(buf);
        let mut handles = Vec::new();
        for t in 0..4 {
            let buf = Arc::clone(&buf);
            handles.push(thread::spawn(move || {
                for n in 0..100 {
                    buf.add_span(span(&format!("t{t}"), n));
                }
            }));
        }
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(buf.len(), 4);
    }
}
