//! Algorithm-R span reservoir.
//!
//! Holds up to K spans for the active time window. Every `add_span` call
//! advances the stream count; once the reservoir is full, span *n* replaces
//! a uniformly chosen resident with probability `K/n`.

use crate::core::types::Span;
use crate::monitoring::MetricsReporter;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;

struct ReservoirInner {
    spans: Vec<Span>,
    stream_count: u64,
    rng: SmallRng,
}

/// A bounded uniform sample over an unbounded span stream.
pub struct SpanReservoir {
    max_size: usize,
    inner: Mutex<ReservoirInner>,
    reporter: Arc<dyn MetricsReporter>,
}

impl SpanReservoir {
    /// Creates an empty reservoir holding at most `max_size` spans.
    pub fn new(max_size: usize, reporter: Arc<dyn MetricsReporter>) -> Self {
        Self::with_rng(max_size, reporter, SmallRng::from_entropy())
    }

    /// Creates a reservoir with an explicit RNG. Deterministic tests seed it.
    pub fn with_rng(max_size: usize, reporter: Arc<dyn MetricsReporter>, rng: SmallRng) -> Self {
        Self {
            max_size,
            inner: Mutex::new(ReservoirInner {
                spans: Vec::with_capacity(max_size),
                stream_count: 0,
                rng,
            }),
            reporter,
        }
    }

    /// Offers a span to the reservoir. Returns true iff the span was stored.
    pub fn add_span(&self, span: Span) -> bool {
        let mut inner = self.inner.lock();
        inner.stream_count += 1;

        if inner.spans.len() < self.max_size {
            inner.spans.push(span);
            self.reporter.report_sampled_spans(1);
            self.reporter.report_reservoir_size(inner.spans.len());
            return true;
        }

        let n = inner.stream_count;
        let j = inner.rng.gen_range(0..n);
        if j < self.max_size as u64 {
            let victim = inner.rng.gen_range(0..self.max_size);
            inner.spans[victim] = span;
            self.reporter.report_sampled_spans(1);
            return true;
        }
        false
    }

    /// Number of spans currently stored.
    pub fn size(&self) -> usize {
        self.inner.lock().spans.len()
    }

    /// Maximum number of spans the reservoir can hold.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Total spans offered to the reservoir so far.
    pub fn stream_count(&self) -> u64 {
        self.inner.lock().stream_count
    }

    /// Snapshot of the stored spans.
    pub fn get_sample(&self) -> Vec<Span> {
        self.inner.lock().spans.clone()
    }

    /// Stored spans keyed by their `trace_id:span_id` identity.
    pub fn get_all_spans_with_keys(&self) -> HashMap<String, Span> {
        self.inner
            .lock()
            .spans
            .iter()
            .map(|s| (s.identity(), s.clone()))
            .collect()
    }

    /// Clears the reservoir and the stream count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.spans.clear();
        inner.stream_count = 0;
        self.reporter.report_reservoir_size(0);
    }

    /// Restores the reservoir from a checkpoint snapshot.
    ///
    /// Spans beyond capacity are discarded deterministically (first
    /// `max_size` win), which only happens when the configured size shrank
    /// between runs.
    pub fn restore(&self, spans: Vec<Span>, stream_count: u64) {
        let mut inner = self.inner.lock();
        inner.spans = spans;
        inner.spans.truncate(self.max_size);
        inner.stream_count = stream_count;
        self.reporter.report_reservoir_size(inner.spans.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{SpanId, TraceId};
    use crate::monitoring::{counter, gauge, InMemoryReporter};

    fn span(n: u64) -> Span {
        Span::builder()
            .trace_id(TraceId::new(format!("{n:032x}")).unwrap())
            .span_id(SpanId::new(format!("{n:016x}")).unwrap())
            .name("op")
            .start_ns(n * 1000)
            .end_ns(n * 1000 + 500)
            .build()
            .unwrap()
    }

    fn reservoir(k: usize) -> (SpanReservoir, Arc<InMemoryReporter>) {
        let reporter = Arc::new(InMemoryReporter::new());
        let r = SpanReservoir::with_rng(k, reporter.clone(), SmallRng::seed_from_u64(7));
        (r, reporter)
    }

    #[test]
    fn test_fills_then_caps_at_k() {
        let (r, reporter) = reservoir(10);
        for n in 0..20 {
            r.add_span(span(n));
        }
        assert_eq!(r.size(), 10);
        assert_eq!(r.max_size(), 10);
        assert_eq!(r.stream_count(), 20);
        assert_eq!(reporter.gauge_value(gauge::RESERVOIR_SIZE), Some(10.0));
        // At least the first 10 spans were stored.
        assert!(reporter.counter_value(counter::SAMPLED_SPANS) >= 10);
    }

    #[test]
    fn test_add_span_returns_storage_outcome() {
        let (r, _) = reservoir(1);
        assert!(r.add_span(span(0)));
        // Subsequent spans may or may not replace; size stays 1 either way.
        for n in 1..100 {
            r.add_span(span(n));
            assert_eq!(r.size(), 1);
        }
        assert_eq!(r.stream_count(), 100);
    }

    #[test]
    fn test_keys_are_trace_and_span_ids() {
        let (r, _) = reservoir(5);
        r.add_span(span(1));
        let keyed = r.get_all_spans_with_keys();
        assert_eq!(keyed.len(), 1);
        let key = keyed.keys().next().unwrap();
        assert!(key.contains(':'));
    }

    #[test]
    fn test_reset_clears_everything() {
        let (r, _) = reservoir(5);
        for n in 0..5 {
            r.add_span(span(n));
        }
        r.reset();
        assert_eq!(r.size(), 0);
        assert_eq!(r.stream_count(), 0);
        assert!(r.get_sample().is_empty());
    }

    #[test]
    fn test_restore_round_trip() {
        let (r, _) = reservoir(10);
        for n in 0..20 {
            r.add_span(span(n));
        }
        let spans = r.get_sample();
        let stream = r.stream_count();
        let identities: Vec<String> = spans.iter().map(Span::identity).collect();

        r.reset();
        assert_eq!(r.size(), 0);

        r.restore(spans, stream);
        assert_eq!(r.size(), 10);
        assert_eq!(r.stream_count(), 20);
        let restored: Vec<String> = r.get_sample().iter().map(Span::identity).collect();
        assert_eq!(restored, identities);
    }

    #[test]
    fn test_inclusion_is_roughly_uniform() {
        // With K=10 over a stream of 100, each span should survive with
        // probability ~0.1. Run many trials and check the aggregate.
        let reporter = Arc::new(InMemoryReporter::new());
        let mut hits = vec![0u32; 100];
        for trial in 0..200 {
            let r = SpanReservoir::with_rng(
                10,
                reporter.clone(),
                SmallRng::seed_from_u64(trial),
            );
            for n in 0..100 {
                r.add_span(span(n));
            }
            for s in r.get_sample() {
                let idx = usize::from_str_radix(s.span_id.as_str(), 16).unwrap();
                hits[idx] += 1;
            }
        }
        // Expected 20 hits per position; allow generous slack.
        for (idx, &h) in hits.iter().enumerate() {
            assert!(h > 2, "position {idx} sampled {h} times, far below uniform");
            assert!(h < 60, "position {idx} sampled {h} times, far above uniform");
        }
    }
}
