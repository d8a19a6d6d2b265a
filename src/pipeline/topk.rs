//! AdaptiveTopK: keeps critical processes plus the top K non-critical
//! processes by a ranking metric.
//!
//! K is fixed, or derived from a host load metric through configured load
//! bands. Dynamic mode adds hysteresis: a process that falls out of the
//! top K stays selected until its grace period expires, so the output set
//! does not flap between batches.

use super::{is_critical, BatchContext, MetricsStage, StageObserver};
use crate::core::config::{AdaptiveTopKConfig, PROCESS_PID_KEY};
use crate::core::Result;
use crate::metrics::{count_points, retain_number_points, MetricBatch, NumberDataPoint};
use crate::monitoring::{counter, gauge, MetricsReporter};
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Entries for pids that vanished from the batches are swept on this cadence.
const FULL_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Per-pid ranking data collected in a single scan over the batch.
#[derive(Debug, Clone, Default)]
struct ProcessInfo {
    ranking_value: f64,
    secondary_value: f64,
    is_critical: bool,
}

/// Candidate ordering for the selection heap.
///
/// Greater means a stronger claim on a top-K slot: higher ranking value,
/// then higher secondary value, then lexicographically smaller pid.
#[derive(Debug, Clone)]
struct Candidate {
    ranking_value: f64,
    secondary_value: f64,
    pid: String,
}

impl Candidate {
    fn compare(&self, other: &Self) -> Ordering {
        self.ranking_value
            .total_cmp(&other.ranking_value)
            .then_with(|| self.secondary_value.total_cmp(&other.secondary_value))
            .then_with(|| other.pid.cmp(&self.pid))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

/// State that persists across batches.
struct TopKState {
    current_k: usize,
    hysteresis: AHashMap<String, Instant>,
    last_full_cleanup: Instant,
}

/// The adaptive top-K selection stage.
pub struct AdaptiveTopK {
    config: AdaptiveTopKConfig,
    observer: StageObserver,
    state: Mutex<TopKState>,
}

impl AdaptiveTopK {
    /// Builds the stage, validating the configuration.
    pub fn new(config: AdaptiveTopKConfig, reporter: Arc<dyn MetricsReporter>) -> Result<Self> {
        config.validate()?;
        let initial_k = if config.is_dynamic() {
            config.min_k_value
        } else {
            config.k_value
        };
        reporter.set_gauge(gauge::CURRENT_K_VALUE, initial_k as f64);
        Ok(Self {
            config,
            observer: StageObserver::new("adaptivetopk", reporter),
            state: Mutex::new(TopKState {
                current_k: initial_k,
                hysteresis: AHashMap::new(),
                last_full_cleanup: Instant::now(),
            }),
        })
    }

    /// First datapoint of the host load metric anywhere in the batch.
    fn find_host_load(&self, batch: &MetricBatch) -> Option<f64> {
        let target = self.config.host_load_metric_name.as_str();
        for resource in &batch.resources {
            for scope in &resource.scopes {
                for metric in &scope.metrics {
                    if metric.name != target {
                        continue;
                    }
                    if let Some(points) = metric.number_points() {
                        if let Some(first) = points.first() {
                            return Some(first.value.as_f64());
                        }
                    }
                }
            }
        }
        None
    }

    /// Picks K from the load bands: the highest threshold at or below the
    /// load wins, falling back to `min_k_value` when no band qualifies.
    /// The result is clamped to `[min_k_value, max_k_value]`.
    fn k_for_load(&self, load: f64) -> usize {
        let mut new_k = self.config.min_k_value;
        let mut highest = f64::NEG_INFINITY;
        for band in &self.config.load_bands_to_k_map {
            if band.threshold <= load && band.threshold >= highest {
                highest = band.threshold;
                new_k = band.k;
            }
        }
        new_k.clamp(self.config.min_k_value, self.config.max_k_value)
    }

    /// Single scan collecting ranking data for every pid-carrying datapoint
    /// of the key and secondary metrics.
    fn collect_processes(&self, batch: &MetricBatch) -> AHashMap<String, ProcessInfo> {
        let key = self.config.key_metric_name.as_str();
        let secondary = self.config.secondary_key_metric_name.as_str();
        let mut processes: AHashMap<String, ProcessInfo> = AHashMap::new();

        for resource in &batch.resources {
            for scope in &resource.scopes {
                for metric in &scope.metrics {
                    let is_key = metric.name == key;
                    let is_secondary = !secondary.is_empty() && metric.name == secondary;
                    if !is_key && !is_secondary {
                        continue;
                    }
                    let Some(points) = metric.number_points() else {
                        continue;
                    };
                    for dp in points {
                        let Some(pid) = dp.attributes.get_str(PROCESS_PID_KEY) else {
                            continue;
                        };
                        let info = processes.entry(pid.to_string()).or_default();
                        if is_critical(
                            &dp.attributes,
                            &self.config.priority_attribute_name,
                            &self.config.critical_attribute_value,
                        ) {
                            info.is_critical = true;
                        }
                        // Later datapoints overwrite: the latest value ranks.
                        if is_key {
                            info.ranking_value = dp.value.as_f64();
                        }
                        if is_secondary {
                            info.secondary_value = dp.value.as_f64();
                        }
                    }
                }
            }
        }
        processes
    }

    /// Min-heap top-K over the non-critical candidates.
    fn select_top_k(
        &self,
        processes: &AHashMap<String, ProcessInfo>,
        k: usize,
        selected: &mut AHashSet<String>,
    ) -> usize {
        let non_critical: Vec<Candidate> = processes
            .iter()
            .filter(|(_, info)| !info.is_critical)
            .map(|(pid, info)| Candidate {
                ranking_value: info.ranking_value,
                secondary_value: info.secondary_value,
                pid: pid.clone(),
            })
            .collect();

        if non_critical.len() <= k {
            let count = non_critical.len();
            for candidate in non_critical {
                selected.insert(candidate.pid);
            }
            return count;
        }

        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(k);
        for candidate in non_critical {
            if heap.len() < k {
                heap.push(Reverse(candidate));
            } else if let Some(Reverse(weakest)) = heap.peek() {
                if candidate.compare(weakest) == Ordering::Greater {
                    heap.pop();
                    heap.push(Reverse(candidate));
                }
            }
        }

        let count = heap.len();
        for Reverse(candidate) in heap {
            selected.insert(candidate.pid);
        }
        count
    }

    /// Expires stale grace periods, refreshes the selected pids, and pulls
    /// still-covered pids back into the selection.
    fn apply_hysteresis(
        &self,
        state: &mut TopKState,
        selected: &mut AHashSet<String>,
        processes: &AHashMap<String, ProcessInfo>,
    ) {
        let now = Instant::now();

        // Entries expire strictly after their deadline: expiry == now is
        // still alive.
        state.hysteresis.retain(|_, expiry| *expiry >= now);

        // Full sweep: drop entries for processes that disappeared from the
        // host entirely, otherwise the map grows without bound on churn.
        if now.duration_since(state.last_full_cleanup) > FULL_CLEANUP_INTERVAL {
            state.hysteresis.retain(|pid, _| processes.contains_key(pid));
            state.last_full_cleanup = now;
            debug!(
                remaining_entries = state.hysteresis.len(),
                "performed full hysteresis map cleanup"
            );
        }

        for pid in selected.iter() {
            state
                .hysteresis
                .insert(pid.clone(), now + self.config.hysteresis_duration);
        }

        let mut grace_count = 0;
        for (pid, expiry) in &state.hysteresis {
            if *expiry > now && processes.contains_key(pid) && !selected.contains(pid) {
                selected.insert(pid.clone());
                grace_count += 1;
            }
        }
        if grace_count > 0 {
            debug!(
                hysteresis_processes = grace_count,
                total_selected = selected.len(),
                "retained processes under hysteresis"
            );
        }
    }
}

impl MetricsStage for AdaptiveTopK {
    fn name(&self) -> &'static str {
        "adaptivetopk"
    }

    fn consume_metrics(&self, _ctx: &BatchContext, mut batch: MetricBatch) -> Result<MetricBatch> {
        let original_points = count_points(&batch);
        let mut state = self.state.lock();

        if self.config.is_dynamic() {
            // An absent load metric leaves K unchanged.
            if let Some(load) = self.find_host_load(&batch) {
                let new_k = self.k_for_load(load);
                if new_k != state.current_k {
                    info!(
                        host_load = load,
                        previous_k = state.current_k,
                        new_k,
                        "dynamic K adjusted"
                    );
                    state.current_k = new_k;
                    self.observer
                        .reporter()
                        .set_gauge(gauge::CURRENT_K_VALUE, new_k as f64);
                }
            }
        } else {
            state.current_k = self.config.k_value;
        }
        let current_k = state.current_k;

        let processes = self.collect_processes(&batch);

        let mut selected: AHashSet<String> = processes
            .iter()
            .filter(|(_, info)| info.is_critical)
            .map(|(pid, _)| pid.clone())
            .collect();
        let topk_count = self.select_top_k(&processes, current_k, &mut selected);
        self.observer
            .reporter()
            .add_counter(counter::TOPK_SELECTED, topk_count as u64);

        if self.config.is_dynamic() && !self.config.hysteresis_duration.is_zero() {
            self.apply_hysteresis(&mut state, &mut selected, &processes);
        }
        drop(state);

        retain_number_points(&mut batch, |_, dp: &NumberDataPoint| {
            dp.attributes
                .get_str(PROCESS_PID_KEY)
                .map(|pid| selected.contains(pid))
                .unwrap_or(false)
        });

        let processed = count_points(&batch);
        self.observer
            .end_op(processed, original_points.saturating_sub(processed));
        Ok(batch)
    }
}
