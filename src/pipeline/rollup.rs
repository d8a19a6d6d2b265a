//! OthersRollup: folds discarded non-critical datapoints into one
//! aggregate `_other_` series per resource and metric.
//!
//! Runs last in the canonical pipeline so it sees exactly what the
//! selectors discarded. Critical datapoints and non-numeric metric types
//! pass through verbatim; everything else is accumulated per
//! `(resource fingerprint, metric name)` and re-emitted as a single
//! synthetic datapoint.

use super::{is_critical, BatchContext, MetricsStage, StageObserver};
use crate::core::config::{
    AggregationKind, OthersRollupConfig, PROCESS_EXECUTABLE_NAME_KEY, PROCESS_PID_KEY,
};
use crate::core::Result;
use crate::metrics::{
    count_points, AttrMap, Metric, MetricBatch, MetricData, NumberDataPoint, NumberValue,
    ResourceMetrics, ScopeMetrics, Temporality,
};
use crate::monitoring::{counter, MetricsReporter};
use ahash::AHashSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Running aggregate for one rolled-up metric under one resource.
struct RollupState {
    sum: f64,
    count: u64,
    kind: AggregationKind,
    /// Metadata of the first matching source metric.
    description: String,
    unit: String,
    /// Sum-shape of the source, preserved when emitting sum-aggregated Sums.
    source_sum: Option<(bool, Temporality)>,
    /// Output resource index the metric first appeared under.
    resource_idx: usize,
    /// Scope index the source metric first appeared under.
    scope_idx: usize,
    /// Distinct pids folded into this aggregate.
    pids: AHashSet<String>,
}

/// The others-rollup stage.
pub struct OthersRollup {
    config: OthersRollupConfig,
    observer: StageObserver,
}

impl OthersRollup {
    /// Builds the stage, validating the configuration.
    pub fn new(config: OthersRollupConfig, reporter: Arc<dyn MetricsReporter>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            observer: StageObserver::new("othersrollup", reporter),
        })
    }

    /// True when this datapoint is folded into the aggregate.
    fn should_rollup(&self, metric_name: &str, attrs: &AttrMap) -> bool {
        if is_critical(
            attrs,
            &self.config.priority_attribute_name,
            &self.config.critical_attribute_value,
        ) {
            return false;
        }
        if !self.config.metrics_to_rollup.is_empty()
            && !self.config.metrics_to_rollup.iter().any(|m| m == metric_name)
        {
            return false;
        }
        true
    }

    /// Aggregation kind for a metric: explicit config first, then the
    /// type default (Gauge averages, Sum sums).
    fn aggregation_kind(&self, metric_name: &str, data: &MetricData) -> AggregationKind {
        if let Some(kind) = self.config.aggregations.get(metric_name) {
            return *kind;
        }
        match data {
            MetricData::Gauge { .. } => AggregationKind::Avg,
            _ => AggregationKind::Sum,
        }
    }

    /// Builds the synthetic `_other_` metric for one accumulated state.
    fn build_rollup_metric(&self, name: &str, state: &RollupState) -> Metric {
        let value = match state.kind {
            AggregationKind::Avg if state.count > 0 => state.sum / state.count as f64,
            _ => state.sum,
        };
        let mut attrs = AttrMap::new();
        attrs.put(PROCESS_PID_KEY, self.config.output_pid_attribute_value.clone());
        attrs.put(
            PROCESS_EXECUTABLE_NAME_KEY,
            self.config.output_executable_name_attribute_value.clone(),
        );
        let point = NumberDataPoint {
            value: NumberValue::Double(value),
            timestamp: SystemTime::now(),
            attributes: attrs,
        };

        let data = match (state.kind, state.source_sum) {
            // A sum-aggregated Sum keeps its shape: monotonicity and
            // temporality survive the rollup.
            (AggregationKind::Sum, Some((monotonic, temporality))) => MetricData::Sum {
                monotonic,
                temporality,
                points: vec![point],
            },
            _ => MetricData::Gauge { points: vec![point] },
        };

        Metric {
            name: name.to_string(),
            description: state.description.clone(),
            unit: state.unit.clone(),
            data,
        }
    }
}

impl MetricsStage for OthersRollup {
    fn name(&self) -> &'static str {
        "othersrollup"
    }

    fn consume_metrics(&self, _ctx: &BatchContext, batch: MetricBatch) -> Result<MetricBatch> {
        let original_points = count_points(&batch);
        let mut output = MetricBatch::new();

        // Accumulation spans the whole batch: fingerprint -> metric name ->
        // state. The fingerprint canonicalizes attribute order, so every
        // ResourceMetrics node carrying the same resource identity feeds one
        // shared aggregate.
        let mut rollup: HashMap<String, HashMap<String, RollupState>> = HashMap::new();

        for (resource_idx, resource) in batch.resources.into_iter().enumerate() {
            let fingerprint = resource.fingerprint();

            let mut out_resource = ResourceMetrics {
                attributes: resource.attributes.clone(),
                scopes: Vec::new(),
            };

            for (scope_idx, scope) in resource.scopes.into_iter().enumerate() {
                let mut out_scope = ScopeMetrics {
                    scope_name: scope.scope_name.clone(),
                    scope_version: scope.scope_version.clone(),
                    metrics: Vec::new(),
                };

                for metric in scope.metrics {
                    // Histograms, summaries and exponential histograms are
                    // never aggregated, even when whitelisted.
                    if metric.number_points().is_none() {
                        out_scope.metrics.push(metric);
                        continue;
                    }

                    let kind = self.aggregation_kind(&metric.name, &metric.data);
                    let source_sum = match &metric.data {
                        MetricData::Sum {
                            monotonic,
                            temporality,
                            ..
                        } => Some((*monotonic, *temporality)),
                        _ => None,
                    };
                    let Metric {
                        name,
                        description,
                        unit,
                        data,
                    } = metric;
                    let points = match data {
                        MetricData::Gauge { points } | MetricData::Sum { points, .. } => points,
                        _ => unreachable!("non-numeric metrics were passed through above"),
                    };

                    let mut keep: Vec<NumberDataPoint> = Vec::new();
                    for dp in points {
                        if self.should_rollup(&name, &dp.attributes) {
                            let state = rollup
                                .entry(fingerprint.clone())
                                .or_default()
                                .entry(name.clone())
                                .or_insert_with(|| RollupState {
                                    sum: 0.0,
                                    count: 0,
                                    kind,
                                    description: description.clone(),
                                    unit: unit.clone(),
                                    source_sum,
                                    resource_idx,
                                    scope_idx,
                                    pids: AHashSet::new(),
                                });
                            state.sum += dp.value.as_f64();
                            state.count += 1;
                            if let Some(pid) = dp.attributes.get_str(PROCESS_PID_KEY) {
                                state.pids.insert(pid.to_string());
                            }
                        } else {
                            keep.push(dp);
                        }
                    }

                    if !keep.is_empty() {
                        let data = match source_sum {
                            Some((monotonic, temporality)) => MetricData::Sum {
                                monotonic,
                                temporality,
                                points: keep,
                            },
                            None => MetricData::Gauge { points: keep },
                        };
                        out_scope.metrics.push(Metric {
                            name,
                            description,
                            unit,
                            data,
                        });
                    }
                }

                out_resource.scopes.push(out_scope);
            }

            output.resources.push(out_resource);
        }

        // Emit each aggregate once, into the resource and scope where its
        // metric first appeared.
        let mut aggregated_series = 0u64;
        let mut input_series = 0u64;
        let mut emitted: Vec<(usize, usize, Metric)> = Vec::new();
        for states in rollup.values() {
            for (name, state) in states {
                if state.count == 0 {
                    continue;
                }
                aggregated_series += 1;
                input_series += state.pids.len() as u64;
                emitted.push((
                    state.resource_idx,
                    state.scope_idx,
                    self.build_rollup_metric(name, state),
                ));
            }
        }
        // Stable output order regardless of map iteration.
        emitted.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.name.cmp(&b.2.name))
        });
        for (resource_idx, scope_idx, metric) in emitted {
            if let Some(scope) = output
                .resources
                .get_mut(resource_idx)
                .and_then(|r| r.scopes.get_mut(scope_idx))
            {
                scope.metrics.push(metric);
            }
        }

        self.observer
            .reporter()
            .add_counter(counter::AGGREGATED_SERIES, aggregated_series);
        self.observer
            .reporter()
            .add_counter(counter::INPUT_SERIES_ROLLED_UP, input_series);

        output.prune_empty();
        let processed = count_points(&output);
        self.observer
            .end_op(processed, original_points.saturating_sub(processed));
        if output.is_empty() {
            debug!("all datapoints rolled up or dropped, batch is empty");
        }
        Ok(output)
    }
}
