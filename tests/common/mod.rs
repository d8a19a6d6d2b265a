//! Shared builders for pipeline integration tests.

use procsift::metrics::{
    AttrMap, Metric, MetricBatch, NumberDataPoint, NumberValue, ResourceMetrics, ScopeMetrics,
};

/// A Gauge/Sum datapoint for the given pid and value.
pub fn process_point(pid: &str, value: f64) -> NumberDataPoint {
    NumberDataPoint::new(
        NumberValue::Double(value),
        [("process.pid", pid)].into_iter().collect(),
    )
}

/// Same as [`process_point`] with extra attributes.
pub fn process_point_with(
    pid: &str,
    value: f64,
    extra: &[(&str, &str)],
) -> NumberDataPoint {
    let mut attrs: AttrMap = [("process.pid", pid)].into_iter().collect();
    for (k, v) in extra {
        attrs.put(*k, *v);
    }
    NumberDataPoint::new(NumberValue::Double(value), attrs)
}

/// A single-resource, single-scope batch.
pub fn host_batch(host: &str, metrics: Vec<Metric>) -> MetricBatch {
    MetricBatch {
        resources: vec![ResourceMetrics {
            attributes: [("host.name", host)].into_iter().collect(),
            scopes: vec![ScopeMetrics {
                scope_name: "procsift-test".to_string(),
                scope_version: "0.1".to_string(),
                metrics,
            }],
        }],
    }
}

/// Distinct pids surviving anywhere in Gauge/Sum metrics, sorted.
pub fn surviving_pids(batch: &MetricBatch) -> Vec<String> {
    let mut pids = Vec::new();
    procsift::metrics::for_each_number_point(batch, |_, dp| {
        if let Some(pid) = dp.attributes.get_str("process.pid") {
            pids.push(pid.to_string());
        }
    });
    pids.sort();
    pids.dedup();
    pids
}

/// All datapoints of a named metric across the batch.
pub fn points_of<'a>(batch: &'a MetricBatch, metric: &str) -> Vec<&'a NumberDataPoint> {
    let mut out = Vec::new();
    for resource in &batch.resources {
        for scope in &resource.scopes {
            for m in &scope.metrics {
                if m.name == metric {
                    if let Some(points) = m.number_points() {
                        out.extend(points.iter());
                    }
                }
            }
        }
    }
    out
}
