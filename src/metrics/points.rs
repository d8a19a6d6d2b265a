//! Shared datapoint helpers used by every stage.

use super::model::{MetricBatch, MetricData, NumberDataPoint};

/// Counts datapoints of every type across the whole batch.
pub fn count_points(batch: &MetricBatch) -> usize {
    batch
        .resources
        .iter()
        .flat_map(|r| r.scopes.iter())
        .flat_map(|s| s.metrics.iter())
        .map(|m| m.point_count())
        .sum()
}

/// Visits every Gauge/Sum datapoint in the batch together with its metric
/// name. Other metric types are skipped.
pub fn for_each_number_point<F>(batch: &MetricBatch, mut f: F)
where
    F: FnMut(&str, &NumberDataPoint),
{
    for resource in &batch.resources {
        for scope in &resource.scopes {
            for metric in &scope.metrics {
                if let Some(points) = metric.number_points() {
                    for point in points {
                        f(&metric.name, point);
                    }
                }
            }
        }
    }
}

/// Visits every Gauge/Sum datapoint mutably.
pub fn for_each_number_point_mut<F>(batch: &mut MetricBatch, mut f: F)
where
    F: FnMut(&str, &mut NumberDataPoint),
{
    for resource in &mut batch.resources {
        for scope in &mut resource.scopes {
            for metric in &mut scope.metrics {
                let name = metric.name.clone();
                if let Some(points) = metric.number_points_mut() {
                    for point in points {
                        f(&name, point);
                    }
                }
            }
        }
    }
}

/// Retains only the Gauge/Sum datapoints for which the predicate holds,
/// then prunes empty metrics, scopes and resources. Non-numeric metric
/// types are left untouched.
pub fn retain_number_points<F>(batch: &mut MetricBatch, mut pred: F)
where
    F: FnMut(&str, &NumberDataPoint) -> bool,
{
    for resource in &mut batch.resources {
        for scope in &mut resource.scopes {
            for metric in &mut scope.metrics {
                match &mut metric.data {
                    MetricData::Gauge { points } | MetricData::Sum { points, .. } => {
                        let name = metric.name.clone();
                        points.retain(|p| pred(&name, p));
                    }
                    _ => {}
                }
            }
        }
    }
    batch.prune_empty();
}
