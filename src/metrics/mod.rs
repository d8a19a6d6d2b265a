//! The metric batch tree and shared datapoint helpers.

pub mod model;
pub mod points;

pub use model::{
    AttrMap, AttrValue, ExpHistogramDataPoint, HistogramDataPoint, Metric, MetricBatch,
    MetricData, NumberDataPoint, NumberValue, ResourceMetrics, ScopeMetrics, SummaryDataPoint,
    SummaryQuantile, Temporality,
};
pub use points::{count_points, for_each_number_point, for_each_number_point_mut, retain_number_points};
