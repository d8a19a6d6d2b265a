//! The in-memory metric batch tree.
//!
//! A batch is a three-level tree: resource (host identity), scope
//! (instrumentation library), metric (name + type + datapoints). Stages
//! mutate datapoint attributes in place or remove datapoints; empty
//! metrics, scopes and resources are pruned after filtering.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// An attribute value on a datapoint, resource or scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// UTF-8 string value.
    Str(String),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// Boolean value.
    Bool(bool),
}

impl AttrValue {
    /// Renders the value as a string, the way identity hashing sees it.
    pub fn as_string(&self) -> String {
        match self {
            AttrValue::Str(s) => s.clone(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Double(d) => d.to_string(),
            AttrValue::Bool(b) => b.to_string(),
        }
    }

    /// Returns the numeric value as f64, if this is a numeric type.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the string slice if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(d: f64) -> Self {
        AttrValue::Double(d)
    }
}

/// An insertion-ordered attribute map.
///
/// Attribute counts per datapoint are small, so lookups are linear scans
/// over a flat vector. Insertion order is preserved; `sorted_pairs` gives
/// the canonical ordering used for fingerprints and identities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrMap {
    entries: Vec<(String, AttrValue)>,
}

impl AttrMap {
    /// Creates an empty attribute map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an attribute by key.
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Looks up a string attribute by key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    /// Inserts or replaces an attribute, preserving its original position
    /// on replacement.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Returns true when the map holds the given key.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no attributes are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns `(key, rendered value)` pairs sorted lexicographically by key.
    pub fn sorted_pairs(&self) -> Vec<(&str, String)> {
        let mut pairs: Vec<(&str, String)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_string()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }
}

impl<K: Into<String>, V: Into<AttrValue>> FromIterator<(K, V)> for AttrMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = AttrMap::new();
        for (k, v) in iter {
            map.put(k, v);
        }
        map
    }
}

/// Numeric value of a gauge or sum datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NumberValue {
    /// Integer observation.
    Int(i64),
    /// Floating point observation.
    Double(f64),
}

impl NumberValue {
    /// Returns the value as f64.
    pub fn as_f64(&self) -> f64 {
        match self {
            NumberValue::Int(i) => *i as f64,
            NumberValue::Double(d) => *d,
        }
    }
}

/// A gauge or sum datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberDataPoint {
    /// Observed value.
    pub value: NumberValue,
    /// Observation time.
    pub timestamp: SystemTime,
    /// Datapoint attributes.
    pub attributes: AttrMap,
}

impl NumberDataPoint {
    /// Creates a datapoint with the given value and attributes, stamped now.
    pub fn new(value: NumberValue, attributes: AttrMap) -> Self {
        Self {
            value,
            timestamp: SystemTime::now(),
            attributes,
        }
    }
}

/// A histogram datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramDataPoint {
    /// Total observation count.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
    /// Upper bucket boundaries.
    pub bounds: Vec<f64>,
    /// Per-bucket counts (len = bounds.len() + 1).
    pub bucket_counts: Vec<u64>,
    /// Observation time.
    pub timestamp: SystemTime,
    /// Datapoint attributes.
    pub attributes: AttrMap,
}

/// One quantile of a summary datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryQuantile {
    /// Quantile in `[0, 1]`.
    pub quantile: f64,
    /// Value at the quantile.
    pub value: f64,
}

/// A summary datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryDataPoint {
    /// Total observation count.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
    /// Quantile values.
    pub quantiles: Vec<SummaryQuantile>,
    /// Observation time.
    pub timestamp: SystemTime,
    /// Datapoint attributes.
    pub attributes: AttrMap,
}

/// An exponential histogram datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpHistogramDataPoint {
    /// Total observation count.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
    /// Scale factor of the bucket layout.
    pub scale: i32,
    /// Count of zero-valued observations.
    pub zero_count: u64,
    /// Positive-range bucket counts.
    pub positive_buckets: Vec<u64>,
    /// Negative-range bucket counts.
    pub negative_buckets: Vec<u64>,
    /// Observation time.
    pub timestamp: SystemTime,
    /// Datapoint attributes.
    pub attributes: AttrMap,
}

/// Aggregation temporality of a sum or histogram metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Temporality {
    /// Each point covers the interval since the previous report.
    Delta,
    /// Each point covers the interval since a fixed start.
    Cumulative,
}

/// The typed datapoint list of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricData {
    /// Instantaneous measurements.
    Gauge {
        /// Gauge datapoints.
        points: Vec<NumberDataPoint>,
    },
    /// Summed measurements with monotonicity and temporality.
    Sum {
        /// True when the sum never decreases.
        monotonic: bool,
        /// Aggregation temporality.
        temporality: Temporality,
        /// Sum datapoints.
        points: Vec<NumberDataPoint>,
    },
    /// Bucketed distributions.
    Histogram {
        /// Aggregation temporality.
        temporality: Temporality,
        /// Histogram datapoints.
        points: Vec<HistogramDataPoint>,
    },
    /// Pre-computed quantile summaries.
    Summary {
        /// Summary datapoints.
        points: Vec<SummaryDataPoint>,
    },
    /// Exponential-bucket distributions.
    ExponentialHistogram {
        /// Aggregation temporality.
        temporality: Temporality,
        /// Exponential histogram datapoints.
        points: Vec<ExpHistogramDataPoint>,
    },
}

/// One named metric with its typed datapoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Unit of measure.
    pub unit: String,
    /// Typed datapoint list.
    pub data: MetricData,
}

impl Metric {
    /// Creates a gauge metric.
    pub fn gauge(name: impl Into<String>, points: Vec<NumberDataPoint>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            unit: String::new(),
            data: MetricData::Gauge { points },
        }
    }

    /// Creates a sum metric.
    pub fn sum(
        name: impl Into<String>,
        monotonic: bool,
        temporality: Temporality,
        points: Vec<NumberDataPoint>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            unit: String::new(),
            data: MetricData::Sum {
                monotonic,
                temporality,
                points,
            },
        }
    }

    /// Gauge/Sum datapoints, or None for other metric types.
    pub fn number_points(&self) -> Option<&[NumberDataPoint]> {
        match &self.data {
            MetricData::Gauge { points } | MetricData::Sum { points, .. } => Some(points),
            _ => None,
        }
    }

    /// Mutable Gauge/Sum datapoints, or None for other metric types.
    pub fn number_points_mut(&mut self) -> Option<&mut Vec<NumberDataPoint>> {
        match &mut self.data {
            MetricData::Gauge { points } | MetricData::Sum { points, .. } => Some(points),
            _ => None,
        }
    }

    /// Total datapoints of any type in this metric.
    pub fn point_count(&self) -> usize {
        match &self.data {
            MetricData::Gauge { points } | MetricData::Sum { points, .. } => points.len(),
            MetricData::Histogram { points, .. } => points.len(),
            MetricData::Summary { points } => points.len(),
            MetricData::ExponentialHistogram { points, .. } => points.len(),
        }
    }
}

/// Metrics grouped by instrumentation scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeMetrics {
    /// Instrumentation scope name.
    pub scope_name: String,
    /// Instrumentation scope version.
    pub scope_version: String,
    /// Metrics emitted by the scope.
    pub metrics: Vec<Metric>,
}

/// Metrics grouped by emitting resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Resource identity attributes (e.g. `host.name`).
    pub attributes: AttrMap,
    /// Scopes under this resource.
    pub scopes: Vec<ScopeMetrics>,
}

impl ResourceMetrics {
    /// Canonical resource fingerprint: `k:v;` pairs over the attributes
    /// sorted lexicographically by key.
    pub fn fingerprint(&self) -> String {
        if self.attributes.is_empty() {
            return "empty_resource".to_string();
        }
        let mut out = String::new();
        for (key, value) in self.attributes.sorted_pairs() {
            out.push_str(key);
            out.push(':');
            out.push_str(&value);
            out.push(';');
        }
        out
    }
}

/// One in-flight batch of metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    /// Resources in this batch.
    pub resources: Vec<ResourceMetrics>,
}

impl MetricBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the batch holds no resources.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Removes empty metrics, then empty scopes, then empty resources.
    pub fn prune_empty(&mut self) {
        for resource in &mut self.resources {
            for scope in &mut resource.scopes {
                scope.metrics.retain(|m| m.point_count() > 0);
            }
            resource.scopes.retain(|s| !s.metrics.is_empty());
        }
        self.resources.retain(|r| !r.scopes.is_empty());
    }
}
