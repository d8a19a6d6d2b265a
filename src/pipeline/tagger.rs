//! PriorityTagger: stamps the critical marker on datapoints matching
//! name, pattern, CPU or memory rules.
//!
//! The tag is idempotent and applies to every datapoint type. Downstream
//! stages treat tagged datapoints as pass-through, so tagging must run
//! before the selectors.

use super::{BatchContext, MetricsStage, StageObserver};
use crate::core::config::{
    PriorityTaggerConfig, PROCESS_CPU_UTILIZATION_KEY, PROCESS_EXECUTABLE_NAME_KEY,
    PROCESS_MEMORY_RSS_KEY, PROCESS_PID_KEY,
};
use crate::core::Result;
use crate::metrics::{count_points, AttrMap, MetricBatch, MetricData};
use crate::monitoring::{counter, MetricsReporter};
use ahash::AHashSet;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// The priority tagging stage.
pub struct PriorityTagger {
    config: PriorityTaggerConfig,
    patterns: Vec<Regex>,
    observer: StageObserver,
}

impl PriorityTagger {
    /// Builds the stage, validating the configuration.
    pub fn new(config: PriorityTaggerConfig, reporter: Arc<dyn MetricsReporter>) -> Result<Self> {
        config.validate()?;
        let patterns = config.compile_patterns()?;
        Ok(Self {
            config,
            patterns,
            observer: StageObserver::new("prioritytagger", reporter),
        })
    }

    /// True when any tagging rule fires for the given attributes.
    fn is_critical_process(&self, attrs: &AttrMap) -> bool {
        // Already tagged: re-tagging is a no-op but the marker is honored.
        if attrs.get_str(&self.config.priority_attribute_name)
            == Some(self.config.critical_attribute_value.as_str())
        {
            return true;
        }

        if let Some(exe) = attrs.get_str(PROCESS_EXECUTABLE_NAME_KEY) {
            if self.config.critical_executables.iter().any(|name| name == exe) {
                return true;
            }
            if self.patterns.iter().any(|re| re.is_match(exe)) {
                return true;
            }
        }

        if self.config.cpu_steady_state_threshold >= 0.0 {
            if let Some(cpu) = attrs.get(PROCESS_CPU_UTILIZATION_KEY).and_then(|v| v.as_f64()) {
                if cpu > self.config.cpu_steady_state_threshold {
                    return true;
                }
            }
        }

        if self.config.memory_rss_threshold_mib >= 0 {
            // RSS arrives in bytes; the threshold is MiB.
            if let Some(rss) = attrs.get(PROCESS_MEMORY_RSS_KEY).and_then(|v| v.as_f64()) {
                let rss_mib = (rss / (1024.0 * 1024.0)) as i64;
                if rss_mib > self.config.memory_rss_threshold_mib {
                    return true;
                }
            }
        }

        false
    }

    fn mark_critical(&self, attrs: &mut AttrMap) {
        attrs.put(
            self.config.priority_attribute_name.clone(),
            self.config.critical_attribute_value.clone(),
        );
    }

    /// Unique process key for the tagged-process counter. Falls back to the
    /// executable name when no pid is present.
    fn process_key(attrs: &AttrMap) -> Option<String> {
        attrs
            .get_str(PROCESS_PID_KEY)
            .or_else(|| attrs.get_str(PROCESS_EXECUTABLE_NAME_KEY))
            .map(str::to_string)
    }
}

impl MetricsStage for PriorityTagger {
    fn name(&self) -> &'static str {
        "prioritytagger"
    }

    fn consume_metrics(&self, _ctx: &BatchContext, mut batch: MetricBatch) -> Result<MetricBatch> {
        let processed = count_points(&batch);
        let mut tagged: AHashSet<String> = AHashSet::new();

        for resource in &mut batch.resources {
            for scope in &mut resource.scopes {
                for metric in &mut scope.metrics {
                    for_each_point_attrs_mut(&mut metric.data, |attrs| {
                        if self.is_critical_process(attrs) {
                            self.mark_critical(attrs);
                            if let Some(key) = Self::process_key(attrs) {
                                tagged.insert(key);
                            }
                        }
                    });
                }
            }
        }

        self.observer
            .reporter()
            .add_counter(counter::TAGGED_PROCESSES, tagged.len() as u64);
        self.observer.end_op(processed, 0);

        debug!(
            processed_points = processed,
            tagged_processes = tagged.len(),
            "priority tagger processed batch"
        );
        Ok(batch)
    }
}

/// Applies `f` to the attribute map of every datapoint, whatever its type.
fn for_each_point_attrs_mut<F>(data: &mut MetricData, mut f: F)
where
    F: FnMut(&mut AttrMap),
{
    match data {
        MetricData::Gauge { points } | MetricData::Sum { points, .. } => {
            for p in points {
                f(&mut p.attributes);
            }
        }
        MetricData::Histogram { points, .. } => {
            for p in points {
                f(&mut p.attributes);
            }
        }
        MetricData::Summary { points } => {
            for p in points {
                f(&mut p.attributes);
            }
        }
        MetricData::ExponentialHistogram { points, .. } => {
            for p in points {
                f(&mut p.attributes);
            }
        }
    }
}
