//! Configuration for the pipeline stages and the trace reservoir.
//!
//! Every stage config mirrors the recognized options of its stage, carries
//! production defaults, and is validated before a component is built.
//! Validation failures are `SiftError::Config` and prevent creation; nothing
//! on the data path re-validates.

use crate::core::{Result, SiftError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Attribute key carrying the process identifier.
pub const PROCESS_PID_KEY: &str = "process.pid";
/// Attribute key carrying the process executable name.
pub const PROCESS_EXECUTABLE_NAME_KEY: &str = "process.executable.name";
/// Attribute key carrying process CPU utilization.
pub const PROCESS_CPU_UTILIZATION_KEY: &str = "process.cpu.utilization";
/// Attribute key carrying process resident set size in bytes.
pub const PROCESS_MEMORY_RSS_KEY: &str = "process.memory.rss";

/// Configuration for the PriorityTagger stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityTaggerConfig {
    /// Executable names that are always tagged critical (exact match).
    pub critical_executables: Vec<String>,
    /// Regex patterns matched (unanchored) against the executable name.
    pub critical_executable_patterns: Vec<String>,
    /// CPU utilization above which a datapoint is tagged critical.
    /// Negative disables the rule.
    pub cpu_steady_state_threshold: f64,
    /// Memory RSS in MiB above which a datapoint is tagged critical.
    /// Negative disables the rule.
    pub memory_rss_threshold_mib: i64,
    /// Attribute name used to mark critical datapoints.
    pub priority_attribute_name: String,
    /// Attribute value marking a datapoint as critical.
    pub critical_attribute_value: String,
}

impl Default for PriorityTaggerConfig {
    fn default() -> Self {
        Self {
            critical_executables: Vec::new(),
            critical_executable_patterns: Vec::new(),
            cpu_steady_state_threshold: -1.0,
            memory_rss_threshold_mib: -1,
            priority_attribute_name: "nr.priority".to_string(),
            critical_attribute_value: "critical".to_string(),
        }
    }
}

impl PriorityTaggerConfig {
    /// Validates the configuration, compiling regex patterns as a side check.
    pub fn validate(&self) -> Result<()> {
        if self.critical_executables.is_empty()
            && self.critical_executable_patterns.is_empty()
            && self.cpu_steady_state_threshold < 0.0
            && self.memory_rss_threshold_mib < 0
        {
            return Err(SiftError::config(
                "at least one tagging rule must be active: critical_executables, \
                 critical_executable_patterns, cpu_steady_state_threshold or \
                 memory_rss_threshold_mib",
            ));
        }
        if self.priority_attribute_name.is_empty() {
            return Err(SiftError::config("priority_attribute_name cannot be empty"));
        }
        if self.critical_attribute_value.is_empty() {
            return Err(SiftError::config("critical_attribute_value cannot be empty"));
        }
        self.compile_patterns()?;
        Ok(())
    }

    /// Compiles the configured patterns, rejecting empty or invalid ones.
    pub fn compile_patterns(&self) -> Result<Vec<Regex>> {
        let mut patterns = Vec::with_capacity(self.critical_executable_patterns.len());
        for pattern in &self.critical_executable_patterns {
            if pattern.is_empty() {
                return Err(SiftError::config("regex pattern cannot be empty"));
            }
            let re = Regex::new(pattern).map_err(|e| {
                SiftError::config(format!("invalid regex pattern {pattern:?}: {e}"))
            })?;
            patterns.push(re);
        }
        Ok(patterns)
    }
}

/// One load band: hosts at or above `threshold` use `k` as the selection size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LoadBand {
    /// Host load threshold in `[0.0, 1.0]`.
    pub threshold: f64,
    /// K value applied when this band is the highest one at or below the load.
    pub k: usize,
}

/// Configuration for the AdaptiveTopK stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTopKConfig {
    /// Fixed number of top processes to keep. Ignored in dynamic mode.
    pub k_value: usize,
    /// Metric used to rank processes (e.g. `process.cpu.utilization`).
    pub key_metric_name: String,
    /// Optional metric used to break ranking ties.
    pub secondary_key_metric_name: String,
    /// Attribute name identifying critical datapoints.
    pub priority_attribute_name: String,
    /// Attribute value identifying critical datapoints.
    pub critical_attribute_value: String,
    /// Host load metric enabling dynamic K when non-empty.
    pub host_load_metric_name: String,
    /// Load bands mapping host load thresholds to K values.
    /// When thresholds repeat, the last entry wins (map semantics).
    pub load_bands_to_k_map: Vec<LoadBand>,
    /// How long a process stays selected after dropping out of the top K.
    #[serde(with = "humantime_serde")]
    pub hysteresis_duration: Duration,
    /// Lower clamp for dynamic K.
    pub min_k_value: usize,
    /// Upper clamp for dynamic K.
    pub max_k_value: usize,
}

impl Default for AdaptiveTopKConfig {
    fn default() -> Self {
        Self {
            k_value: 10,
            key_metric_name: PROCESS_CPU_UTILIZATION_KEY.to_string(),
            secondary_key_metric_name: String::new(),
            priority_attribute_name: "nr.priority".to_string(),
            critical_attribute_value: "critical".to_string(),
            host_load_metric_name: String::new(),
            load_bands_to_k_map: Vec::new(),
            hysteresis_duration: Duration::from_secs(60),
            min_k_value: 5,
            max_k_value: 20,
        }
    }
}

impl AdaptiveTopKConfig {
    /// Returns true when the stage follows host load instead of a fixed K.
    pub fn is_dynamic(&self) -> bool {
        !self.host_load_metric_name.is_empty()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.key_metric_name.is_empty() {
            return Err(SiftError::config("key_metric_name must be specified"));
        }
        if self.priority_attribute_name.is_empty() {
            return Err(SiftError::config("priority_attribute_name must be specified"));
        }
        if self.critical_attribute_value.is_empty() {
            return Err(SiftError::config("critical_attribute_value must be specified"));
        }

        if self.is_dynamic() {
            if self.load_bands_to_k_map.is_empty() {
                return Err(SiftError::config(
                    "load_bands_to_k_map must be specified when host_load_metric_name is set",
                ));
            }
            if self.min_k_value == 0 {
                return Err(SiftError::config(
                    "min_k_value must be positive when host_load_metric_name is set",
                ));
            }
            if self.max_k_value < self.min_k_value {
                return Err(SiftError::config(
                    "max_k_value must be greater than or equal to min_k_value",
                ));
            }
            for band in &self.load_bands_to_k_map {
                if !(0.0..=1.0).contains(&band.threshold) {
                    return Err(SiftError::config(format!(
                        "load threshold must be between 0.0 and 1.0, got {:.2}",
                        band.threshold
                    )));
                }
                if band.k == 0 {
                    return Err(SiftError::config(format!(
                        "k value in load_bands_to_k_map must be positive for threshold {:.2}",
                        band.threshold
                    )));
                }
            }
        } else if self.k_value == 0 {
            return Err(SiftError::config(
                "either k_value (fixed K) or host_load_metric_name (dynamic K) must be configured",
            ));
        }

        Ok(())
    }
}

/// Configuration for the metrics ReservoirSampler stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservoirSamplerConfig {
    /// Maximum number of process identities kept in the reservoir.
    pub reservoir_size: usize,
    /// Attributes combined into the sampling identity of a datapoint.
    pub identity_attributes: Vec<String>,
    /// Attribute name stamped on sampled datapoints.
    pub sampled_attribute_name: String,
    /// Attribute value stamped on sampled datapoints.
    pub sampled_attribute_value: String,
    /// Attribute name carrying the effective sample rate.
    pub sample_rate_attribute_name: String,
    /// Attribute name identifying critical datapoints.
    pub priority_attribute_name: String,
    /// Attribute value identifying critical datapoints.
    pub critical_attribute_value: String,
}

impl Default for ReservoirSamplerConfig {
    fn default() -> Self {
        Self {
            reservoir_size: 100,
            identity_attributes: vec![PROCESS_PID_KEY.to_string()],
            sampled_attribute_name: "nr.process_sampled_by_reservoir".to_string(),
            sampled_attribute_value: "true".to_string(),
            sample_rate_attribute_name: "nr.sample_rate".to_string(),
            priority_attribute_name: "nr.priority".to_string(),
            critical_attribute_value: "critical".to_string(),
        }
    }
}

impl ReservoirSamplerConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.reservoir_size == 0 {
            return Err(SiftError::config("reservoir_size must be positive"));
        }
        if self.identity_attributes.is_empty() {
            return Err(SiftError::config("identity_attributes must be specified"));
        }
        for attr in &self.identity_attributes {
            if attr.trim().is_empty() {
                return Err(SiftError::config(
                    "identity_attributes cannot contain blank entries",
                ));
            }
        }
        if self.sampled_attribute_name.is_empty() {
            return Err(SiftError::config("sampled_attribute_name cannot be empty"));
        }
        if self.sampled_attribute_value.is_empty() {
            return Err(SiftError::config("sampled_attribute_value cannot be empty"));
        }
        if self.sample_rate_attribute_name.is_empty() {
            return Err(SiftError::config("sample_rate_attribute_name cannot be empty"));
        }
        if self.priority_attribute_name.is_empty() {
            return Err(SiftError::config("priority_attribute_name must be specified"));
        }
        if self.critical_attribute_value.is_empty() {
            return Err(SiftError::config("critical_attribute_value must be specified"));
        }
        Ok(())
    }
}

/// How discarded datapoints of one metric are folded into the rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    /// Sum of the discarded values.
    Sum,
    /// Arithmetic mean of the discarded values.
    Avg,
}

/// Configuration for the OthersRollup stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OthersRollupConfig {
    /// `process.pid` value carried by emitted rollup datapoints.
    pub output_pid_attribute_value: String,
    /// `process.executable.name` value carried by emitted rollup datapoints.
    pub output_executable_name_attribute_value: String,
    /// Per-metric aggregation kind. Unlisted metrics default by type:
    /// Gauge to `avg`, Sum to `sum`.
    pub aggregations: HashMap<String, AggregationKind>,
    /// Whitelist of metric names to roll up. Empty means all.
    pub metrics_to_rollup: Vec<String>,
    /// Attribute name identifying critical datapoints.
    pub priority_attribute_name: String,
    /// Attribute value identifying critical datapoints.
    pub critical_attribute_value: String,
}

impl Default for OthersRollupConfig {
    fn default() -> Self {
        let mut aggregations = HashMap::new();
        aggregations.insert(PROCESS_CPU_UTILIZATION_KEY.to_string(), AggregationKind::Avg);
        aggregations.insert(PROCESS_MEMORY_RSS_KEY.to_string(), AggregationKind::Sum);
        Self {
            output_pid_attribute_value: "-1".to_string(),
            output_executable_name_attribute_value: "_other_".to_string(),
            aggregations,
            metrics_to_rollup: Vec::new(),
            priority_attribute_name: "nr.priority".to_string(),
            critical_attribute_value: "critical".to_string(),
        }
    }
}

impl OthersRollupConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.output_pid_attribute_value.is_empty() {
            return Err(SiftError::config("output_pid_attribute_value cannot be empty"));
        }
        if self.output_executable_name_attribute_value.is_empty() {
            return Err(SiftError::config(
                "output_executable_name_attribute_value cannot be empty",
            ));
        }
        if self.priority_attribute_name.is_empty() {
            return Err(SiftError::config("priority_attribute_name must be specified"));
        }
        if self.critical_attribute_value.is_empty() {
            return Err(SiftError::config("critical_attribute_value must be specified"));
        }
        for metric in self.aggregations.keys() {
            if metric.is_empty() {
                return Err(SiftError::config("metric name in aggregations cannot be empty"));
            }
        }
        Ok(())
    }
}

/// Configuration for the trace reservoir subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceReservoirConfig {
    /// Maximum number of spans kept per window.
    pub reservoir_size: usize,
    /// Duration of one sampling window.
    #[serde(with = "humantime_serde")]
    pub window_duration: Duration,
    /// When true, spans are buffered per trace and sampled on completion.
    pub trace_aware: bool,
    /// Maximum number of concurrently open traces in the buffer.
    pub max_trace_buffer: usize,
    /// A trace with no new spans for this long is considered complete.
    #[serde(with = "humantime_serde")]
    pub trace_inactivity_timeout: Duration,
    /// Checkpoint file path. Empty disables durable checkpoints.
    pub checkpoint_path: PathBuf,
    /// Store size above which compaction rewrites the checkpoint file.
    pub checkpoint_target_size_bytes: u64,
    /// How often the maintenance loop persists a checkpoint.
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
}

impl Default for TraceReservoirConfig {
    fn default() -> Self {
        Self {
            reservoir_size: 1000,
            window_duration: Duration::from_secs(60),
            trace_aware: true,
            max_trace_buffer: 10_000,
            trace_inactivity_timeout: Duration::from_secs(10),
            checkpoint_path: PathBuf::new(),
            checkpoint_target_size_bytes: 16 * 1024 * 1024,
            checkpoint_interval: Duration::from_secs(10),
        }
    }
}

impl TraceReservoirConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.reservoir_size == 0 {
            return Err(SiftError::config("reservoir_size must be positive"));
        }
        if self.window_duration.is_zero() {
            return Err(SiftError::config("window_duration must be positive"));
        }
        if self.trace_aware {
            if self.max_trace_buffer == 0 {
                return Err(SiftError::config(
                    "max_trace_buffer must be positive when trace_aware is enabled",
                ));
            }
            if self.trace_inactivity_timeout.is_zero() {
                return Err(SiftError::config(
                    "trace_inactivity_timeout must be positive when trace_aware is enabled",
                ));
            }
        }
        if !self.checkpoint_path.as_os_str().is_empty() && self.checkpoint_interval.is_zero() {
            return Err(SiftError::config(
                "checkpoint_interval must be positive when checkpoint_path is set",
            ));
        }
        Ok(())
    }

    /// Returns true when durable checkpoints are enabled.
    pub fn checkpointing_enabled(&self) -> bool {
        !self.checkpoint_path.as_os_str().is_empty()
    }
}

/// Complete configuration for the four-stage metric pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// PriorityTagger stage options.
    pub tagger: PriorityTaggerConfig,
    /// AdaptiveTopK stage options.
    pub topk: AdaptiveTopKConfig,
    /// ReservoirSampler stage options.
    pub sampler: ReservoirSamplerConfig,
    /// OthersRollup stage options.
    pub rollup: OthersRollupConfig,
}

impl PipelineConfig {
    /// Parses a pipeline configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| SiftError::config(format!("failed to parse YAML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every stage configuration.
    pub fn validate(&self) -> Result<()> {
        self.tagger.validate()?;
        self.topk.validate()?;
        self.sampler.validate()?;
        self.rollup.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pipeline_config_needs_a_tagger_rule() {
        // The tagger default has no active rule, so the pipeline default is
        // not valid as-is.
        let config = PipelineConfig::default();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.tagger.critical_executables.push("systemd".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tagger_rejects_bad_regex() {
        let config = PriorityTaggerConfig {
            critical_executable_patterns: vec!["[unclosed".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PriorityTaggerConfig {
            critical_executable_patterns: vec![String::new()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tagger_threshold_only_rule_is_enough() {
        let config = PriorityTaggerConfig {
            cpu_steady_state_threshold: 0.8,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_topk_fixed_requires_positive_k() {
        let config = AdaptiveTopKConfig {
            k_value: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topk_dynamic_validation() {
        let mut config = AdaptiveTopKConfig {
            host_load_metric_name: "system.cpu.utilization".to_string(),
            ..Default::default()
        };
        // Dynamic mode without bands is rejected.
        assert!(config.validate().is_err());

        config.load_bands_to_k_map = vec![
            LoadBand { threshold: 0.2, k: 5 },
            LoadBand { threshold: 0.8, k: 20 },
        ];
        assert!(config.validate().is_ok());

        config.load_bands_to_k_map.push(LoadBand { threshold: 1.5, k: 3 });
        assert!(config.validate().is_err());
        config.load_bands_to_k_map.pop();

        config.load_bands_to_k_map.push(LoadBand { threshold: 0.5, k: 0 });
        assert!(config.validate().is_err());
        config.load_bands_to_k_map.pop();

        config.max_k_value = config.min_k_value - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sampler_validation() {
        assert!(ReservoirSamplerConfig::default().validate().is_ok());

        let config = ReservoirSamplerConfig {
            reservoir_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ReservoirSamplerConfig {
            identity_attributes: vec!["  ".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rollup_defaults_are_valid() {
        let config = OthersRollupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.output_pid_attribute_value, "-1");
        assert_eq!(config.output_executable_name_attribute_value, "_other_");
        assert_eq!(
            config.aggregations.get(PROCESS_CPU_UTILIZATION_KEY),
            Some(&AggregationKind::Avg)
        );
        assert_eq!(
            config.aggregations.get(PROCESS_MEMORY_RSS_KEY),
            Some(&AggregationKind::Sum)
        );
    }

    #[test]
    fn test_trace_config_validation() {
        assert!(TraceReservoirConfig::default().validate().is_ok());

        let config = TraceReservoirConfig {
            reservoir_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TraceReservoirConfig {
            trace_aware: true,
            max_trace_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Non-trace-aware mode does not need buffer settings.
        let config = TraceReservoirConfig {
            trace_aware: false,
            max_trace_buffer: 0,
            trace_inactivity_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
tagger:
  critical_executables: ["systemd", "sshd"]
  cpu_steady_state_threshold: 0.9
topk:
  k_value: 25
  key_metric_name: process.cpu.utilization
  secondary_key_metric_name: process.memory.rss
sampler:
  reservoir_size: 50
  identity_attributes: ["process.pid", "process.executable.name"]
rollup:
  aggregations:
    process.cpu.utilization: avg
    process.disk.io: sum
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.tagger.critical_executables.len(), 2);
        assert_eq!(config.topk.k_value, 25);
        assert_eq!(config.sampler.reservoir_size, 50);
        assert_eq!(config.sampler.identity_attributes.len(), 2);
        assert_eq!(
            config.rollup.aggregations.get("process.disk.io"),
            Some(&AggregationKind::Sum)
        );
    }

    #[test]
    fn test_yaml_duration_parsing() {
        let yaml = r#"
tagger:
  critical_executables: ["init"]
topk:
  host_load_metric_name: system.cpu.utilization
  load_bands_to_k_map:
    - { threshold: 0.2, k: 5 }
    - { threshold: 0.8, k: 20 }
  hysteresis_duration: 90s
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert!(config.topk.is_dynamic());
        assert_eq!(config.topk.hysteresis_duration, Duration::from_secs(90));
    }
}
