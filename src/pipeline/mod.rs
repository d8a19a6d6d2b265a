//! The four-stage metric reduction pipeline.
//!
//! Stages share one contract: consume a batch, return the mutated batch for
//! the next consumer. The canonical order is tag, top-K, sample, rollup.
//! Tagging must precede the selectors so the critical marker is honored;
//! rollup runs last so it can aggregate whatever the selectors discarded.
//! Each stage reports processed/dropped datapoint counts through the
//! shared [`MetricsReporter`](crate::monitoring::MetricsReporter) surface.

pub mod rollup;
pub mod sampler;
pub mod tagger;
pub mod topk;

pub use rollup::OthersRollup;
pub use sampler::ReservoirSampler;
pub use tagger::PriorityTagger;
pub use topk::AdaptiveTopK;

use crate::core::{PipelineConfig, Result, SiftError};
use crate::metrics::{count_points, AttrMap, MetricBatch};
use crate::monitoring::MetricsReporter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Declares how a stage treats the data it consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// True when the stage mutates the batch.
    pub mutates_data: bool,
}

/// Per-batch context threaded through the pipeline.
///
/// Cancellation aborts the in-progress batch at the next stage boundary;
/// stages never observe the token mid-scan.
#[derive(Debug, Clone, Default)]
pub struct BatchContext {
    cancel: CancellationToken,
}

impl BatchContext {
    /// Creates a context that is never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context driven by the given token.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Returns true once the batch has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A metric pipeline stage.
///
/// The host runtime invokes `consume_metrics` synchronously with one batch
/// at a time per pipeline instance; a stage may block its caller but never
/// introduces parallelism of its own.
pub trait MetricsStage: Send + Sync {
    /// Stage name used for logging and metric prefixes.
    fn name(&self) -> &'static str;

    /// Called once before the first batch.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once after the last batch.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Declares that the stage mutates data.
    fn capabilities(&self) -> Capabilities {
        Capabilities { mutates_data: true }
    }

    /// Consumes one batch and returns the batch to hand downstream.
    fn consume_metrics(&self, ctx: &BatchContext, batch: MetricBatch) -> Result<MetricBatch>;
}

/// Records per-stage processed/dropped datapoint counts.
pub(crate) struct StageObserver {
    reporter: Arc<dyn MetricsReporter>,
    processed_name: String,
    dropped_name: String,
}

impl StageObserver {
    pub(crate) fn new(stage: &str, reporter: Arc<dyn MetricsReporter>) -> Self {
        Self {
            processed_name: format!("{stage}.processed_points"),
            dropped_name: format!("{stage}.dropped_points"),
            reporter,
        }
    }

    pub(crate) fn reporter(&self) -> &Arc<dyn MetricsReporter> {
        &self.reporter
    }

    /// Records the outcome of one batch: points surviving and points dropped.
    pub(crate) fn end_op(&self, processed: usize, dropped: usize) {
        self.reporter.add_counter(&self.processed_name, processed as u64);
        self.reporter.add_counter(&self.dropped_name, dropped as u64);
    }
}

/// Reads the critical marker from a datapoint attribute map.
pub(crate) fn is_critical(attrs: &AttrMap, name: &str, value: &str) -> bool {
    attrs.get_str(name) == Some(value)
}

/// The composed four-stage pipeline.
///
/// Batches flow through the stages in submission order. A stage returning
/// an empty batch short-circuits the rest of the chain: there is nothing
/// left to tag, select or aggregate.
pub struct Pipeline {
    stages: Vec<Box<dyn MetricsStage>>,
}

impl Pipeline {
    /// Builds the canonical tag, top-K, sample, rollup pipeline from config.
    pub fn from_config(config: &PipelineConfig, reporter: Arc<dyn MetricsReporter>) -> Result<Self> {
        config.validate()?;
        let stages: Vec<Box<dyn MetricsStage>> = vec![
            Box::new(PriorityTagger::new(config.tagger.clone(), Arc::clone(&reporter))?),
            Box::new(AdaptiveTopK::new(config.topk.clone(), Arc::clone(&reporter))?),
            Box::new(ReservoirSampler::new(config.sampler.clone(), Arc::clone(&reporter))?),
            Box::new(OthersRollup::new(config.rollup.clone(), reporter)?),
        ];
        Ok(Self { stages })
    }

    /// Builds a pipeline from an explicit stage list.
    pub fn from_stages(stages: Vec<Box<dyn MetricsStage>>) -> Self {
        Self { stages }
    }

    /// Starts every stage in order.
    pub fn start(&self) -> Result<()> {
        for stage in &self.stages {
            stage.start()?;
        }
        Ok(())
    }

    /// Shuts every stage down in reverse order.
    pub fn shutdown(&self) -> Result<()> {
        for stage in self.stages.iter().rev() {
            stage.shutdown()?;
        }
        Ok(())
    }

    /// Runs one batch through the stages.
    ///
    /// Errors bubble up unchanged from the failing stage; the pipeline does
    /// not retry. Cancellation is honored between stages.
    pub fn consume(&self, ctx: &BatchContext, mut batch: MetricBatch) -> Result<MetricBatch> {
        for stage in &self.stages {
            if ctx.is_cancelled() {
                return Err(SiftError::Cancelled);
            }
            batch = stage.consume_metrics(ctx, batch)?;
            if batch.is_empty() {
                tracing::debug!(stage = stage.name(), "batch fully consumed, stopping early");
                return Ok(batch);
            }
        }
        tracing::debug!(points = count_points(&batch), "batch completed pipeline");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::InMemoryReporter;

    struct DropAll;

    impl MetricsStage for DropAll {
        fn name(&self) -> &'static str {
            "dropall"
        }

        fn consume_metrics(&self, _ctx: &BatchContext, _batch: MetricBatch) -> Result<MetricBatch> {
            Ok(MetricBatch::new())
        }
    }

    struct Panicky;

    impl MetricsStage for Panicky {
        fn name(&self) -> &'static str {
            "panicky"
        }

        fn consume_metrics(&self, _ctx: &BatchContext, _batch: MetricBatch) -> Result<MetricBatch> {
            panic!("must not be reached after an empty batch");
        }
    }

    fn one_point_batch() -> MetricBatch {
        use crate::metrics::{Metric, NumberDataPoint, NumberValue, ResourceMetrics, ScopeMetrics};
        MetricBatch {
            resources: vec![ResourceMetrics {
                attributes: [("host.name", "h1")].into_iter().collect(),
                scopes: vec![ScopeMetrics {
                    scope_name: "test".to_string(),
                    scope_version: String::new(),
                    metrics: vec![Metric::gauge(
                        "cpu",
                        vec![NumberDataPoint::new(
                            NumberValue::Double(0.5),
                            [("process.pid", "1")].into_iter().collect(),
                        )],
                    )],
                }],
            }],
        }
    }

    #[test]
    fn test_empty_batch_short_circuits() {
        let pipeline = Pipeline::from_stages(vec![Box::new(DropAll), Box::new(Panicky)]);
        let out = pipeline.consume(&BatchContext::new(), one_point_batch()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_cancellation_aborts_at_boundary() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = BatchContext::with_cancellation(cancel);
        let pipeline = Pipeline::from_stages(vec![Box::new(DropAll)]);
        let err = pipeline.consume(&ctx, one_point_batch()).unwrap_err();
        assert!(matches!(err, SiftError::Cancelled));
    }

    #[test]
    fn test_from_config_requires_valid_config() {
        let config = PipelineConfig::default();
        // Default tagger has no active rule.
        assert!(Pipeline::from_config(&config, Arc::new(InMemoryReporter::new())).is_err());
    }

    #[test]
    fn test_canonical_pipeline_runs() {
        let mut config = PipelineConfig::default();
        config.tagger.critical_executables.push("systemd".to_string());
        let pipeline = Pipeline::from_config(&config, Arc::new(InMemoryReporter::new())).unwrap();
        pipeline.start().unwrap();
        let out = pipeline.consume(&BatchContext::new(), one_point_batch()).unwrap();
        // One non-critical process under K=10 survives top-K and sampling.
        assert!(!out.is_empty());
        pipeline.shutdown().unwrap();
    }
}
