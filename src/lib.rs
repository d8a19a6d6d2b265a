//! Procsift - streaming process-metrics optimization pipeline.
//!
//! Procsift reduces high-cardinality per-process telemetry to a bounded,
//! information-preserving subset. A metric batch flows through four
//! composable stages, each of which consumes a batch and hands the mutated
//! result to the next:
//!
//! - **PriorityTagger**: stamps a critical marker on datapoints matching
//!   executable/CPU/memory rules. Critical datapoints survive every
//!   downstream stage verbatim.
//! - **AdaptiveTopK**: keeps critical processes plus the top K non-critical
//!   processes by a ranking metric. K may follow host load, with hysteresis
//!   so processes do not flap in and out of the selection.
//! - **ReservoirSampler**: uniform Algorithm-R sample over the long tail of
//!   process identities, stamping survivors with their sample rate.
//! - **OthersRollup**: folds whatever the selectors discarded into one
//!   aggregate `_other_` series per resource and metric.
//!
//! Orthogonally, the `trace` module provides a span reservoir with
//! trace-completion buffering and crash-safe checkpoints.
//!
//! # Architecture
//!
//! - `core`: error type, identifier newtypes, span model, configuration
//! - `metrics`: the metric batch tree and shared datapoint helpers
//! - `pipeline`: the four batch stages and their composition
//! - `trace`: span reservoir, trace buffer, time window, checkpoint store
//! - `monitoring`: the pluggable metrics-reporting surface
//!
//! # Example
//!
//! ```no_run
//! use procsift::core::PipelineConfig;
//! use procsift::monitoring::InMemoryReporter;
//! use procsift::pipeline::Pipeline;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = PipelineConfig::default();
//!     config.tagger.critical_executables.push("systemd".to_string());
//!     let reporter = Arc::new(InMemoryReporter::new());
//!     let pipeline = Pipeline::from_config(&config, reporter)?;
//!     # let _ = pipeline;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod core;
pub mod metrics;
pub mod monitoring;
pub mod pipeline;
pub mod trace;

pub use crate::core::{Result, SiftError};
pub use crate::metrics::MetricBatch;
pub use crate::pipeline::Pipeline;
