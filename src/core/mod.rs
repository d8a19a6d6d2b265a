//! Core domain types: errors, identifiers, spans, and configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AdaptiveTopKConfig, AggregationKind, LoadBand, OthersRollupConfig, PipelineConfig,
    PriorityTaggerConfig, ReservoirSamplerConfig, TraceReservoirConfig, PROCESS_CPU_UTILIZATION_KEY,
    PROCESS_EXECUTABLE_NAME_KEY, PROCESS_MEMORY_RSS_KEY, PROCESS_PID_KEY,
};
pub use error::{Result, SiftError};
pub use types::{Span, SpanBuilder, SpanEvent, SpanId, SpanLink, SpanStatus, TraceId};
