use crate::core::error::{Result, SiftError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a trace (16 bytes, hex encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(String);

/// Unique identifier for a span within a trace (8 bytes, hex encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(String);

impl TraceId {
    /// Creates a new TraceId after validation.
    pub fn new(id: String) -> Result<Self> {
        if id.is_empty() {
            return Err(SiftError::InvalidSpan("TraceId cannot be empty".to_string()));
        }
        // Trace IDs are 16 bytes = 32 hex characters
        if id.len() > 32 {
            return Err(SiftError::InvalidSpan(format!(
                "TraceId cannot exceed 32 characters, got {}",
                id.len()
            )));
        }
        Ok(TraceId(id))
    }

    /// Returns the string representation of the trace ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SpanId {
    /// Creates a new SpanId after validation.
    pub fn new(id: String) -> Result<Self> {
        if id.is_empty() {
            return Err(SiftError::InvalidSpan("SpanId cannot be empty".to_string()));
        }
        // Span IDs are 8 bytes = 16 hex characters
        if id.len() > 16 {
            return Err(SiftError::InvalidSpan(format!(
                "SpanId cannot exceed 16 characters, got {}",
                id.len()
            )));
        }
        Ok(SpanId(id))
    }

    /// Returns the string representation of the span ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a span execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SpanStatus {
    /// Span completed successfully.
    Ok,
    /// Span completed with an error.
    Error(String),
    /// Span status is unknown.
    Unset,
}

impl SpanStatus {
    /// Returns true if the span status indicates an error.
    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error(_))
    }
}

/// A timestamped event attached to a span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanEvent {
    /// Event name.
    pub name: String,
    /// Event time, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Event attributes.
    pub attributes: HashMap<String, String>,
}

/// A link from one span to another trace/span pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanLink {
    /// Linked trace ID.
    pub trace_id: TraceId,
    /// Linked span ID.
    pub span_id: SpanId,
    /// Link attributes.
    pub attributes: HashMap<String, String>,
}

/// A single span in a distributed trace.
///
/// The whole struct round-trips through serde so reservoir snapshots can be
/// checkpointed and restored without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    /// Trace this span belongs to.
    pub trace_id: TraceId,
    /// Unique identifier for this span.
    pub span_id: SpanId,
    /// Parent span ID if this is a child span.
    pub parent_span_id: Option<SpanId>,
    /// Operation name.
    pub name: String,
    /// Start time, nanoseconds since the Unix epoch.
    pub start_ns: u64,
    /// End time, nanoseconds since the Unix epoch.
    pub end_ns: u64,
    /// Span attributes.
    pub attributes: HashMap<String, String>,
    /// Timestamped events.
    pub events: Vec<SpanEvent>,
    /// Links to other spans.
    pub links: Vec<SpanLink>,
    /// Execution status.
    pub status: SpanStatus,
    /// Resource attributes of the emitting entity.
    pub resource_attributes: HashMap<String, String>,
    /// Instrumentation scope name.
    pub scope_name: String,
}

impl Span {
    /// Creates a new span builder.
    pub fn builder() -> SpanBuilder {
        SpanBuilder::default()
    }

    /// Stable string key for this span: `trace_id:span_id`.
    ///
    /// Used as the identity in reservoir snapshots and checkpoints.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.trace_id, self.span_id)
    }

    /// Span duration in nanoseconds (0 if end precedes start).
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Builder for creating Span instances.
#[derive(Default)]
pub struct SpanBuilder {
    trace_id: Option<TraceId>,
    span_id: Option<SpanId>,
    parent_span_id: Option<SpanId>,
    name: Option<String>,
    start_ns: u64,
    end_ns: u64,
    attributes: HashMap<String, String>,
    events: Vec<SpanEvent>,
    links: Vec<SpanLink>,
    status: Option<SpanStatus>,
    resource_attributes: HashMap<String, String>,
    scope_name: Option<String>,
}

impl SpanBuilder {
    /// Sets the trace ID.
    pub fn trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Sets the span ID.
    pub fn span_id(mut self, span_id: SpanId) -> Self {
        self.span_id = Some(span_id);
        self
    }

    /// Sets the parent span ID.
    pub fn parent_span_id(mut self, parent: SpanId) -> Self {
        self.parent_span_id = Some(parent);
        self
    }

    /// Sets the operation name.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the start timestamp in nanoseconds.
    pub fn start_ns(mut self, ns: u64) -> Self {
        self.start_ns = ns;
        self
    }

    /// Sets the end timestamp in nanoseconds.
    pub fn end_ns(mut self, ns: u64) -> Self {
        self.end_ns = ns;
        self
    }

    /// Adds a span attribute.
    pub fn attribute<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds a span event.
    pub fn event(mut self, event: SpanEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Adds a span link.
    pub fn link(mut self, link: SpanLink) -> Self {
        self.links.push(link);
        self
    }

    /// Sets the span status.
    pub fn status(mut self, status: SpanStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds a resource attribute.
    pub fn resource_attribute<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    /// Sets the instrumentation scope name.
    pub fn scope_name<S: Into<String>>(mut self, name: S) -> Self {
        self.scope_name = Some(name.into());
        self
    }

    /// Builds the span, validating required fields.
    pub fn build(self) -> Result<Span> {
        Ok(Span {
            trace_id: self
                .trace_id
                .ok_or_else(|| SiftError::InvalidSpan("trace_id is required".to_string()))?,
            span_id: self
                .span_id
                .ok_or_else(|| SiftError::InvalidSpan("span_id is required".to_string()))?,
            parent_span_id: self.parent_span_id,
            name: self
                .name
                .ok_or_else(|| SiftError::InvalidSpan("name is required".to_string()))?,
            start_ns: self.start_ns,
            end_ns: self.end_ns,
            attributes: self.attributes,
            events: self.events,
            links: self.links,
            status: self.status.unwrap_or(SpanStatus::Unset),
            resource_attributes: self.resource_attributes,
            scope_name: self.scope_name.unwrap_or_default(),
        })
    }
}
