//! Span row model.
//!
//! A span is a time-bounded interval of work identified by
//! `(trace_id, span_id)`. Rows are append-only: completing an open span
//! writes a *new* row with the same logical key, never an in-place update.
//! Query paths deduplicate, preferring a row that is completed or cancelled
//! over a partial one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_core::{traceparent, EnvironmentId, SpanId, SpanRecordId, TraceId};

/// Name of the in-span event appended when a span is cancelled.
pub const CANCELLATION_EVENT: &str = "cancellation";

/// Name of the in-span event appended when a span crashes.
pub const EXCEPTION_EVENT: &str = "exception";

/// Property keys starting with this prefix are internal and hidden from
/// hydrated span views.
pub const PRIVATE_PROPERTY_PREFIX: &str = "$";

/// Attribute carrying the project directory, used to rewrite absolute paths
/// out of stored stack traces.
pub const PROJECT_DIR_ATTRIBUTE: &str = "$project.dir";

/// Property key under which exception stack traces are recorded.
pub const EXCEPTION_STACKTRACE_PROPERTY: &str = "exception.stacktrace";

/// Returns the current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_nanos() -> i64 {
    datetime_nanos(Utc::now())
}

/// Converts a timestamp to nanoseconds since the Unix epoch, saturating at
/// the representable range.
#[must_use]
pub fn datetime_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Completion status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanStatus {
    /// The span completed without error.
    #[default]
    Ok,
    /// The span completed with an error.
    Error,
}

/// An ordered in-span event (point-in-time annotation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEvent {
    /// Event name (e.g. `cancellation`, `exception`).
    pub name: String,
    /// When the event occurred.
    pub time: DateTime<Utc>,
    /// Event properties.
    #[serde(default)]
    pub properties: Value,
}

impl SpanEvent {
    /// Creates a new span event.
    #[must_use]
    pub fn new(name: impl Into<String>, time: DateTime<Utc>, properties: Value) -> Self {
        Self {
            name: name.into(),
            time,
            properties,
        }
    }
}

/// An out-of-tree reference to a span in another (or the same) trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanLink {
    /// Linked trace.
    pub trace_id: TraceId,
    /// Linked span.
    pub span_id: SpanId,
    /// Link properties.
    #[serde(default)]
    pub properties: Value,
}

/// A persisted span row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanRecord {
    /// Surrogate row identifier.
    pub id: SpanRecordId,
    /// Owning environment.
    pub environment_id: EnvironmentId,
    /// The task run that produced this span (opaque to the repository).
    pub run_id: String,
    /// Trace this span belongs to.
    pub trace_id: TraceId,
    /// Logical span identifier; duplicated across partial/completion rows.
    pub span_id: SpanId,
    /// Parent span within the same trace, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    /// Human-readable span message.
    pub message: String,
    /// True while the span is open; a completion row clears this.
    pub is_partial: bool,
    /// True if the span was cancelled.
    pub is_cancelled: bool,
    /// True if the span errored.
    pub is_error: bool,
    /// Completion status.
    pub status: SpanStatus,
    /// Start time in nanoseconds since the Unix epoch.
    pub start_time: i64,
    /// Duration in nanoseconds; 0 while partial.
    pub duration: u64,
    /// User-facing properties (flattened attribute keys).
    pub properties: Value,
    /// Internal metadata.
    pub metadata: Value,
    /// Display styling hints.
    pub style: Value,
    /// Input payload.
    pub payload: Value,
    /// Payload content type.
    pub payload_type: String,
    /// Output value, if the span produced one.
    pub output: Value,
    /// Output content type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    /// Ordered in-span events.
    pub events: Vec<SpanEvent>,
    /// Out-of-tree span references.
    pub links: Vec<SpanLink>,
    /// Row creation time (drives retention).
    pub created_at: DateTime<Utc>,
}

impl SpanRecord {
    /// Creates a minimal span row; callers fill content through the
    /// builder-style `with_*` methods.
    #[must_use]
    pub fn new(
        environment_id: EnvironmentId,
        run_id: impl Into<String>,
        trace_id: TraceId,
        span_id: SpanId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: SpanRecordId::generate(),
            environment_id,
            run_id: run_id.into(),
            trace_id,
            span_id,
            parent_id: None,
            message: message.into(),
            is_partial: false,
            is_cancelled: false,
            is_error: false,
            status: SpanStatus::Ok,
            start_time: now_nanos(),
            duration: 0,
            properties: Value::Null,
            metadata: Value::Null,
            style: Value::Null,
            payload: Value::Null,
            payload_type: "application/json".to_string(),
            output: Value::Null,
            output_type: None,
            events: Vec::new(),
            links: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the parent span.
    #[must_use]
    pub fn with_parent(mut self, parent_id: SpanId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Marks the row as partial (open span).
    #[must_use]
    pub fn with_partial(mut self, is_partial: bool) -> Self {
        self.is_partial = is_partial;
        self
    }

    /// Sets the start time in nanoseconds.
    #[must_use]
    pub fn with_start_time(mut self, start_time: i64) -> Self {
        self.start_time = start_time;
        self
    }

    /// Sets the duration in nanoseconds.
    #[must_use]
    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the user-facing properties.
    #[must_use]
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    /// True if this row supersedes a partial row with the same span ID at
    /// query time.
    #[must_use]
    pub fn supersedes_partial(&self) -> bool {
        !self.is_partial || self.is_cancelled
    }

    /// Returns the end time in nanoseconds (start + duration).
    #[must_use]
    pub fn end_time(&self) -> i64 {
        self.start_time.saturating_add(i64::try_from(self.duration).unwrap_or(i64::MAX))
    }

    /// Finds the first in-span event with the given name.
    #[must_use]
    pub fn find_event(&self, name: &str) -> Option<&SpanEvent> {
        self.events.iter().find(|e| e.name == name)
    }
}

/// Propagated trace context: the current trace and the span under which new
/// child spans nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    /// Current trace.
    pub trace_id: TraceId,
    /// Current span (parent for children).
    pub span_id: SpanId,
}

impl TraceContext {
    /// Creates a new trace context.
    #[must_use]
    pub const fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }

    /// Formats this context as a W3C `traceparent` header value.
    #[must_use]
    pub fn traceparent(&self) -> String {
        traceparent(&self.trace_id, &self.span_id)
    }
}

/// Mutable builder handed to [`trace_event`](crate::repository::EventRepository::trace_event)
/// closures for attaching content to the span under construction.
#[derive(Debug, Default)]
pub struct SpanBuilder {
    pub(crate) properties: Option<Value>,
    pub(crate) metadata: Option<Value>,
    pub(crate) style: Option<Value>,
    pub(crate) payload: Option<Value>,
    pub(crate) payload_type: Option<String>,
    pub(crate) output: Option<Value>,
    pub(crate) output_type: Option<String>,
    pub(crate) events: Vec<SpanEvent>,
    pub(crate) links: Vec<SpanLink>,
    pub(crate) is_error: bool,
}

impl SpanBuilder {
    /// Sets span properties.
    pub fn set_properties(&mut self, properties: Value) -> &mut Self {
        self.properties = Some(properties);
        self
    }

    /// Sets span metadata.
    pub fn set_metadata(&mut self, metadata: Value) -> &mut Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets display styling.
    pub fn set_style(&mut self, style: Value) -> &mut Self {
        self.style = Some(style);
        self
    }

    /// Sets the input payload and its content type.
    pub fn set_payload(&mut self, payload: Value, payload_type: impl Into<String>) -> &mut Self {
        self.payload = Some(payload);
        self.payload_type = Some(payload_type.into());
        self
    }

    /// Sets the output value and its content type.
    pub fn set_output(&mut self, output: Value, output_type: impl Into<String>) -> &mut Self {
        self.output = Some(output);
        self.output_type = Some(output_type.into());
        self
    }

    /// Appends an in-span event.
    pub fn add_event(&mut self, event: SpanEvent) -> &mut Self {
        self.events.push(event);
        self
    }

    /// Appends a span link.
    pub fn add_link(&mut self, link: SpanLink) -> &mut Self {
        self.links.push(link);
        self
    }

    /// Flags the span as errored.
    pub fn set_error(&mut self) -> &mut Self {
        self.is_error = true;
        self
    }

    pub(crate) fn apply_to(self, record: &mut SpanRecord) {
        if let Some(properties) = self.properties {
            record.properties = properties;
        }
        if let Some(metadata) = self.metadata {
            record.metadata = metadata;
        }
        if let Some(style) = self.style {
            record.style = style;
        }
        if let Some(payload) = self.payload {
            record.payload = payload;
        }
        if let Some(payload_type) = self.payload_type {
            record.payload_type = payload_type;
        }
        if let Some(output) = self.output {
            record.output = output;
        }
        record.output_type = self.output_type.or(record.output_type.take());
        record.events.extend(self.events);
        record.links.extend(self.links);
        if self.is_error {
            record.is_error = true;
            record.status = SpanStatus::Error;
        }
    }
}
