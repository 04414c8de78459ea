//! Pluggable storage for span rows.
//!
//! The [`SpanStore`] trait defines the persistence layer for the event
//! repository. Rows are append-only; the store never updates in place.
//!
//! ## Design Principles
//!
//! - **Append-only**: Completion/cancellation write new rows; dedup happens
//!   at query time
//! - **Filtered reads**: Queries carry a [`SpanQuery`] so backends can use
//!   their trace/span indexes
//! - **Testability**: In-memory implementation for tests, a relational
//!   backend for production

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strand_core::{EnvironmentId, SpanId, TraceId};

use crate::error::Result;
use crate::span::SpanRecord;

pub use memory::InMemorySpanStore;

/// A filtered span read.
///
/// All set fields must match (logical AND). An empty query matches every row.
#[derive(Debug, Clone, Default)]
pub struct SpanQuery {
    /// Restrict to one trace.
    pub trace_id: Option<TraceId>,
    /// Restrict to one logical span.
    pub span_id: Option<SpanId>,
    /// Restrict to one task run.
    pub run_id: Option<String>,
    /// Restrict to one environment.
    pub environment_id: Option<EnvironmentId>,
}

impl SpanQuery {
    /// Creates an empty query matching all rows.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the query to one trace.
    #[must_use]
    pub fn for_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Restricts the query to one logical span.
    #[must_use]
    pub fn for_span(mut self, span_id: SpanId) -> Self {
        self.span_id = Some(span_id);
        self
    }

    /// Restricts the query to one task run.
    #[must_use]
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Restricts the query to one environment.
    #[must_use]
    pub fn for_environment(mut self, environment_id: EnvironmentId) -> Self {
        self.environment_id = Some(environment_id);
        self
    }

    /// Returns true if the record satisfies every set filter.
    #[must_use]
    pub fn matches(&self, record: &SpanRecord) -> bool {
        if let Some(trace_id) = &self.trace_id {
            if record.trace_id != *trace_id {
                return false;
            }
        }
        if let Some(span_id) = &self.span_id {
            if record.span_id != *span_id {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            if record.run_id != *run_id {
                return false;
            }
        }
        if let Some(environment_id) = &self.environment_id {
            if record.environment_id != *environment_id {
                return false;
            }
        }
        true
    }
}

/// Storage abstraction for span rows.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; the retention sweep may run concurrently
/// with writes.
#[async_trait]
pub trait SpanStore: Send + Sync {
    /// Persists a batch of rows in order.
    async fn insert_batch(&self, rows: Vec<SpanRecord>) -> Result<()>;

    /// Returns matching rows ordered by `start_time` ascending (ties keep
    /// insertion order).
    async fn query(&self, query: &SpanQuery) -> Result<Vec<SpanRecord>>;

    /// Deletes rows created before the cutoff; returns the number removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
