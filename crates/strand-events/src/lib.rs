//! # strand-events
//!
//! Trace/event repository for the strand background-job platform.
//!
//! This crate ingests high-volume span records, persists them durably,
//! deduplicates partial vs completed rows, reconstructs hierarchical traces
//! on query, derives cancellation-aware span state from ancestry, and fans
//! out live updates to subscribers.
//!
//! ## Core Concepts
//!
//! - **Span**: A time-bounded interval of work, identified by
//!   `(trace_id, span_id)`; may be partial (open) or completed
//! - **Trace**: The tree of spans sharing a trace ID, rooted at the span
//!   with no parent
//! - **Partial row**: A span row representing an open span; superseded by a
//!   later completion row at query time
//!
//! ## Guarantees
//!
//! - **Append-only**: Completion of a partial span is a new row, never an
//!   in-place update
//! - **Convergent**: Query-time dedup makes trace views independent of
//!   write order (completed supersedes partial irrespective of arrival)
//! - **Ordered batches**: Items within a flushed batch preserve insertion
//!   order across callers
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strand_core::{EnvironmentId, EventsConfig};
//! use strand_events::broker::InMemoryBroker;
//! use strand_events::repository::{EventOptions, EventRepository};
//! use strand_events::store::InMemorySpanStore;
//!
//! # async fn example() -> strand_events::error::Result<()> {
//! let repository = EventRepository::new(
//!     Arc::new(InMemorySpanStore::new()),
//!     Arc::new(InMemoryBroker::new()),
//!     EventsConfig::default(),
//! );
//!
//! let options = EventOptions::new(EnvironmentId::generate()).with_run_id("run_1");
//! repository.record_event("task checkpoint", options)?;
//!
//! repository.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod error;
pub mod flush;
pub mod metrics;
pub mod repository;
pub mod span;
pub mod store;
pub mod trace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::broker::{InMemoryBroker, MessageBroker, Subscription};
    pub use crate::error::{Error, Result};
    pub use crate::flush::{DynamicFlushScheduler, FlushConfig};
    pub use crate::metrics::EventMetrics;
    pub use crate::repository::{
        CompleteEventOptions, EventBuilder, EventOptions, EventRepository, SpanDetail,
        TraceSubscription,
    };
    pub use crate::span::{SpanEvent, SpanLink, SpanRecord, SpanStatus, TraceContext};
    pub use crate::store::{InMemorySpanStore, SpanQuery, SpanStore};
    pub use crate::trace::{build_trace_summary, TraceSpan, TraceSummary};
}
