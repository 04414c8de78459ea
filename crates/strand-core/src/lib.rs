//! # strand-core
//!
//! Core abstractions for the strand event platform.
//!
//! This crate provides the foundational types used across all strand
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for rows and W3C trace-context IDs
//! - **Error Types**: Shared error definitions and result types
//! - **JSON Helpers**: Attribute flattening for dynamically-typed payloads
//! - **Observability**: Structured-logging initialization and span helpers
//! - **Configuration**: Environment-driven settings for the event subsystem
//!
//! ## Example
//!
//! ```rust
//! use strand_core::prelude::*;
//!
//! let trace = TraceId::generate();
//! let span = SpanId::deterministic(&trace, "attempt-1");
//! assert_eq!(span, SpanId::deterministic(&trace, "attempt-1"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod json;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::EventsConfig;
    pub use crate::error::{Error, Result};
    pub use crate::id::{
        traceparent, AccountId, DispatcherId, EnvironmentId, EventRecordId, PipelineRunId,
        PipelineStepId, ProjectId, QueueId, SpanId, SpanRecordId, TraceId,
    };
    pub use crate::observability::{init_logging, LogFormat};
}

pub use config::EventsConfig;
pub use error::{Error, Result};
pub use id::{
    traceparent, AccountId, DispatcherId, EnvironmentId, EventRecordId, PipelineRunId,
    PipelineStepId, ProjectId, QueueId, SpanId, SpanRecordId, TraceId,
};
pub use observability::{init_logging, LogFormat};
