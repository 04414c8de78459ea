//! # strand-pipeline
//!
//! Event ingest and pipeline run engine for the strand background-job
//! platform.
//!
//! This crate drives persisted event records through an ordered chain of
//! filter/transform steps, producing downstream events and scheduling the
//! next work:
//!
//! - **Ingest** upserts inbound raw events, deduplicating by
//!   `(event_id, environment_id)` with a short update window
//! - **Pipeline runs** execute one step per worker invocation with
//!   at-most-once advancement per step (compare-and-swap on the cursor)
//! - **Filters** evaluate declarative match documents against the run's
//!   current output; a mismatch fails the run
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use strand_pipeline::engine::PipelineEngine;
//! use strand_pipeline::ingest::{EventIngest, IngestConfig, PipelineOwner};
//! use strand_pipeline::queue::InMemoryWorkerQueue;
//! use strand_pipeline::record::{PipelineStep, Queue, RawEvent, RuntimeEnvironment, SendEventOptions};
//! use strand_pipeline::store::{InMemoryPipelineStore, PipelineStore};
//!
//! # async fn example() -> strand_pipeline::error::Result<()> {
//! let store: Arc<InMemoryPipelineStore> = Arc::new(InMemoryPipelineStore::new());
//! let queue = Arc::new(InMemoryWorkerQueue::new("worker"));
//! let ingest = EventIngest::new(store.clone(), queue.clone(), IngestConfig::default());
//! let engine = PipelineEngine::new(store.clone(), queue.clone());
//!
//! let environment = RuntimeEnvironment {
//!     id: strand_core::EnvironmentId::generate(),
//!     project_id: strand_core::ProjectId::generate(),
//! };
//! let orders = store
//!     .create_queue(Queue::new(
//!         environment.project_id,
//!         "orders",
//!         vec![PipelineStep::filter("only-ok", json!({"foo": ["ok"]}))],
//!     ))
//!     .await?;
//!
//! let record = ingest
//!     .send(
//!         &environment,
//!         RawEvent::new("e1", "order.created", json!({"foo": "ok"})),
//!         SendEventOptions {
//!             queue_slug: Some("orders".into()),
//!             ..SendEventOptions::default()
//!         },
//!         None,
//!         None,
//!     )
//!     .await?;
//!
//! let run = ingest
//!     .create_pipeline(PipelineOwner::Queue(orders.id), record.id)
//!     .await?;
//! engine.run_pipeline(run.id).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod engine;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod metrics;
pub mod queue;
pub mod record;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::engine::PipelineEngine;
    pub use crate::error::{Error, Result};
    pub use crate::filter::EventFilter;
    pub use crate::ingest::{EventIngest, IngestConfig, PipelineOwner};
    pub use crate::metrics::PipelineMetrics;
    pub use crate::queue::{
        EnqueueOptions, EnqueueResult, InMemoryWorkerQueue, JobEnvelope, WorkerQueue,
    };
    pub use crate::record::{
        EventDispatcher, EventRecord, PipelineRun, PipelineRunStatus, PipelineStep, PipelineType,
        Queue, RawEvent, RuntimeEnvironment, SendEventOptions, StepType,
    };
    pub use crate::store::{CasResult, InMemoryPipelineStore, PipelineStore, StepCommit};
}
