//! Worker-queue abstraction for background jobs.
//!
//! This module provides:
//!
//! - [`WorkerQueue`]: Trait for enqueueing jobs to execution backends
//! - [`JobEnvelope`]: Serializable job payload with well-known constructors
//! - [`InMemoryWorkerQueue`]: In-memory queue for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: Same interface for durable queues and local
//!   workers
//! - **Idempotent dispatch**: Job keys enable deduplication of identical
//!   jobs
//! - **Structured payloads**: JSON-serializable job envelopes
//!
//! Delivery is at-least-once: the platform relies on job keys and
//! idempotent handlers rather than exactly-once queue semantics.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use strand_core::{DispatcherId, EventRecordId, PipelineRunId, QueueId};

use crate::error::Result;
use crate::record::PipelineType;

use async_trait::async_trait;

pub use memory::InMemoryWorkerQueue;

/// Well-known job names.
pub mod job_names {
    /// Creates a pipeline run for an event and enqueues its first step.
    pub const CREATE_PIPELINE: &str = "createPipeline";
    /// Executes one pipeline step; self-reenqueues until terminal.
    pub const RUN_PIPELINE: &str = "runPipeline";
    /// Delivers an event record to its consumers (delivery subsystem).
    pub const DELIVER_EVENT: &str = "deliverEvent";
    /// Invokes a dispatcher with a pipeline output (dispatcher subsystem).
    pub const INVOKE_DISPATCHER: &str = "events.invokeDispatcher";
}

/// Envelope for a job to be dispatched to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    /// Job name; selects the worker handler.
    pub name: String,
    /// Job payload.
    pub payload: Value,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    /// Creates a job envelope.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }

    /// `createPipeline` job for a queue-owned pipeline.
    #[must_use]
    pub fn create_queue_pipeline(queue_id: QueueId, event_record_id: EventRecordId) -> Self {
        Self::new(
            job_names::CREATE_PIPELINE,
            json!({
                "type": PipelineType::Queue,
                "queueId": queue_id,
                "eventRecordId": event_record_id,
            }),
        )
    }

    /// `createPipeline` job for a dispatcher-owned pipeline.
    #[must_use]
    pub fn create_dispatcher_pipeline(
        dispatcher_id: DispatcherId,
        event_record_id: EventRecordId,
    ) -> Self {
        Self::new(
            job_names::CREATE_PIPELINE,
            json!({
                "type": PipelineType::Dispatcher,
                "dispatcherId": dispatcher_id,
                "eventRecordId": event_record_id,
            }),
        )
    }

    /// `runPipeline` job advancing one step of a run.
    #[must_use]
    pub fn run_pipeline(run_id: PipelineRunId) -> Self {
        Self::new(job_names::RUN_PIPELINE, json!({ "id": run_id }))
    }

    /// `deliverEvent` job for an event record.
    #[must_use]
    pub fn deliver_event(event_record_id: EventRecordId) -> Self {
        Self::new(job_names::DELIVER_EVENT, json!({ "id": event_record_id }))
    }

    /// `events.invokeDispatcher` job for a pipeline output.
    #[must_use]
    pub fn invoke_dispatcher(dispatcher_id: DispatcherId, event_record_id: EventRecordId) -> Self {
        Self::new(
            job_names::INVOKE_DISPATCHER,
            json!({
                "id": dispatcher_id,
                "eventRecordId": event_record_id,
            }),
        )
    }
}

/// Options for job enqueueing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Earliest execution time; absent means as soon as possible.
    pub run_at: Option<DateTime<Utc>>,
    /// Deduplication key: identical keys collapse to one job.
    pub job_key: Option<String>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the earliest execution time.
    #[must_use]
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Sets the deduplication key.
    #[must_use]
    pub fn with_job_key(mut self, job_key: impl Into<String>) -> Self {
        self.job_key = Some(job_key.into());
        self
    }
}

/// Result of enqueuing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Job was enqueued.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// Job was deduplicated against an identical pending job.
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
}

impl EnqueueResult {
    /// Returns true if the job was newly enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    /// Returns the message ID.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Enqueued { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => message_id,
        }
    }
}

/// Worker queue for dispatching jobs to execution backends.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from request
/// handlers and background workers.
#[async_trait]
pub trait WorkerQueue: Send + Sync {
    /// Enqueues a job.
    ///
    /// Jobs with a `job_key` matching a pending job are deduplicated.
    async fn enqueue(&self, job: JobEnvelope, options: EnqueueOptions) -> Result<EnqueueResult>;

    /// Returns the approximate number of pending jobs.
    async fn queue_depth(&self) -> Result<usize>;

    /// Returns the queue's name or identifier.
    fn queue_name(&self) -> &str;
}
