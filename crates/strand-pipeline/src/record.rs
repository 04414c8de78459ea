//! Event-record and pipeline-run model.
//!
//! [`EventRecord`] rows are created by ingest and are immutable after
//! creation except for the delivery fields ingest may advance within the
//! update window. [`PipelineRun`] snapshots its step-ID list at creation;
//! the list never changes afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_core::{
    AccountId, DispatcherId, EnvironmentId, EventRecordId, PipelineRunId, PipelineStepId,
    ProjectId, QueueId,
};

/// The environment an inbound event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEnvironment {
    /// Environment identifier.
    pub id: EnvironmentId,
    /// Owning project.
    pub project_id: ProjectId,
}

/// A raw inbound event, as supplied by the external producer surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Client-supplied event identifier; unique per environment.
    pub id: String,
    /// Event name.
    pub name: String,
    /// Event payload.
    pub payload: Value,
    /// Event context.
    #[serde(default)]
    pub context: Value,
    /// Producer-side timestamp; defaults to receipt time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Producer source label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RawEvent {
    /// Creates a raw event with the given ID, name, and payload.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            payload,
            context: Value::Null,
            timestamp: None,
            source: None,
        }
    }
}

/// Options accepted by [`send`](crate::ingest::EventIngest::send).
#[derive(Debug, Clone, Default)]
pub struct SendEventOptions {
    /// Explicit delivery time.
    pub deliver_at: Option<DateTime<Utc>>,
    /// Delivery delay in seconds (used when `deliver_at` is absent).
    pub deliver_after: Option<u64>,
    /// Queue slug to route the event through, resolved against the
    /// environment's project.
    pub queue_slug: Option<String>,
    /// External account identifier to associate.
    pub account_id: Option<String>,
}

/// A persisted event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Surrogate row identifier.
    pub id: EventRecordId,
    /// Client-supplied event identifier; unique with `environment_id`.
    pub event_id: String,
    /// Owning environment.
    pub environment_id: EnvironmentId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Event name.
    pub name: String,
    /// Event payload.
    pub payload: Value,
    /// Payload content type.
    pub payload_type: String,
    /// Event context.
    pub context: Value,
    /// Source context attached by the receiving surface.
    pub source_context: Value,
    /// Producer source label.
    pub source: String,
    /// Producer-side timestamp.
    pub timestamp: DateTime<Utc>,
    /// Queue the event routes through, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<QueueId>,
    /// Whether the queue pipeline should still process this event.
    pub should_process_queue_pipeline: bool,
    /// Whether the dispatcher pipeline should still process this event.
    pub should_process_dispatcher_pipeline: bool,
    /// When the event becomes deliverable.
    pub deliver_at: DateTime<Utc>,
    /// The pipeline run that produced this record, when it is a pipeline
    /// output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_output_run_id: Option<PipelineRunId>,
    /// Associated external account, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_id: Option<AccountId>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// An external account upserted by ingest, keyed by
/// `(environment_id, identifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAccount {
    /// Surrogate identifier.
    pub id: AccountId,
    /// Owning environment.
    pub environment_id: EnvironmentId,
    /// Client-supplied account identifier.
    pub identifier: String,
}

/// The kind of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    /// Declarative event filter; mismatch fails the run.
    Filter,
    /// Reserved; unsupported at execution time.
    Webhook,
}

impl StepType {
    /// Stable wire name of the step type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "FILTER",
            Self::Webhook => "WEBHOOK",
        }
    }
}

/// One declarative unit of a queue or dispatcher pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    /// Step identifier; runs snapshot these.
    pub id: PipelineStepId,
    /// Step key, unique within the owning queue/dispatcher.
    pub key: String,
    /// Step kind.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Step configuration (filter document, webhook settings, ...).
    pub config: Value,
}

impl PipelineStep {
    /// Creates a filter step.
    #[must_use]
    pub fn filter(key: impl Into<String>, config: Value) -> Self {
        Self {
            id: PipelineStepId::generate(),
            key: key.into(),
            step_type: StepType::Filter,
            config,
        }
    }

    /// Creates a webhook step (declared but unsupported at execution).
    #[must_use]
    pub fn webhook(key: impl Into<String>, config: Value) -> Self {
        Self {
            id: PipelineStepId::generate(),
            key: key.into(),
            step_type: StepType::Webhook,
            config,
        }
    }
}

/// A named, ordered list of pipeline steps scoped to a project, addressed by
/// `(project_id, slug)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    /// Queue identifier.
    pub id: QueueId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Addressable slug, unique within the project.
    pub slug: String,
    /// Ordered pipeline steps.
    pub steps: Vec<PipelineStep>,
}

impl Queue {
    /// Creates a queue with the given steps.
    #[must_use]
    pub fn new(project_id: ProjectId, slug: impl Into<String>, steps: Vec<PipelineStep>) -> Self {
        Self {
            id: QueueId::generate(),
            project_id,
            slug: slug.into(),
            steps,
        }
    }
}

/// A dispatcher-owned pipeline; differs from [`Queue`] only in how the final
/// output event is routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDispatcher {
    /// Dispatcher identifier.
    pub id: DispatcherId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Addressable slug, unique within the project.
    pub slug: String,
    /// Ordered pipeline steps.
    pub steps: Vec<PipelineStep>,
}

impl EventDispatcher {
    /// Creates a dispatcher with the given steps.
    #[must_use]
    pub fn new(project_id: ProjectId, slug: impl Into<String>, steps: Vec<PipelineStep>) -> Self {
        Self {
            id: DispatcherId::generate(),
            project_id,
            slug: slug.into(),
            steps,
        }
    }
}

/// The owner kind of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineType {
    /// Run owned by a queue; output routes to delivery.
    Queue,
    /// Run owned by a dispatcher; output routes to dispatcher invocation.
    Dispatcher,
}

/// The state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineRunStatus {
    /// Created but no step executed yet.
    Pending,
    /// At least one step executed; more remain.
    Started,
    /// All steps succeeded and the output event was produced.
    Success,
    /// A step failed; the error field carries the reason.
    Failure,
}

impl PipelineRunStatus {
    /// Returns true if the run is in a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// Owner linkage carried on a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunMetadata {
    /// Owning queue, for `QUEUE` runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<QueueId>,
    /// Owning dispatcher, for `DISPATCHER` runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatcher_id: Option<DispatcherId>,
}

/// One execution instance of a step list against one input event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    /// Run identifier.
    pub id: PipelineRunId,
    /// Owner kind.
    #[serde(rename = "type")]
    pub run_type: PipelineType,
    /// Current state.
    pub status: PipelineRunStatus,
    /// Step-ID snapshot taken at creation; immutable afterwards.
    pub steps: Vec<PipelineStepId>,
    /// Cursor into `steps`; `None` iff the run is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step_index: Option<usize>,
    /// The input event record.
    pub input_event_id: EventRecordId,
    /// Current output document; starts as the input event's payload.
    pub output: Value,
    /// Owner linkage.
    pub metadata: PipelineRunMetadata,
    /// Failure reason, for `FAILURE` runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Creates a pending run with a step snapshot, positioned at the first
    /// step. The output starts as the input event's payload.
    #[must_use]
    pub fn new(
        run_type: PipelineType,
        steps: Vec<PipelineStepId>,
        input_event_id: EventRecordId,
        initial_output: Value,
        metadata: PipelineRunMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PipelineRunId::generate(),
            run_type,
            status: PipelineRunStatus::Pending,
            steps,
            next_step_index: Some(0),
            input_event_id,
            output: initial_output,
            metadata,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the run is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
