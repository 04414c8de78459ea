//! Pluggable storage for event records, queues, dispatchers, and pipeline
//! runs.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Step advancement uses compare-and-swap on the run's
//!   cursor so a step commits at most once, no matter how many workers pick
//!   up the same job
//! - **Atomic step commits**: A [`StepCommit`] applies the run mutation and
//!   the output event together; a durable backend wraps the same commit in
//!   one transaction
//! - **Unique keys**: `(event_id, environment_id)` and `(project_id, slug)`
//!   are enforced with [`Error::DuplicateKey`](crate::error::Error::DuplicateKey)
//! - **Testability**: In-memory implementation for tests, a relational
//!   backend for production

pub mod memory;

use async_trait::async_trait;

use strand_core::{
    DispatcherId, EnvironmentId, EventRecordId, PipelineRunId, PipelineStepId, ProjectId, QueueId,
};

use crate::error::Result;
use crate::record::{
    EventDispatcher, EventRecord, ExternalAccount, PipelineRun, PipelineRunStatus, PipelineStep,
    Queue,
};

pub use memory::InMemoryPipelineStore;

/// Result of a compare-and-swap step commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The commit was applied.
    Success,
    /// The run does not exist.
    NotFound,
    /// The run's cursor did not match the expected step index (another
    /// worker advanced it, or the run is terminal).
    StepIndexMismatch {
        /// The cursor that was actually found.
        actual: Option<usize>,
    },
}

impl CasResult {
    /// Returns true if the commit was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The run mutation carried by a step commit.
#[derive(Debug, Clone)]
pub struct RunUpdate {
    /// New run status.
    pub status: PipelineRunStatus,
    /// New cursor; `None` for terminal states.
    pub next_step_index: Option<usize>,
    /// New output document, when the step transformed it.
    pub output: Option<serde_json::Value>,
    /// Failure reason, for `FAILURE` commits.
    pub error: Option<String>,
}

/// An atomic step commit: the run mutation plus the output event produced on
/// finalization, applied together.
#[derive(Debug, Clone)]
pub struct StepCommit {
    /// The run being advanced.
    pub run_id: PipelineRunId,
    /// The cursor value the caller observed; the commit applies only if the
    /// stored cursor still matches.
    pub expected_step_index: usize,
    /// The run mutation.
    pub update: RunUpdate,
    /// The output event record, on finalization.
    pub output_event: Option<EventRecord>,
}

/// Storage abstraction for the ingest and pipeline domain.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from request
/// handlers and background workers.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    // --- Event Records ---

    /// Creates an event record.
    ///
    /// Fails with `DuplicateKey` when `(event_id, environment_id)` already
    /// exists.
    async fn create_event(&self, record: EventRecord) -> Result<EventRecord>;

    /// Gets an event record by row ID.
    async fn get_event(&self, id: EventRecordId) -> Result<Option<EventRecord>>;

    /// Finds an event record by its `(event_id, environment_id)` key.
    async fn find_event_by_key(
        &self,
        event_id: &str,
        environment_id: EnvironmentId,
    ) -> Result<Option<EventRecord>>;

    /// Replaces an event record (matched by row ID).
    async fn update_event(&self, record: EventRecord) -> Result<EventRecord>;

    // --- Queues, Dispatchers, Steps ---

    /// Creates a queue and registers its steps.
    ///
    /// Fails with `DuplicateKey` when `(project_id, slug)` already exists.
    async fn create_queue(&self, queue: Queue) -> Result<Queue>;

    /// Gets a queue by ID.
    async fn get_queue(&self, id: QueueId) -> Result<Option<Queue>>;

    /// Finds a queue by its `(project_id, slug)` address.
    async fn find_queue_by_slug(
        &self,
        project_id: ProjectId,
        slug: &str,
    ) -> Result<Option<Queue>>;

    /// Creates a dispatcher and registers its steps.
    ///
    /// Fails with `DuplicateKey` when `(project_id, slug)` already exists.
    async fn create_dispatcher(&self, dispatcher: EventDispatcher) -> Result<EventDispatcher>;

    /// Gets a dispatcher by ID.
    async fn get_dispatcher(&self, id: DispatcherId) -> Result<Option<EventDispatcher>>;

    /// Gets a pipeline step by ID.
    async fn get_step(&self, id: PipelineStepId) -> Result<Option<PipelineStep>>;

    // --- External Accounts ---

    /// Gets or creates the external account keyed by
    /// `(environment_id, identifier)`.
    async fn upsert_external_account(
        &self,
        environment_id: EnvironmentId,
        identifier: &str,
    ) -> Result<ExternalAccount>;

    // --- Pipeline Runs ---

    /// Creates a pipeline run.
    async fn create_run(&self, run: PipelineRun) -> Result<PipelineRun>;

    /// Gets a pipeline run by ID.
    async fn get_run(&self, id: PipelineRunId) -> Result<Option<PipelineRun>>;

    /// Atomically applies a step commit if the run's cursor still matches
    /// `expected_step_index`.
    ///
    /// This is the core primitive for at-most-once step advancement:
    /// concurrent workers race on the cursor and exactly one commit wins.
    async fn commit_step(&self, commit: StepCommit) -> Result<CasResult>;
}
