//! Observability metrics for ingest and pipeline execution.
//!
//! Exported via the `metrics` crate facade.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `strand_pipeline_steps_total` | Counter | `step_type`, `result` | Step executions by outcome |
//! | `strand_pipeline_runs_finalized_total` | Counter | `status` | Runs reaching a terminal state |
//! | `strand_pipeline_jobs_enqueued_total` | Counter | `job` | Worker jobs enqueued |
//! | `strand_pipeline_events_ingested_total` | Counter | `outcome` | Inbound events by upsert outcome |

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: step executions by type and outcome.
    pub const STEPS_TOTAL: &str = "strand_pipeline_steps_total";
    /// Counter: runs reaching a terminal state.
    pub const RUNS_FINALIZED_TOTAL: &str = "strand_pipeline_runs_finalized_total";
    /// Counter: worker jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "strand_pipeline_jobs_enqueued_total";
    /// Counter: inbound events by upsert outcome.
    pub const EVENTS_INGESTED_TOTAL: &str = "strand_pipeline_events_ingested_total";
}

/// Label keys and well-known values used across metrics.
pub mod labels {
    /// Step type (FILTER, WEBHOOK).
    pub const STEP_TYPE: &str = "step_type";
    /// Step or run outcome.
    pub const RESULT: &str = "result";
    /// Step succeeded.
    pub const RESULT_OK: &str = "ok";
    /// Step failed.
    pub const RESULT_FAILED: &str = "failed";
    /// Terminal run status.
    pub const STATUS: &str = "status";
    /// Job name.
    pub const JOB: &str = "job";
    /// Ingest outcome.
    pub const OUTCOME: &str = "outcome";
    /// A new event row was created.
    pub const OUTCOME_CREATED: &str = "created";
    /// An existing row was updated within the window.
    pub const OUTCOME_UPDATED: &str = "updated";
    /// The existing row was final; returned unchanged.
    pub const OUTCOME_UNCHANGED: &str = "unchanged";
}

/// High-level interface for recording pipeline metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a step execution outcome.
    pub fn record_step(&self, step_type: &'static str, result: &'static str) {
        counter!(
            names::STEPS_TOTAL,
            labels::STEP_TYPE => step_type,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a run reaching a terminal state.
    pub fn record_run_finalized(&self, status: &'static str) {
        counter!(
            names::RUNS_FINALIZED_TOTAL,
            labels::STATUS => status,
        )
        .increment(1);
    }

    /// Records a worker job enqueued.
    pub fn record_job_enqueued(&self, job: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            labels::JOB => job.to_string(),
        )
        .increment(1);
    }

    /// Records an ingest upsert outcome.
    pub fn record_event_ingested(&self, outcome: &'static str) {
        counter!(
            names::EVENTS_INGESTED_TOTAL,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }
}
