//! The pipeline run engine.
//!
//! The engine is reinvoked by the worker queue with a single run ID and
//! performs **one step per invocation**, then either schedules itself for
//! the next step or finalizes the run:
//!
//! ```text
//! PENDING --enqueue-> STARTED --+-- step ok, more  -> STARTED (cursor + 1)
//!                               +-- step ok, done  -> SUCCESS (terminal)
//!                               +-- step fails     -> FAILURE (terminal)
//! ```
//!
//! Each invocation commits through the store's compare-and-swap on the
//! run's cursor, so a step advances at most once no matter how many workers
//! pick up the same job. Step-level failures (filter mismatch, invalid
//! config, unsupported type) become a persistent `FAILURE` row with a
//! formatted error; they never escape `run_pipeline`. Infrastructure
//! failures (missing entities, storage errors) propagate so the worker
//! queue can retry the invocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use strand_core::{EventRecordId, PipelineRunId};

use crate::error::{Error, Result};
use crate::filter::EventFilter;
use crate::metrics::{labels, PipelineMetrics};
use crate::queue::{EnqueueOptions, JobEnvelope, WorkerQueue};
use crate::record::{EventRecord, PipelineRun, PipelineRunStatus, PipelineStep, PipelineType, StepType};
use crate::store::{PipelineStore, RunUpdate, StepCommit};

/// Upper bound on one step's storage transaction.
pub const STEP_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes pipeline runs one step at a time.
pub struct PipelineEngine {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn WorkerQueue>,
    metrics: PipelineMetrics,
}

impl PipelineEngine {
    /// Creates an engine over the given store and worker queue.
    #[must_use]
    pub fn new(store: Arc<dyn PipelineStore>, queue: Arc<dyn WorkerQueue>) -> Self {
        Self {
            store,
            queue,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Performs one step of the run: evaluates the current step, commits the
    /// resulting state transition, and enqueues the follow-up work.
    ///
    /// Invoking a terminal run is a no-op. Losing the cursor race to a
    /// concurrent worker is a no-op too (the winner scheduled the next
    /// step).
    ///
    /// # Errors
    ///
    /// Propagates infrastructure failures: unknown run, missing input event,
    /// storage errors, or the step transaction exceeding
    /// [`STEP_TRANSACTION_TIMEOUT`].
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn run_pipeline(&self, run_id: PipelineRunId) -> Result<()> {
        tokio::time::timeout(STEP_TRANSACTION_TIMEOUT, self.run_one_step(run_id))
            .await
            .map_err(|_| Error::storage("pipeline step transaction timed out"))?
    }

    async fn run_one_step(&self, run_id: PipelineRunId) -> Result<()> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Err(Error::RunNotFound { run_id });
        };

        if run.is_terminal() {
            tracing::debug!(status = ?run.status, "run already terminal, nothing to do");
            return Ok(());
        }
        let Some(index) = run.next_step_index else {
            tracing::debug!("run has no cursor, nothing to do");
            return Ok(());
        };

        let Some(step_id) = run.steps.get(index).copied() else {
            // Cursor past the end of the snapshot: all steps are done.
            return self.finalize(&run, index).await;
        };
        let Some(step) = self.store.get_step(step_id).await? else {
            return self
                .fail(&run, index, &format!("Pipeline step not found: {step_id}"))
                .await;
        };

        match Self::execute_step(&run, &step) {
            Ok(output) => {
                self.metrics.record_step(step.step_type.as_str(), labels::RESULT_OK);
                if run.steps.get(index + 1).is_some() {
                    self.advance(&run, index, output).await
                } else {
                    self.finalize(&run, index).await
                }
            }
            Err(error) => {
                self.metrics
                    .record_step(step.step_type.as_str(), labels::RESULT_FAILED);
                self.fail(&run, index, &error.to_string()).await
            }
        }
    }

    /// Evaluates one step against the run's current output.
    fn execute_step(run: &PipelineRun, step: &PipelineStep) -> Result<Value> {
        match step.step_type {
            StepType::Filter => {
                let filter = EventFilter::from_value(&step.config)?;
                if filter.matches(&run.output) {
                    Ok(run.output.clone())
                } else {
                    Err(Error::FilterMismatch)
                }
            }
            StepType::Webhook => Err(Error::UnsupportedStep {
                step_type: StepType::Webhook.as_str().to_string(),
            }),
        }
    }

    async fn advance(&self, run: &PipelineRun, index: usize, output: Value) -> Result<()> {
        let next_index = index + 1;
        let result = self
            .store
            .commit_step(StepCommit {
                run_id: run.id,
                expected_step_index: index,
                update: RunUpdate {
                    status: PipelineRunStatus::Started,
                    next_step_index: Some(next_index),
                    output: Some(output),
                    error: None,
                },
                output_event: None,
            })
            .await?;

        // On a cursor race the winner committed the same transition and its
        // follow-up enqueue (keyed per step) deduplicates against ours, so
        // enqueue unconditionally. This also heals a crash between a prior
        // commit and its enqueue.
        if !result.is_success() {
            tracing::debug!(index, "lost step-advance race, re-enqueueing follow-up");
        }
        self.enqueue_run_step(run.id, next_index).await?;
        Ok(())
    }

    async fn finalize(&self, run: &PipelineRun, index: usize) -> Result<()> {
        let Some(input) = self.store.get_event(run.input_event_id).await? else {
            return Err(Error::missing_entity("event record", run.input_event_id));
        };

        let output_event = output_event_from(&input, run);
        let output_event_id = output_event.id;
        let deliver_at = output_event.deliver_at;

        let result = self
            .store
            .commit_step(StepCommit {
                run_id: run.id,
                expected_step_index: index,
                update: RunUpdate {
                    status: PipelineRunStatus::Success,
                    next_step_index: None,
                    output: None,
                    error: None,
                },
                output_event: Some(output_event),
            })
            .await?;
        if !result.is_success() {
            tracing::debug!(index, "lost finalize race, nothing to do");
            return Ok(());
        }

        match run.run_type {
            PipelineType::Queue => {
                let job = JobEnvelope::deliver_event(output_event_id);
                self.metrics.record_job_enqueued(&job.name);
                self.queue
                    .enqueue(
                        job,
                        EnqueueOptions::new()
                            .with_run_at(deliver_at)
                            .with_job_key(format!("event:{output_event_id}")),
                    )
                    .await?;
            }
            PipelineType::Dispatcher => {
                let Some(dispatcher_id) = run.metadata.dispatcher_id else {
                    return Err(Error::missing_entity("dispatcher", run.id));
                };
                let job = JobEnvelope::invoke_dispatcher(dispatcher_id, output_event_id);
                self.metrics.record_job_enqueued(&job.name);
                self.queue.enqueue(job, EnqueueOptions::new()).await?;
            }
        }

        self.metrics.record_run_finalized("SUCCESS");
        tracing::info!(output_event = %output_event_id, "pipeline run succeeded");
        Ok(())
    }

    async fn fail(&self, run: &PipelineRun, index: usize, error: &str) -> Result<()> {
        let result = self
            .store
            .commit_step(StepCommit {
                run_id: run.id,
                expected_step_index: index,
                update: RunUpdate {
                    status: PipelineRunStatus::Failure,
                    next_step_index: None,
                    output: None,
                    error: Some(error.to_string()),
                },
                output_event: None,
            })
            .await?;

        if result.is_success() {
            self.metrics.record_run_finalized("FAILURE");
            tracing::warn!(index, error, "pipeline run failed");
        }
        Ok(())
    }

    async fn enqueue_run_step(&self, run_id: PipelineRunId, step_index: usize) -> Result<()> {
        let job = JobEnvelope::run_pipeline(run_id);
        self.metrics.record_job_enqueued(&job.name);
        self.queue
            .enqueue(
                job,
                EnqueueOptions::new().with_job_key(format!("run:{run_id}:step:{step_index}")),
            )
            .await?;
        Ok(())
    }
}

/// Derives the pipeline output record from the input event.
///
/// The output carries the run's final document as its payload, marks itself
/// as already pipeline-processed, and links back to the producing run via
/// `pipeline_output_run_id`.
fn output_event_from(input: &EventRecord, run: &PipelineRun) -> EventRecord {
    let now = Utc::now();
    EventRecord {
        id: EventRecordId::generate(),
        event_id: format!("{}:pipeline:{}", input.event_id, run.id),
        environment_id: input.environment_id,
        project_id: input.project_id,
        name: input.name.clone(),
        payload: run.output.clone(),
        payload_type: input.payload_type.clone(),
        context: input.context.clone(),
        source_context: input.source_context.clone(),
        source: input.source.clone(),
        timestamp: now,
        queue_id: input.queue_id,
        should_process_queue_pipeline: false,
        should_process_dispatcher_pipeline: match run.run_type {
            PipelineType::Dispatcher => false,
            PipelineType::Queue => input.should_process_dispatcher_pipeline,
        },
        deliver_at: input.deliver_at,
        pipeline_output_run_id: Some(run.id),
        external_account_id: input.external_account_id,
        created_at: now,
    }
}
