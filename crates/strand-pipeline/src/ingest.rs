//! Event ingest: upsert inbound raw events and route them onward.
//!
//! `send` deduplicates by `(event_id, environment_id)`. An existing row may
//! still be updated while inside the **update window**: its scheduled
//! delivery must be at least [`EVENT_UPDATE_WINDOW_SECONDS`] away. Past
//! that, the row is final and resends return it unchanged.
//!
//! Post-write routing: events addressed to a queue with pipeline steps get
//! a `createPipeline` job; everything else goes straight to delivery.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use strand_core::{DispatcherId, EventRecordId, QueueId};

use crate::error::{Error, Result};
use crate::metrics::{labels, PipelineMetrics};
use crate::queue::{EnqueueOptions, JobEnvelope, WorkerQueue};
use crate::record::{
    EventRecord, PipelineRun, PipelineRunMetadata, PipelineType, Queue, RawEvent,
    RuntimeEnvironment, SendEventOptions,
};
use crate::store::PipelineStore;

/// An existing event row may be updated while its scheduled delivery is at
/// least this many seconds away.
pub const EVENT_UPDATE_WINDOW_SECONDS: i64 = 5;

/// Default source label for events that carry none.
const DEFAULT_EVENT_SOURCE: &str = "api";

/// The owner of a pipeline run to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOwner {
    /// A queue-owned pipeline.
    Queue(QueueId),
    /// A dispatcher-owned pipeline.
    Dispatcher(DispatcherId),
}

/// Ingest-side configuration.
#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    /// Whether events without pipeline steps are enqueued for delivery.
    pub delivery_enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            delivery_enabled: true,
        }
    }
}

/// Upserts inbound raw events and routes them to the pipeline or delivery.
pub struct EventIngest {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn WorkerQueue>,
    config: IngestConfig,
    metrics: PipelineMetrics,
}

impl EventIngest {
    /// Creates an ingest over the given store and worker queue.
    #[must_use]
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn WorkerQueue>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Upserts an inbound event and routes it.
    ///
    /// Returns the persisted (or existing, when final) event record.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingEntity`] when `options.queue_slug` resolves to no
    ///   queue in the environment's project
    /// - [`Error::DuplicateKey`] when a concurrent create wins the
    ///   `(event_id, environment_id)` race
    /// - Storage failures propagate
    #[tracing::instrument(skip_all, fields(event_id = %event.id, environment_id = %environment.id))]
    pub async fn send(
        &self,
        environment: &RuntimeEnvironment,
        event: RawEvent,
        options: SendEventOptions,
        source_context: Option<Value>,
        event_source: Option<&str>,
    ) -> Result<EventRecord> {
        let now = Utc::now();
        let deliver_at = resolve_deliver_at(&options, now);

        let queue = match &options.queue_slug {
            Some(slug) => {
                let queue = self
                    .store
                    .find_queue_by_slug(environment.project_id, slug)
                    .await?
                    .ok_or_else(|| Error::missing_entity("queue", slug.clone()))?;
                Some(queue)
            }
            None => None,
        };

        let account = match &options.account_id {
            Some(identifier) => Some(
                self.store
                    .upsert_external_account(environment.id, identifier)
                    .await?,
            ),
            None => None,
        };

        let record = match self.store.find_event_by_key(&event.id, environment.id).await? {
            Some(existing) => {
                if existing.deliver_at >= now + Duration::seconds(EVENT_UPDATE_WINDOW_SECONDS) {
                    let mut updated = existing;
                    updated.payload = event.payload;
                    updated.context = event.context;
                    updated.queue_id = queue.as_ref().map(|q| q.id);
                    updated.deliver_at = deliver_at;
                    let updated = self.store.update_event(updated).await?;
                    self.metrics.record_event_ingested(labels::OUTCOME_UPDATED);
                    updated
                } else {
                    // Delivery is imminent or past: the row is final.
                    self.metrics.record_event_ingested(labels::OUTCOME_UNCHANGED);
                    return Ok(existing);
                }
            }
            None => {
                let record = EventRecord {
                    id: EventRecordId::generate(),
                    event_id: event.id,
                    environment_id: environment.id,
                    project_id: environment.project_id,
                    name: event.name,
                    payload: event.payload,
                    payload_type: "application/json".to_string(),
                    context: event.context,
                    source_context: source_context.unwrap_or(Value::Null),
                    source: event
                        .source
                        .or_else(|| event_source.map(str::to_string))
                        .unwrap_or_else(|| DEFAULT_EVENT_SOURCE.to_string()),
                    timestamp: event.timestamp.unwrap_or(now),
                    queue_id: queue.as_ref().map(|q| q.id),
                    should_process_queue_pipeline: true,
                    should_process_dispatcher_pipeline: true,
                    deliver_at,
                    pipeline_output_run_id: None,
                    external_account_id: account.map(|a| a.id),
                    created_at: now,
                };
                let record = self.store.create_event(record).await?;
                self.metrics.record_event_ingested(labels::OUTCOME_CREATED);
                record
            }
        };

        self.route(&record, queue.as_ref()).await?;
        Ok(record)
    }

    /// Creates a pipeline run for an event: snapshots the owner's step IDs,
    /// seeds the output with the input payload, and enqueues the first
    /// `runPipeline` step.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::MissingEntity`] when the owner or the event does
    /// not exist; storage failures propagate.
    pub async fn create_pipeline(
        &self,
        owner: PipelineOwner,
        event_record_id: EventRecordId,
    ) -> Result<PipelineRun> {
        let Some(input) = self.store.get_event(event_record_id).await? else {
            return Err(Error::missing_entity("event record", event_record_id));
        };

        let (run_type, steps, metadata) = match owner {
            PipelineOwner::Queue(queue_id) => {
                let queue = self
                    .store
                    .get_queue(queue_id)
                    .await?
                    .ok_or_else(|| Error::missing_entity("queue", queue_id))?;
                (
                    PipelineType::Queue,
                    queue.steps.iter().map(|step| step.id).collect(),
                    PipelineRunMetadata {
                        queue_id: Some(queue_id),
                        dispatcher_id: None,
                    },
                )
            }
            PipelineOwner::Dispatcher(dispatcher_id) => {
                let dispatcher = self
                    .store
                    .get_dispatcher(dispatcher_id)
                    .await?
                    .ok_or_else(|| Error::missing_entity("dispatcher", dispatcher_id))?;
                (
                    PipelineType::Dispatcher,
                    dispatcher.steps.iter().map(|step| step.id).collect(),
                    PipelineRunMetadata {
                        queue_id: None,
                        dispatcher_id: Some(dispatcher_id),
                    },
                )
            }
        };

        let run = PipelineRun::new(run_type, steps, input.id, input.payload.clone(), metadata);
        let run = self.store.create_run(run).await?;

        let job = JobEnvelope::run_pipeline(run.id);
        self.metrics.record_job_enqueued(&job.name);
        self.queue
            .enqueue(
                job,
                EnqueueOptions::new().with_job_key(format!("run:{}:step:0", run.id)),
            )
            .await?;

        tracing::info!(run_id = %run.id, input_event = %event_record_id, "created pipeline run");
        Ok(run)
    }

    async fn route(&self, record: &EventRecord, queue: Option<&Queue>) -> Result<()> {
        if let Some(queue) = queue {
            if !queue.steps.is_empty() {
                let job = JobEnvelope::create_queue_pipeline(queue.id, record.id);
                self.metrics.record_job_enqueued(&job.name);
                self.queue.enqueue(job, EnqueueOptions::new()).await?;
                return Ok(());
            }
        }

        if self.config.delivery_enabled {
            let job = JobEnvelope::deliver_event(record.id);
            self.metrics.record_job_enqueued(&job.name);
            self.queue
                .enqueue(
                    job,
                    EnqueueOptions::new()
                        .with_run_at(record.deliver_at)
                        .with_job_key(format!("event:{}", record.id)),
                )
                .await?;
        }
        Ok(())
    }
}

fn resolve_deliver_at(options: &SendEventOptions, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(deliver_at) = options.deliver_at {
        return deliver_at;
    }
    if let Some(seconds) = options.deliver_after {
        return now + Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX));
    }
    now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliver_at_prefers_explicit_time() {
        let now = Utc::now();
        let explicit = now + Duration::seconds(120);
        let options = SendEventOptions {
            deliver_at: Some(explicit),
            deliver_after: Some(10),
            ..SendEventOptions::default()
        };
        assert_eq!(resolve_deliver_at(&options, now), explicit);
    }

    #[test]
    fn deliver_at_falls_back_to_delay() {
        let now = Utc::now();
        let options = SendEventOptions {
            deliver_after: Some(30),
            ..SendEventOptions::default()
        };
        assert_eq!(resolve_deliver_at(&options, now), now + Duration::seconds(30));
    }

    #[test]
    fn deliver_at_defaults_to_now() {
        let now = Utc::now();
        assert_eq!(resolve_deliver_at(&SendEventOptions::default(), now), now);
    }
}
