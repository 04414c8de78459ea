//! In-memory pipeline store for testing and development.
//!
//! All state lives behind one `RwLock`, which makes [`commit_step`]
//! naturally atomic: the run mutation and the output event land together or
//! not at all.
//!
//! Not suitable for production: no persistence, single-process only.
//!
//! [`commit_step`]: PipelineStore::commit_step

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use strand_core::{
    AccountId, DispatcherId, EnvironmentId, EventRecordId, PipelineRunId, PipelineStepId,
    ProjectId, QueueId,
};

use super::{CasResult, PipelineStore, StepCommit};
use crate::error::{Error, Result};
use crate::record::{
    EventDispatcher, EventRecord, ExternalAccount, PipelineRun, PipelineStep, Queue,
};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("pipeline store lock poisoned")
}

#[derive(Default)]
struct Inner {
    events: HashMap<EventRecordId, EventRecord>,
    event_keys: HashMap<(String, EnvironmentId), EventRecordId>,
    queues: HashMap<QueueId, Queue>,
    queue_slugs: HashMap<(ProjectId, String), QueueId>,
    dispatchers: HashMap<DispatcherId, EventDispatcher>,
    dispatcher_slugs: HashMap<(ProjectId, String), DispatcherId>,
    steps: HashMap<PipelineStepId, PipelineStep>,
    accounts: HashMap<(EnvironmentId, String), ExternalAccount>,
    runs: HashMap<PipelineRunId, PipelineRun>,
}

impl Inner {
    fn insert_event(&mut self, record: EventRecord) -> Result<EventRecord> {
        let key = (record.event_id.clone(), record.environment_id);
        if self.event_keys.contains_key(&key) {
            return Err(Error::DuplicateKey {
                constraint: "EventRecord(eventId, environmentId)",
                key: format!("({}, {})", record.event_id, record.environment_id),
            });
        }
        self.event_keys.insert(key, record.id);
        self.events.insert(record.id, record.clone());
        Ok(record)
    }
}

/// Thread-safe in-memory pipeline store.
#[derive(Default)]
pub struct InMemoryPipelineStore {
    inner: RwLock<Inner>,
}

impl InMemoryPipelineStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored event records.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn event_count(&self) -> Result<usize> {
        Ok(self.inner.read().map_err(poison_err)?.events.len())
    }
}

impl std::fmt::Debug for InMemoryPipelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPipelineStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn create_event(&self, record: EventRecord) -> Result<EventRecord> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.insert_event(record)
    }

    async fn get_event(&self, id: EventRecordId) -> Result<Option<EventRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.events.get(&id).cloned())
    }

    async fn find_event_by_key(
        &self,
        event_id: &str,
        environment_id: EnvironmentId,
    ) -> Result<Option<EventRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let key = (event_id.to_string(), environment_id);
        Ok(inner
            .event_keys
            .get(&key)
            .and_then(|id| inner.events.get(id))
            .cloned())
    }

    async fn update_event(&self, record: EventRecord) -> Result<EventRecord> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.events.contains_key(&record.id) {
            return Err(Error::missing_entity("event record", record.id));
        }
        inner.events.insert(record.id, record.clone());
        Ok(record)
    }

    async fn create_queue(&self, queue: Queue) -> Result<Queue> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let key = (queue.project_id, queue.slug.clone());
        if inner.queue_slugs.contains_key(&key) {
            return Err(Error::DuplicateKey {
                constraint: "Queue(projectId, slug)",
                key: format!("({}, {})", queue.project_id, queue.slug),
            });
        }
        for step in &queue.steps {
            inner.steps.insert(step.id, step.clone());
        }
        inner.queue_slugs.insert(key, queue.id);
        inner.queues.insert(queue.id, queue.clone());
        Ok(queue)
    }

    async fn get_queue(&self, id: QueueId) -> Result<Option<Queue>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.queues.get(&id).cloned())
    }

    async fn find_queue_by_slug(
        &self,
        project_id: ProjectId,
        slug: &str,
    ) -> Result<Option<Queue>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let key = (project_id, slug.to_string());
        Ok(inner
            .queue_slugs
            .get(&key)
            .and_then(|id| inner.queues.get(id))
            .cloned())
    }

    async fn create_dispatcher(&self, dispatcher: EventDispatcher) -> Result<EventDispatcher> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let key = (dispatcher.project_id, dispatcher.slug.clone());
        if inner.dispatcher_slugs.contains_key(&key) {
            return Err(Error::DuplicateKey {
                constraint: "EventDispatcher(projectId, slug)",
                key: format!("({}, {})", dispatcher.project_id, dispatcher.slug),
            });
        }
        for step in &dispatcher.steps {
            inner.steps.insert(step.id, step.clone());
        }
        inner.dispatcher_slugs.insert(key, dispatcher.id);
        inner.dispatchers.insert(dispatcher.id, dispatcher.clone());
        Ok(dispatcher)
    }

    async fn get_dispatcher(&self, id: DispatcherId) -> Result<Option<EventDispatcher>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.dispatchers.get(&id).cloned())
    }

    async fn get_step(&self, id: PipelineStepId) -> Result<Option<PipelineStep>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.steps.get(&id).cloned())
    }

    async fn upsert_external_account(
        &self,
        environment_id: EnvironmentId,
        identifier: &str,
    ) -> Result<ExternalAccount> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let key = (environment_id, identifier.to_string());
        let account = inner.accounts.entry(key).or_insert_with(|| ExternalAccount {
            id: AccountId::generate(),
            environment_id,
            identifier: identifier.to_string(),
        });
        Ok(account.clone())
    }

    async fn create_run(&self, run: PipelineRun) -> Result<PipelineRun> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: PipelineRunId) -> Result<Option<PipelineRun>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.runs.get(&id).cloned())
    }

    async fn commit_step(&self, commit: StepCommit) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        let Some(run) = inner.runs.get(&commit.run_id) else {
            return Ok(CasResult::NotFound);
        };
        if run.is_terminal() || run.next_step_index != Some(commit.expected_step_index) {
            return Ok(CasResult::StepIndexMismatch {
                actual: run.next_step_index,
            });
        }

        // The cursor matched: apply the output event first so a duplicate
        // key surfaces before the run mutates.
        if let Some(output_event) = commit.output_event {
            inner.insert_event(output_event)?;
        }

        if let Some(run) = inner.runs.get_mut(&commit.run_id) {
            run.status = commit.update.status;
            run.next_step_index = commit.update.next_step_index;
            if let Some(output) = commit.update.output {
                run.output = output;
            }
            run.error = commit.update.error;
            run.updated_at = Utc::now();
        }

        Ok(CasResult::Success)
    }
}
