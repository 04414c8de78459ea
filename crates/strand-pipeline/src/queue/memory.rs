//! In-memory worker queue implementation for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: Jobs are not visible across process
//!   boundaries
//! - **No scheduling**: `run_at` is recorded but jobs are taken in FIFO
//!   order

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ulid::Ulid;

use super::{EnqueueOptions, EnqueueResult, JobEnvelope, WorkerQueue};
use crate::error::{Error, Result};

/// Entry in the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Message ID.
    pub message_id: String,
    /// Job envelope.
    pub job: JobEnvelope,
    /// Options used when enqueuing.
    pub options: EnqueueOptions,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("worker queue lock poisoned")
}

/// In-memory worker queue for testing.
#[derive(Debug)]
pub struct InMemoryWorkerQueue {
    name: String,
    queue: RwLock<VecDeque<QueueEntry>>,
    /// Pending job keys mapped to their message IDs for deduplication.
    pending_keys: RwLock<HashMap<String, String>>,
}

impl Default for InMemoryWorkerQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InMemoryWorkerQueue {
    /// Creates a new in-memory worker queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: RwLock::new(VecDeque::new()),
            pending_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Takes the next job, releasing its dedup key.
    ///
    /// Returns `None` if the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn take(&self) -> Result<Option<QueueEntry>> {
        let entry = {
            let mut queue = self.queue.write().map_err(poison_err)?;
            queue.pop_front()
        };
        if let Some(entry) = &entry {
            if let Some(job_key) = &entry.options.job_key {
                let mut pending = self.pending_keys.write().map_err(poison_err)?;
                pending.remove(job_key);
            }
        }
        Ok(entry)
    }

    /// Peeks at the next job without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn peek(&self) -> Result<Option<QueueEntry>> {
        let queue = self.queue.read().map_err(poison_err)?;
        Ok(queue.front().cloned())
    }

    /// Returns all pending jobs, clearing the queue and dedup state.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn drain(&self) -> Result<Vec<QueueEntry>> {
        let drained = {
            let mut queue = self.queue.write().map_err(poison_err)?;
            queue.drain(..).collect()
        };
        self.pending_keys.write().map_err(poison_err)?.clear();
        Ok(drained)
    }
}

#[async_trait]
impl WorkerQueue for InMemoryWorkerQueue {
    async fn enqueue(&self, job: JobEnvelope, options: EnqueueOptions) -> Result<EnqueueResult> {
        if let Some(job_key) = &options.job_key {
            let pending = self.pending_keys.read().map_err(poison_err)?;
            if let Some(existing) = pending.get(job_key) {
                return Ok(EnqueueResult::Deduplicated {
                    existing_message_id: existing.clone(),
                });
            }
        }

        let message_id = Ulid::new().to_string();

        if let Some(job_key) = &options.job_key {
            let mut pending = self.pending_keys.write().map_err(poison_err)?;
            pending.insert(job_key.clone(), message_id.clone());
        }

        {
            let mut queue = self.queue.write().map_err(poison_err)?;
            queue.push_back(QueueEntry {
                message_id: message_id.clone(),
                job,
                options,
            });
        }

        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn queue_depth(&self) -> Result<usize> {
        let queue = self.queue.read().map_err(poison_err)?;
        Ok(queue.len())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
