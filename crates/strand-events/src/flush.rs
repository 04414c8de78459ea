//! Dynamic flush scheduling for coalesced writes.
//!
//! [`DynamicFlushScheduler`] accepts single items and coalesces them into
//! size/time-bounded batches:
//!
//! - A size trigger fires when the accumulated buffer reaches `batch_size`.
//! - A time trigger fires `flush_interval` after the oldest un-flushed item.
//!
//! Both triggers invoke the flush callback exactly once per batch. A single
//! worker task drives all flushes, which gives natural back-pressure: while
//! a callback is in flight the next trigger is deferred and incoming items
//! accumulate without being dropped. A failed callback is logged and the
//! batch discarded; callers that need durability use the immediate insert
//! path instead of the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::metrics::{labels, names};

/// Flush scheduler parameters.
#[derive(Debug, Clone, Copy)]
pub struct FlushConfig {
    /// Maximum number of items per flushed batch.
    pub batch_size: usize,
    /// Flush interval measured from the oldest un-flushed item.
    pub flush_interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: strand_core::config::DEFAULT_BATCH_SIZE,
            flush_interval: strand_core::config::DEFAULT_BATCH_INTERVAL,
        }
    }
}

type FlushCallback<T> = Arc<dyn Fn(String, Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Coalesces single-item writes into batches delivered to a callback.
pub struct DynamicFlushScheduler<T: Send + 'static> {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<T>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    flush_counter: Arc<AtomicU64>,
}

impl<T: Send + 'static> DynamicFlushScheduler<T> {
    /// Creates a scheduler and spawns its worker task.
    ///
    /// Must be called within a tokio runtime. The callback runs on the
    /// worker task; one invocation at a time, batches in submission order.
    pub fn new<F, Fut>(config: FlushConfig, callback: F) -> Self
    where
        F: Fn(String, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let callback: FlushCallback<T> =
            Arc::new(move |id, batch| Box::pin(callback(id, batch)));
        let (tx, rx) = mpsc::unbounded_channel();
        let flush_counter = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(run_worker(config, rx, callback, Arc::clone(&flush_counter)));

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            flush_counter,
        }
    }

    /// Adds items to the current batch. Returns immediately; the items are
    /// flushed by the worker task on the next size or time trigger.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler has been shut down.
    pub fn add_to_batch(&self, items: impl IntoIterator<Item = T>) -> Result<()> {
        let items: Vec<T> = items.into_iter().collect();
        if items.is_empty() {
            return Ok(());
        }

        let guard = self
            .tx
            .lock()
            .map_err(|_| Error::storage("flush scheduler lock poisoned"))?;
        let Some(tx) = guard.as_ref() else {
            return Err(Error::storage("flush scheduler has been shut down"));
        };
        tx.send(items)
            .map_err(|_| Error::storage("flush scheduler worker is gone"))
    }

    /// Returns the number of batches flushed so far (including failed ones).
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flush_counter.load(Ordering::Relaxed)
    }

    /// Shuts the scheduler down, flushing any outstanding items first.
    pub async fn shutdown(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "flush worker task aborted during shutdown");
            }
        }
    }
}

async fn run_worker<T: Send + 'static>(
    config: FlushConfig,
    mut rx: mpsc::UnboundedReceiver<Vec<T>>,
    callback: FlushCallback<T>,
    flush_counter: Arc<AtomicU64>,
) {
    let mut buffer: Vec<T> = Vec::new();
    let mut oldest: Option<Instant> = None;

    loop {
        let deadline = oldest.map(|at| at + config.flush_interval);
        tokio::select! {
            received = rx.recv() => match received {
                Some(items) => {
                    if buffer.is_empty() {
                        oldest = Some(Instant::now());
                    }
                    buffer.extend(items);
                    while buffer.len() >= config.batch_size {
                        let batch: Vec<T> = buffer.drain(..config.batch_size).collect();
                        flush_batch(&callback, &flush_counter, labels::TRIGGER_SIZE, batch).await;
                    }
                    if buffer.is_empty() {
                        oldest = None;
                    }
                }
                None => break,
            },
            () = sleep_until_deadline(deadline), if deadline.is_some() => {
                if !buffer.is_empty() {
                    let batch = std::mem::take(&mut buffer);
                    flush_batch(&callback, &flush_counter, labels::TRIGGER_INTERVAL, batch).await;
                }
                oldest = None;
            }
        }
    }

    // Channel closed: flush whatever remains before exiting.
    while !buffer.is_empty() {
        let take = buffer.len().min(config.batch_size);
        let batch: Vec<T> = buffer.drain(..take).collect();
        flush_batch(&callback, &flush_counter, labels::TRIGGER_SHUTDOWN, batch).await;
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn flush_batch<T>(
    callback: &FlushCallback<T>,
    flush_counter: &AtomicU64,
    trigger: &'static str,
    batch: Vec<T>,
) {
    let flush_id = format!("flush-{}", flush_counter.fetch_add(1, Ordering::Relaxed));
    let size = batch.len();
    let started = Instant::now();

    let result = callback(flush_id.clone(), batch).await;

    metrics::histogram!(names::FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            metrics::counter!(
                names::BATCHES_TOTAL,
                labels::TRIGGER => trigger,
                labels::RESULT => labels::RESULT_FLUSHED,
            )
            .increment(1);
            tracing::debug!(%flush_id, size, trigger, "flushed batch");
        }
        Err(error) => {
            metrics::counter!(
                names::BATCHES_TOTAL,
                labels::TRIGGER => trigger,
                labels::RESULT => labels::RESULT_DROPPED,
            )
            .increment(1);
            tracing::error!(%flush_id, size, trigger, %error, "flush failed, batch dropped");
        }
    }
}
