//! The event repository: ingest, persist, derive, query, and publish span
//! records.
//!
//! Writes take one of two paths:
//!
//! - **Scheduled** (`insert`, `insert_many`): coalesced through the
//!   [`DynamicFlushScheduler`]; failures are logged and the batch dropped.
//! - **Immediate** (`insert_immediate`, `insert_many_immediate`): written
//!   synchronously; failures propagate to the caller.
//!
//! After any persistence, one notification per distinct
//! `(trace_id, span_id)` pair in the batch is published to
//! `events:{trace_id}:{span_id}` so live subscribers can re-query.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use strand_core::json::flatten;
use strand_core::{EnvironmentId, EventsConfig, SpanId, TraceId};

use crate::broker::{span_channel, trace_pattern, BrokerMessage, MessageBroker, Subscription};
use crate::error::{Error, Result};
use crate::flush::{DynamicFlushScheduler, FlushConfig};
use crate::metrics::{labels, EventMetrics};
use crate::span::{
    datetime_nanos, now_nanos, SpanBuilder, SpanEvent, SpanLink, SpanRecord, SpanStatus,
    TraceContext, CANCELLATION_EVENT, EXCEPTION_EVENT, EXCEPTION_STACKTRACE_PROPERTY,
    PRIVATE_PROPERTY_PREFIX, PROJECT_DIR_ATTRIBUTE,
};
use crate::store::{SpanQuery, SpanStore};
use crate::trace::{build_trace_summary, dedup_spans, TraceSummary};

/// Output content types preserved verbatim on completion instead of being
/// flattened into attributes.
const PRESERVED_OUTPUT_TYPES: [&str; 2] = ["application/store", "text/plain"];

/// Options for span-synthesizing operations.
#[derive(Debug, Clone)]
pub struct EventOptions {
    /// Owning environment.
    pub environment_id: EnvironmentId,
    /// The task run producing the span. Required; synthesis fails with
    /// [`Error::MissingRunId`] when absent.
    pub run_id: Option<String>,
    /// Incoming trace context; when absent a fresh trace is minted.
    pub context: Option<TraceContext>,
    /// Seed for deterministic span-ID derivation.
    pub span_id_seed: Option<String>,
    /// Treat the incoming parent as a link instead of a parent, minting a
    /// fresh trace.
    pub span_parent_as_link: bool,
    /// Insert a partial row (open span) instead of a completed one.
    pub incomplete: bool,
    /// Explicit start time in nanoseconds; defaults to now.
    pub start_time: Option<i64>,
    /// Initial span properties.
    pub properties: Option<Value>,
    /// Initial span metadata.
    pub metadata: Option<Value>,
    /// Input payload and its content type.
    pub payload: Option<(Value, String)>,
}

impl EventOptions {
    /// Creates options for the given environment (no run ID yet).
    #[must_use]
    pub fn new(environment_id: EnvironmentId) -> Self {
        Self {
            environment_id,
            run_id: None,
            context: None,
            span_id_seed: None,
            span_parent_as_link: false,
            incomplete: false,
            start_time: None,
            properties: None,
            metadata: None,
            payload: None,
        }
    }

    /// Sets the producing run.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the incoming trace context.
    #[must_use]
    pub fn with_context(mut self, context: TraceContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the deterministic span-ID seed.
    #[must_use]
    pub fn with_span_id_seed(mut self, seed: impl Into<String>) -> Self {
        self.span_id_seed = Some(seed.into());
        self
    }

    /// Converts the incoming parent into a link.
    #[must_use]
    pub fn with_span_parent_as_link(mut self) -> Self {
        self.span_parent_as_link = true;
        self
    }

    /// Requests a partial (open) span row.
    #[must_use]
    pub fn incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }

    /// Sets an explicit start time in nanoseconds.
    #[must_use]
    pub fn with_start_time(mut self, start_time: i64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Sets initial span properties.
    #[must_use]
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Options for [`EventRepository::complete_event`].
#[derive(Debug, Clone, Default)]
pub struct CompleteEventOptions {
    /// Completion time; defaults to now.
    pub end_time: Option<DateTime<Utc>>,
    /// Output to merge onto the completion row.
    pub output: Option<Value>,
    /// Output content type.
    pub output_type: Option<String>,
}

/// A hydrated single-span view.
#[derive(Debug, Clone)]
pub struct SpanDetail {
    /// The winning row, with stack traces rewritten relative to the project
    /// directory.
    pub record: SpanRecord,
    /// Properties with internal (`$`-prefixed) keys removed.
    pub visible_properties: Value,
}

/// A live subscription to one trace's span updates.
///
/// Holds the broker subscription and keeps the live-subscriber gauge
/// accurate: the count drops when the subscription is unsubscribed or
/// dropped.
#[derive(Debug)]
pub struct TraceSubscription {
    subscription: Option<Subscription>,
    counter: Arc<AtomicUsize>,
    metrics: EventMetrics,
}

impl TraceSubscription {
    /// Receives the next update, or `None` once the subscription closes.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        match self.subscription.as_mut() {
            Some(subscription) => subscription.recv().await,
            None => None,
        }
    }

    /// Receives an update if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BrokerMessage> {
        self.subscription.as_mut().and_then(Subscription::try_recv)
    }

    /// Tears the subscription down synchronously.
    pub fn unsubscribe(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.release();
    }

    fn release(&mut self) {
        let remaining = self.counter.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        self.metrics.set_trace_subscribers(remaining);
    }
}

impl Drop for TraceSubscription {
    fn drop(&mut self) {
        if self.subscription.take().is_some() {
            self.release();
        }
    }
}

/// Builder handle passed to [`EventRepository::trace_event`] closures.
///
/// Cheap to clone; all clones write to the same span under construction.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    inner: Arc<std::sync::Mutex<SpanBuilder>>,
    context: TraceContext,
}

impl EventBuilder {
    fn new(context: TraceContext) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(SpanBuilder::default())),
            context,
        }
    }

    /// The propagated context for child spans.
    #[must_use]
    pub fn context(&self) -> TraceContext {
        self.context
    }

    /// The W3C `traceparent` value for propagation.
    #[must_use]
    pub fn traceparent(&self) -> String {
        self.context.traceparent()
    }

    /// Sets span properties.
    pub fn set_properties(&self, properties: Value) {
        if let Ok(mut builder) = self.inner.lock() {
            builder.set_properties(properties);
        }
    }

    /// Sets span metadata.
    pub fn set_metadata(&self, metadata: Value) {
        if let Ok(mut builder) = self.inner.lock() {
            builder.set_metadata(metadata);
        }
    }

    /// Sets display styling.
    pub fn set_style(&self, style: Value) {
        if let Ok(mut builder) = self.inner.lock() {
            builder.set_style(style);
        }
    }

    /// Sets the input payload and its content type.
    pub fn set_payload(&self, payload: Value, payload_type: impl Into<String>) {
        if let Ok(mut builder) = self.inner.lock() {
            builder.set_payload(payload, payload_type);
        }
    }

    /// Sets the output value and its content type.
    pub fn set_output(&self, output: Value, output_type: impl Into<String>) {
        if let Ok(mut builder) = self.inner.lock() {
            builder.set_output(output, output_type);
        }
    }

    /// Appends an in-span event.
    pub fn add_event(&self, event: SpanEvent) {
        if let Ok(mut builder) = self.inner.lock() {
            builder.add_event(event);
        }
    }

    /// Appends a span link.
    pub fn add_link(&self, link: SpanLink) {
        if let Ok(mut builder) = self.inner.lock() {
            builder.add_link(link);
        }
    }

    fn into_builder(self) -> SpanBuilder {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner().unwrap_or_default(),
            Err(shared) => {
                let mut guard = shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                std::mem::take(&mut *guard)
            }
        }
    }
}

/// The trace/event repository.
pub struct EventRepository {
    store: Arc<dyn SpanStore>,
    broker: Arc<dyn MessageBroker>,
    scheduler: DynamicFlushScheduler<SpanRecord>,
    config: EventsConfig,
    metrics: EventMetrics,
    subscriber_count: Arc<AtomicUsize>,
}

impl EventRepository {
    /// Creates a repository and starts its flush scheduler.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(
        store: Arc<dyn SpanStore>,
        broker: Arc<dyn MessageBroker>,
        config: EventsConfig,
    ) -> Self {
        let metrics = EventMetrics::new();
        let flush_store = Arc::clone(&store);
        let flush_broker = Arc::clone(&broker);
        let scheduler = DynamicFlushScheduler::new(
            FlushConfig {
                batch_size: config.batch_size,
                flush_interval: config.batch_interval,
            },
            move |flush_id, batch| {
                let store = Arc::clone(&flush_store);
                let broker = Arc::clone(&flush_broker);
                async move {
                    tracing::debug!(%flush_id, size = batch.len(), "persisting scheduled batch");
                    persist_batch(&*store, &*broker, metrics, labels::PATH_SCHEDULED, batch).await
                }
            },
        );

        Self {
            store,
            broker,
            scheduler,
            config,
            metrics,
            subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueues a row for batched persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository has been shut down.
    pub fn insert(&self, record: SpanRecord) -> Result<()> {
        self.scheduler.add_to_batch([record])
    }

    /// Enqueues several rows for batched persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository has been shut down.
    pub fn insert_many(&self, records: Vec<SpanRecord>) -> Result<()> {
        self.scheduler.add_to_batch(records)
    }

    /// Writes a row synchronously, bypassing the scheduler, then publishes.
    ///
    /// # Errors
    ///
    /// Storage and broker failures propagate to the caller.
    pub async fn insert_immediate(&self, record: SpanRecord) -> Result<()> {
        self.insert_many_immediate(vec![record]).await
    }

    /// Writes several rows synchronously, then publishes.
    ///
    /// # Errors
    ///
    /// Storage and broker failures propagate to the caller.
    pub async fn insert_many_immediate(&self, records: Vec<SpanRecord>) -> Result<()> {
        persist_batch(
            &*self.store,
            &*self.broker,
            self.metrics,
            labels::PATH_IMMEDIATE,
            records,
        )
        .await
    }

    /// Synthesizes a zero-duration, non-partial span and enqueues it.
    ///
    /// Mints a fresh trace when `options.context` is absent; derives the
    /// span ID deterministically when `options.span_id_seed` is given.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::MissingRunId`] when `options.run_id` is absent.
    pub fn record_event(&self, message: &str, options: EventOptions) -> Result<SpanRecord> {
        let run_id = options.run_id.clone().ok_or(Error::MissingRunId)?;

        let trace_id = options
            .context
            .map_or_else(TraceId::generate, |context| context.trace_id);
        let span_id = match &options.span_id_seed {
            Some(seed) => SpanId::deterministic(&trace_id, seed),
            None => SpanId::generate(),
        };

        let mut record = SpanRecord::new(
            options.environment_id,
            run_id,
            trace_id,
            span_id,
            message,
        );
        if let Some(context) = options.context {
            record.parent_id = Some(context.span_id);
        }
        if let Some(start_time) = options.start_time {
            record.start_time = start_time;
        }
        if let Some(properties) = options.properties {
            record.properties = properties;
        }
        if let Some(metadata) = options.metadata {
            record.metadata = metadata;
        }
        if let Some((payload, payload_type)) = options.payload {
            record.payload = payload;
            record.payload_type = payload_type;
        }

        self.insert(record.clone())?;
        Ok(record)
    }

    /// Synthesizes a span around `f`, measuring its wall-clock duration with
    /// a monotonic clock.
    ///
    /// The closure receives an [`EventBuilder`] carrying the propagated
    /// context for child spans. On `Err` the span is still persisted (marked
    /// errored) before the error re-propagates. With `options.incomplete`
    /// the row is inserted partial with zero duration; with
    /// `options.span_parent_as_link` the incoming parent becomes a link and
    /// a fresh trace is minted.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::MissingRunId`] when `options.run_id` is absent;
    /// otherwise returns the closure's result.
    pub async fn trace_event<F, Fut, R>(
        &self,
        message: &str,
        options: EventOptions,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(EventBuilder) -> Fut,
        Fut: std::future::Future<Output = Result<R>>,
    {
        let run_id = options.run_id.clone().ok_or(Error::MissingRunId)?;

        let (trace_id, parent_id, parent_link) = match (options.context, options.span_parent_as_link)
        {
            (Some(context), true) => (
                TraceId::generate(),
                None,
                Some(SpanLink {
                    trace_id: context.trace_id,
                    span_id: context.span_id,
                    properties: Value::Null,
                }),
            ),
            (Some(context), false) => (context.trace_id, Some(context.span_id), None),
            (None, _) => (TraceId::generate(), None, None),
        };
        let span_id = match &options.span_id_seed {
            Some(seed) => SpanId::deterministic(&trace_id, seed),
            None => SpanId::generate(),
        };

        let builder = EventBuilder::new(TraceContext::new(trace_id, span_id));
        let handle = builder.clone();

        let started = Instant::now();
        let start_time = options.start_time.unwrap_or_else(now_nanos);
        let result = f(handle).await;
        let elapsed_nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let mut record = SpanRecord::new(
            options.environment_id,
            run_id,
            trace_id,
            span_id,
            message,
        )
        .with_start_time(start_time);
        record.parent_id = parent_id;
        if let Some(link) = parent_link {
            record.links.push(link);
        }
        if let Some(properties) = options.properties {
            record.properties = properties;
        }
        if let Some(metadata) = options.metadata {
            record.metadata = metadata;
        }
        if let Some((payload, payload_type)) = options.payload {
            record.payload = payload;
            record.payload_type = payload_type;
        }
        builder.into_builder().apply_to(&mut record);

        if options.incomplete {
            record.is_partial = true;
            record.duration = 0;
        } else {
            record.duration = elapsed_nanos;
        }
        if result.is_err() {
            record.is_error = true;
            record.status = SpanStatus::Error;
        }

        self.insert(record)?;
        result
    }

    /// Completes an open span: finds its latest incomplete row and inserts a
    /// superseding completion row carrying the content forward.
    ///
    /// The output is canonicalized: `application/store` and `text/plain`
    /// outputs are preserved verbatim, anything else is flattened into
    /// attribute form.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IncompleteSpanNotFound`] when no open row exists
    /// for the span.
    pub async fn complete_event(
        &self,
        span_id: SpanId,
        options: CompleteEventOptions,
    ) -> Result<SpanRecord> {
        let rows = self
            .store
            .query(&SpanQuery::new().for_span(span_id))
            .await?;
        let incomplete = incomplete_rows(rows);
        let partial = incomplete
            .into_iter()
            .max_by_key(|row| row.id)
            .ok_or(Error::IncompleteSpanNotFound { span_id })?;

        let end_time = options.end_time.unwrap_or_else(Utc::now);
        let end_nanos = datetime_nanos(end_time);

        let mut completion = partial.clone();
        completion.id = strand_core::SpanRecordId::generate();
        completion.is_partial = false;
        completion.duration =
            u64::try_from(end_nanos.saturating_sub(partial.start_time)).unwrap_or(0);
        completion.created_at = Utc::now();

        if let Some(output) = options.output {
            let (output, output_type) = canonicalize_output(output, options.output_type);
            completion.output = output;
            completion.output_type = Some(output_type);
        }

        self.insert(completion.clone())?;
        Ok(completion)
    }

    /// Cancels an open span: inserts a non-partial row marked cancelled with
    /// a prepended `cancellation` event.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotPartial`] when the row is not partial;
    /// storage/broker failures propagate (immediate path).
    pub async fn cancel_event(
        &self,
        record: &SpanRecord,
        cancelled_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<SpanRecord> {
        if !record.is_partial {
            return Err(Error::NotPartial {
                span_id: record.span_id,
            });
        }

        let mut cancelled = record.clone();
        cancelled.id = strand_core::SpanRecordId::generate();
        cancelled.is_partial = false;
        cancelled.is_cancelled = true;
        cancelled.duration = u64::try_from(
            datetime_nanos(cancelled_at).saturating_sub(record.start_time),
        )
        .unwrap_or(0);
        cancelled.created_at = Utc::now();
        cancelled.events.insert(
            0,
            SpanEvent::new(
                CANCELLATION_EVENT,
                cancelled_at,
                serde_json::json!({ "reason": reason }),
            ),
        );

        self.insert_immediate(cancelled.clone()).await?;
        Ok(cancelled)
    }

    /// Records a crash of an open span: inserts a non-partial, errored row
    /// with a prepended `exception` event.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotPartial`] when the row is not partial;
    /// storage/broker failures propagate (immediate path).
    pub async fn crash_event(
        &self,
        record: &SpanRecord,
        crashed_at: DateTime<Utc>,
        exception_message: &str,
        stacktrace: Option<&str>,
    ) -> Result<SpanRecord> {
        if !record.is_partial {
            return Err(Error::NotPartial {
                span_id: record.span_id,
            });
        }

        let mut properties = serde_json::Map::new();
        properties.insert(
            "exception.message".to_string(),
            Value::String(exception_message.to_string()),
        );
        if let Some(stacktrace) = stacktrace {
            properties.insert(
                EXCEPTION_STACKTRACE_PROPERTY.to_string(),
                Value::String(stacktrace.to_string()),
            );
        }

        let mut crashed = record.clone();
        crashed.id = strand_core::SpanRecordId::generate();
        crashed.is_partial = false;
        crashed.is_error = true;
        crashed.status = SpanStatus::Error;
        crashed.duration = u64::try_from(
            datetime_nanos(crashed_at).saturating_sub(record.start_time),
        )
        .unwrap_or(0);
        crashed.created_at = Utc::now();
        crashed
            .events
            .insert(0, SpanEvent::new(EXCEPTION_EVENT, crashed_at, Value::Object(properties)));

        self.insert_immediate(crashed.clone()).await?;
        Ok(crashed)
    }

    /// Pass-through filtered read.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn query_events(&self, query: &SpanQuery) -> Result<Vec<SpanRecord>> {
        self.store.query(query).await
    }

    /// Returns rows that are partial, not cancelled, and not superseded by a
    /// completed row within the query result.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn query_incomplete_events(&self, query: &SpanQuery) -> Result<Vec<SpanRecord>> {
        let rows = self.store.query(query).await?;
        Ok(incomplete_rows(rows))
    }

    /// Reconstructs the trace rooted view for one trace.
    ///
    /// Returns `None` when the trace has no rows or no root.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn get_trace_summary(&self, trace_id: TraceId) -> Result<Option<TraceSummary>> {
        let rows = self
            .store
            .query(&SpanQuery::new().for_trace(trace_id))
            .await?;
        Ok(build_trace_summary(rows))
    }

    /// Hydrates a single span: winning row with stack traces rewritten
    /// relative to the project directory, and internal properties hidden.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn get_span(
        &self,
        trace_id: TraceId,
        span_id: SpanId,
    ) -> Result<Option<SpanDetail>> {
        let rows = self
            .store
            .query(&SpanQuery::new().for_trace(trace_id).for_span(span_id))
            .await?;
        let Some(mut record) = dedup_spans(rows).pop() else {
            return Ok(None);
        };

        rewrite_stacktrace(&mut record);
        let visible_properties = visible_properties(&record.properties);

        Ok(Some(SpanDetail {
            record,
            visible_properties,
        }))
    }

    /// Opens a live subscription to every span update of a trace.
    ///
    /// Increments the live-subscriber gauge; the count drops when the
    /// subscription is unsubscribed or dropped.
    ///
    /// # Errors
    ///
    /// Propagates broker failures.
    pub async fn subscribe_to_trace(&self, trace_id: TraceId) -> Result<TraceSubscription> {
        let subscription = self.broker.subscribe(&trace_pattern(&trace_id)).await?;

        let live = self.subscriber_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.set_trace_subscribers(live);
        tracing::debug!(%trace_id, live, "opened trace subscription");

        Ok(TraceSubscription {
            subscription: Some(subscription),
            counter: Arc::clone(&self.subscriber_count),
            metrics: self.metrics,
        })
    }

    /// Returns the number of live trace subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    /// Deletes rows older than the configured retention window. Safe to run
    /// concurrently with writes.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn truncate_events(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(self.config.retention_days));
        let removed = self.store.delete_older_than(cutoff).await?;
        self.metrics.record_truncated_rows(removed);
        tracing::info!(removed, retention_days = self.config.retention_days, "truncated span rows");
        Ok(removed)
    }

    /// Generates a W3C-compatible random trace ID.
    #[must_use]
    pub fn generate_trace_id(&self) -> TraceId {
        TraceId::generate()
    }

    /// Generates a W3C-compatible random span ID.
    #[must_use]
    pub fn generate_span_id(&self) -> SpanId {
        SpanId::generate()
    }

    /// Flushes the outstanding batch and stops the scheduler. Call on
    /// process shutdown.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

/// Filters a result set down to rows that are open: partial, not cancelled,
/// and without a completed row for the same span ID in the set.
fn incomplete_rows(rows: Vec<SpanRecord>) -> Vec<SpanRecord> {
    let completed: HashSet<SpanId> = rows
        .iter()
        .filter(|row| !row.is_partial)
        .map(|row| row.span_id)
        .collect();

    rows.into_iter()
        .filter(|row| row.is_partial && !row.is_cancelled && !completed.contains(&row.span_id))
        .collect()
}

/// Canonicalizes a completion output: preserved content types pass through,
/// anything else is flattened to attribute form.
fn canonicalize_output(output: Value, output_type: Option<String>) -> (Value, String) {
    match output_type {
        Some(output_type) if PRESERVED_OUTPUT_TYPES.contains(&output_type.as_str()) => {
            (output, output_type)
        }
        _ => (
            Value::Object(flatten(&output)),
            "application/json".to_string(),
        ),
    }
}

/// Suppresses partial rows that a non-partial row in the same batch
/// supersedes.
fn suppress_superseded_partials(batch: Vec<SpanRecord>) -> Vec<SpanRecord> {
    let completed: HashSet<SpanId> = batch
        .iter()
        .filter(|row| !row.is_partial)
        .map(|row| row.span_id)
        .collect();

    batch
        .into_iter()
        .filter(|row| !(row.is_partial && completed.contains(&row.span_id)))
        .collect()
}

/// Persists a batch and publishes one notification per distinct
/// `(trace, span)` pair.
async fn persist_batch(
    store: &dyn SpanStore,
    broker: &dyn MessageBroker,
    metrics: EventMetrics,
    path: &'static str,
    batch: Vec<SpanRecord>,
) -> Result<()> {
    let rows = suppress_superseded_partials(batch);
    if rows.is_empty() {
        return Ok(());
    }

    let mut pairs: Vec<(TraceId, SpanId)> = Vec::new();
    let mut seen: HashSet<(TraceId, SpanId)> = HashSet::new();
    for row in &rows {
        if seen.insert((row.trace_id, row.span_id)) {
            pairs.push((row.trace_id, row.span_id));
        }
    }

    let written = rows.len();
    store.insert_batch(rows).await?;
    metrics.record_spans_written(path, written);

    let timestamp = Utc::now().to_rfc3339();
    let payload = Bytes::from(timestamp);
    for (trace_id, span_id) in &pairs {
        broker
            .publish(&span_channel(trace_id, span_id), payload.clone())
            .await?;
    }
    metrics.record_publishes(pairs.len());

    Ok(())
}

/// Rewrites the stored exception stack trace relative to the project
/// directory carried in the span's attributes.
fn rewrite_stacktrace(record: &mut SpanRecord) {
    let Some(properties) = record.properties.as_object() else {
        return;
    };
    let Some(project_dir) = properties
        .get(PROJECT_DIR_ATTRIBUTE)
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return;
    };
    let Some(stacktrace) = properties
        .get(EXCEPTION_STACKTRACE_PROPERTY)
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return;
    };

    let prefix = if project_dir.ends_with('/') {
        project_dir
    } else {
        format!("{project_dir}/")
    };
    let rewritten = stacktrace.replace(&prefix, "");

    if let Some(properties) = record.properties.as_object_mut() {
        properties.insert(
            EXCEPTION_STACKTRACE_PROPERTY.to_string(),
            Value::String(rewritten),
        );
    }
}

/// Returns the properties object with internal (`$`-prefixed) keys removed.
fn visible_properties(properties: &Value) -> Value {
    match properties.as_object() {
        Some(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !key.starts_with(PRIVATE_PROPERTY_PREFIX))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        None => properties.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::EnvironmentId;

    use crate::broker::InMemoryBroker;
    use crate::store::InMemorySpanStore;

    fn repository() -> (EventRepository, Arc<InMemorySpanStore>) {
        let store = Arc::new(InMemorySpanStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let repo = EventRepository::new(
            Arc::clone(&store) as Arc<dyn SpanStore>,
            broker,
            EventsConfig::default(),
        );
        (repo, store)
    }

    #[tokio::test]
    async fn record_event_requires_run_id() {
        let (repo, _store) = repository();
        let result = repo.record_event("test", EventOptions::new(EnvironmentId::generate()));
        assert!(matches!(result, Err(Error::MissingRunId)));
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn record_event_mints_trace_without_context() {
        let (repo, _store) = repository();
        let record = repo
            .record_event(
                "test",
                EventOptions::new(EnvironmentId::generate()).with_run_id("run_1"),
            )
            .unwrap();
        assert!(record.parent_id.is_none());
        assert!(!record.is_partial);
        assert_eq!(record.duration, 0);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn record_event_uses_deterministic_span_id() {
        let (repo, _store) = repository();
        let trace_id = TraceId::generate();
        let parent = SpanId::generate();
        let options = || {
            EventOptions::new(EnvironmentId::generate())
                .with_run_id("run_1")
                .with_context(TraceContext::new(trace_id, parent))
                .with_span_id_seed("attempt-1")
        };

        let a = repo.record_event("first", options()).unwrap();
        let b = repo.record_event("second", options()).unwrap();
        assert_eq!(a.span_id, b.span_id);
        assert_eq!(a.span_id, SpanId::deterministic(&trace_id, "attempt-1"));
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn trace_event_measures_duration_and_propagates_context() {
        let (repo, store) = repository();
        let environment_id = EnvironmentId::generate();

        let parent_context = repo
            .trace_event(
                "outer",
                EventOptions::new(environment_id).with_run_id("run_1"),
                |builder| {
                    let context = builder.context();
                    async move { Ok(context) }
                },
            )
            .await
            .unwrap();

        repo.shutdown().await;
        let rows = store.query(&SpanQuery::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trace_id, parent_context.trace_id);
        assert_eq!(rows[0].span_id, parent_context.span_id);
        assert!(!rows[0].is_partial);
    }

    #[tokio::test]
    async fn trace_event_incomplete_inserts_partial_row() {
        let (repo, store) = repository();
        repo.trace_event(
            "open",
            EventOptions::new(EnvironmentId::generate())
                .with_run_id("run_1")
                .incomplete(),
            |_builder| async { Ok(()) },
        )
        .await
        .unwrap();

        repo.shutdown().await;
        let rows = store.query(&SpanQuery::new()).await.unwrap();
        assert!(rows[0].is_partial);
        assert_eq!(rows[0].duration, 0);
    }

    #[tokio::test]
    async fn trace_event_persists_span_on_error() {
        let (repo, store) = repository();
        let result: Result<()> = repo
            .trace_event(
                "failing",
                EventOptions::new(EnvironmentId::generate()).with_run_id("run_1"),
                |_builder| async { Err(Error::storage("boom")) },
            )
            .await;
        assert!(result.is_err());

        repo.shutdown().await;
        let rows = store.query(&SpanQuery::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_error);
        assert_eq!(rows[0].status, SpanStatus::Error);
    }

    #[tokio::test]
    async fn trace_event_parent_as_link_mints_fresh_trace() {
        let (repo, store) = repository();
        let incoming = TraceContext::new(TraceId::generate(), SpanId::generate());

        repo.trace_event(
            "detached",
            EventOptions::new(EnvironmentId::generate())
                .with_run_id("run_1")
                .with_context(incoming)
                .with_span_parent_as_link(),
            |_builder| async { Ok(()) },
        )
        .await
        .unwrap();

        repo.shutdown().await;
        let rows = store.query(&SpanQuery::new()).await.unwrap();
        assert_ne!(rows[0].trace_id, incoming.trace_id);
        assert!(rows[0].parent_id.is_none());
        assert_eq!(rows[0].links.len(), 1);
        assert_eq!(rows[0].links[0].trace_id, incoming.trace_id);
        assert_eq!(rows[0].links[0].span_id, incoming.span_id);
    }

    #[test]
    fn canonicalize_preserves_store_and_plain_outputs() {
        let (value, output_type) = canonicalize_output(
            json!({"nested": {"a": 1}}),
            Some("application/store".to_string()),
        );
        assert_eq!(value, json!({"nested": {"a": 1}}));
        assert_eq!(output_type, "application/store");

        let (value, output_type) =
            canonicalize_output(json!("plain text"), Some("text/plain".to_string()));
        assert_eq!(value, json!("plain text"));
        assert_eq!(output_type, "text/plain");
    }

    #[test]
    fn canonicalize_flattens_other_outputs() {
        let (value, output_type) = canonicalize_output(json!({"a": {"b": 1}}), None);
        assert_eq!(value, json!({"a.b": 1}));
        assert_eq!(output_type, "application/json");
    }

    #[test]
    fn suppression_drops_partial_with_completed_sibling() {
        let environment_id = EnvironmentId::generate();
        let trace = TraceId::generate();
        let span = SpanId::generate();

        let partial = SpanRecord::new(environment_id, "run_1", trace, span, "open")
            .with_partial(true);
        let completed =
            SpanRecord::new(environment_id, "run_1", trace, span, "done").with_duration(100);
        let other = SpanRecord::new(environment_id, "run_1", trace, SpanId::generate(), "other")
            .with_partial(true);

        let kept = suppress_superseded_partials(vec![partial, completed, other]);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|row| !(row.is_partial && row.span_id == span)));
    }

    #[test]
    fn visible_properties_hide_internal_keys() {
        let properties = json!({
            "user.name": "ada",
            "$project.dir": "/home/app",
            "$internal": true,
        });
        let visible = visible_properties(&properties);
        assert_eq!(visible, json!({"user.name": "ada"}));
    }

    #[test]
    fn stacktrace_rewrite_strips_project_dir() {
        let mut record = SpanRecord::new(
            EnvironmentId::generate(),
            "run_1",
            TraceId::generate(),
            SpanId::generate(),
            "crashed",
        );
        record.properties = json!({
            PROJECT_DIR_ATTRIBUTE: "/home/app",
            EXCEPTION_STACKTRACE_PROPERTY: "at handler (/home/app/src/worker.ts:10:3)",
        });

        rewrite_stacktrace(&mut record);
        assert_eq!(
            record.properties[EXCEPTION_STACKTRACE_PROPERTY],
            json!("at handler (src/worker.ts:10:3)")
        );
    }
}
