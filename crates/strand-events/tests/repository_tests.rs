//! End-to-end repository tests: batched persistence, publish-after-write,
//! cancellation propagation, and retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use strand_core::{EnvironmentId, EventsConfig, SpanId, TraceId};
use strand_events::broker::InMemoryBroker;
use strand_events::error::{Error, Result};
use strand_events::repository::{CompleteEventOptions, EventOptions, EventRepository};
use strand_events::span::{SpanRecord, CANCELLATION_EVENT, EXCEPTION_EVENT};
use strand_events::store::{InMemorySpanStore, SpanQuery, SpanStore};

fn test_config() -> EventsConfig {
    EventsConfig {
        batch_size: 10,
        batch_interval: Duration::from_millis(20),
        retention_days: 7,
        broker_url: None,
    }
}

fn harness() -> (EventRepository, Arc<InMemorySpanStore>, Arc<InMemoryBroker>) {
    let store = Arc::new(InMemorySpanStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let repository = EventRepository::new(
        Arc::clone(&store) as Arc<dyn SpanStore>,
        Arc::clone(&broker) as Arc<dyn strand_events::broker::MessageBroker>,
        test_config(),
    );
    (repository, store, broker)
}

/// Polls the store until it holds `expected` rows (or times out).
async fn wait_for_rows(store: &InMemorySpanStore, expected: usize) {
    for _ in 0..200 {
        if store.len().unwrap() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store never reached {expected} rows (has {})", store.len().unwrap());
}

fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

fn partial_span(
    environment_id: EnvironmentId,
    trace: TraceId,
    span: SpanId,
    start: i64,
) -> SpanRecord {
    SpanRecord::new(environment_id, "run_1", trace, span, "open span")
        .with_start_time(start)
        .with_partial(true)
}

#[tokio::test]
async fn cancellation_propagates_through_trace_summary() -> Result<()> {
    // Spans A (partial, root) at t=0 and B (partial, child of A) at
    // t=100ns. Cancelling A at t=500ns with reason "user" must cancel B
    // derivedly, with duration bounded by the cancellation time.
    let (repository, store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();
    let a = SpanId::generate();
    let b = SpanId::generate();

    let root = partial_span(environment_id, trace, a, 0);
    let child = partial_span(environment_id, trace, b, 100).with_parent(a);
    repository.insert_many_immediate(vec![root.clone(), child]).await?;

    repository
        .cancel_event(&root, nanos_to_datetime(500), "user")
        .await?;
    wait_for_rows(&store, 3).await;

    let summary = repository
        .get_trace_summary(trace)
        .await?
        .expect("trace has a root");

    let root_span = summary.find(a).expect("root span");
    assert!(root_span.is_cancelled);
    assert!(!root_span.is_partial);
    assert_eq!(root_span.duration, 500);
    let cancellation = root_span
        .data
        .find_event(CANCELLATION_EVENT)
        .expect("cancellation event");
    assert_eq!(cancellation.properties, json!({"reason": "user"}));

    let child_span = summary.find(b).expect("child span");
    assert!(!child_span.is_partial);
    assert!(child_span.is_cancelled);
    assert_eq!(child_span.duration, 400);

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn batch_suppresses_partial_and_publishes_once() -> Result<()> {
    // A batch carrying both the partial and the completed row for one span
    // persists only the completed row and notifies the channel once.
    let (repository, store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();
    let span = SpanId::generate();

    let mut subscription = repository.subscribe_to_trace(trace).await?;

    let partial = partial_span(environment_id, trace, span, 0);
    let completed = SpanRecord::new(environment_id, "run_1", trace, span, "done")
        .with_start_time(0)
        .with_duration(1_000);
    repository.insert_many(vec![partial, completed])?;

    wait_for_rows(&store, 1).await;
    let rows = store.query(&SpanQuery::new().for_trace(trace)).await?;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].is_partial);
    assert_eq!(rows[0].duration, 1_000);

    let message = subscription.recv().await.expect("one notification");
    assert_eq!(message.channel, format!("events:{trace}:{span}"));

    // No second notification for the suppressed partial row.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(subscription.try_recv().is_none());

    subscription.unsubscribe();
    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn complete_event_supersedes_partial_at_query_time() -> Result<()> {
    let (repository, store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();
    let span = SpanId::generate();

    repository
        .insert_immediate(partial_span(environment_id, trace, span, 1_000))
        .await?;

    let completion = repository
        .complete_event(
            span,
            CompleteEventOptions {
                end_time: Some(nanos_to_datetime(5_000)),
                output: Some(json!({"result": {"ok": true}})),
                output_type: None,
            },
        )
        .await?;
    assert!(!completion.is_partial);
    assert_eq!(completion.duration, 4_000);
    // Output canonicalized to flattened attributes.
    assert_eq!(completion.output, json!({"result.ok": true}));

    wait_for_rows(&store, 2).await;
    let summary = repository.get_trace_summary(trace).await?.expect("summary");
    assert_eq!(summary.spans.len(), 1);
    assert!(!summary.spans[0].is_partial);
    assert_eq!(summary.spans[0].duration, 4_000);

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn complete_event_twice_has_single_effect() -> Result<()> {
    let (repository, store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();
    let span = SpanId::generate();

    repository
        .insert_immediate(partial_span(environment_id, trace, span, 0))
        .await?;

    repository
        .complete_event(
            span,
            CompleteEventOptions {
                end_time: Some(nanos_to_datetime(1_000)),
                ..CompleteEventOptions::default()
            },
        )
        .await?;
    wait_for_rows(&store, 2).await;

    // The span is no longer incomplete, so a second completion finds
    // nothing to supersede.
    let err = repository
        .complete_event(span, CompleteEventOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IncompleteSpanNotFound { .. }));

    let summary = repository.get_trace_summary(trace).await?.expect("summary");
    assert_eq!(summary.spans.len(), 1);
    assert_eq!(summary.spans[0].duration, 1_000);

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn preserved_output_types_skip_flattening() -> Result<()> {
    let (repository, _store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();
    let span = SpanId::generate();

    repository
        .insert_immediate(partial_span(environment_id, trace, span, 0))
        .await?;

    let completion = repository
        .complete_event(
            span,
            CompleteEventOptions {
                end_time: Some(nanos_to_datetime(100)),
                output: Some(json!({"nested": {"kept": true}})),
                output_type: Some("application/store".to_string()),
            },
        )
        .await?;
    assert_eq!(completion.output, json!({"nested": {"kept": true}}));
    assert_eq!(completion.output_type.as_deref(), Some("application/store"));

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_event_rejects_non_partial_rows() -> Result<()> {
    let (repository, _store, _broker) = harness();
    let completed = SpanRecord::new(
        EnvironmentId::generate(),
        "run_1",
        TraceId::generate(),
        SpanId::generate(),
        "done",
    );

    let err = repository
        .cancel_event(&completed, Utc::now(), "user")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotPartial { .. }));

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn crash_event_marks_error_with_exception() -> Result<()> {
    let (repository, store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();
    let span = SpanId::generate();

    let open = partial_span(environment_id, trace, span, 0);
    repository.insert_immediate(open.clone()).await?;

    let crashed = repository
        .crash_event(&open, nanos_to_datetime(2_000), "worker panicked", None)
        .await?;
    assert!(crashed.is_error);
    assert!(!crashed.is_partial);
    assert_eq!(crashed.duration, 2_000);
    let exception = crashed.find_event(EXCEPTION_EVENT).expect("exception event");
    assert_eq!(exception.properties["exception.message"], json!("worker panicked"));

    wait_for_rows(&store, 2).await;
    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn query_incomplete_skips_cancelled_and_completed() -> Result<()> {
    let (repository, _store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();

    let open = SpanId::generate();
    let done = SpanId::generate();
    let cancelled = SpanId::generate();

    let mut cancelled_row = partial_span(environment_id, trace, cancelled, 30);
    cancelled_row.is_cancelled = true;

    repository
        .insert_many_immediate(vec![
            partial_span(environment_id, trace, open, 10),
            partial_span(environment_id, trace, done, 20),
            SpanRecord::new(environment_id, "run_1", trace, done, "done").with_start_time(20),
            cancelled_row,
        ])
        .await?;

    let incomplete = repository
        .query_incomplete_events(&SpanQuery::new().for_trace(trace))
        .await?;
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].span_id, open);

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn subscriber_count_tracks_lifecycle() -> Result<()> {
    let (repository, _store, _broker) = harness();
    let trace = TraceId::generate();

    assert_eq!(repository.subscriber_count(), 0);
    let first = repository.subscribe_to_trace(trace).await?;
    let second = repository.subscribe_to_trace(trace).await?;
    assert_eq!(repository.subscriber_count(), 2);

    first.unsubscribe();
    assert_eq!(repository.subscriber_count(), 1);

    drop(second);
    assert_eq!(repository.subscriber_count(), 0);

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn immediate_inserts_notify_subscribers() -> Result<()> {
    let (repository, _store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();
    let span = SpanId::generate();

    let mut subscription = repository.subscribe_to_trace(trace).await?;
    repository
        .insert_immediate(partial_span(environment_id, trace, span, 0))
        .await?;

    let message = subscription.recv().await.expect("notification");
    assert_eq!(message.channel, format!("events:{trace}:{span}"));
    // Payload is an ISO-8601 timestamp.
    let payload = String::from_utf8(message.payload.to_vec()).unwrap();
    assert!(DateTime::parse_from_rfc3339(&payload).is_ok());

    subscription.unsubscribe();
    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn truncate_removes_only_expired_rows() -> Result<()> {
    let (repository, store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();

    let mut old = partial_span(environment_id, trace, SpanId::generate(), 0);
    old.created_at = Utc::now() - chrono::Duration::days(30);
    let fresh = partial_span(environment_id, trace, SpanId::generate(), 10);

    repository.insert_many_immediate(vec![old, fresh]).await?;

    let removed = repository.truncate_events().await?;
    assert_eq!(removed, 1);
    assert_eq!(store.len().unwrap(), 1);

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn get_span_returns_completed_winner() -> Result<()> {
    let (repository, _store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();
    let span = SpanId::generate();

    let mut completed = SpanRecord::new(environment_id, "run_1", trace, span, "done")
        .with_start_time(0)
        .with_duration(500);
    completed.properties = json!({"user.name": "ada", "$internal": true});

    repository
        .insert_many_immediate(vec![
            partial_span(environment_id, trace, span, 0),
            completed,
        ])
        .await?;

    let detail = repository.get_span(trace, span).await?.expect("span detail");
    assert!(!detail.record.is_partial);
    assert_eq!(detail.visible_properties, json!({"user.name": "ada"}));

    assert!(repository
        .get_span(trace, SpanId::generate())
        .await?
        .is_none());

    repository.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn scheduled_inserts_flush_on_interval() -> Result<()> {
    let (repository, store, _broker) = harness();
    let environment_id = EnvironmentId::generate();
    let trace = TraceId::generate();

    // Two rows, below batch_size: only the interval trigger can flush them.
    repository.insert(partial_span(environment_id, trace, SpanId::generate(), 0))?;
    repository.insert(partial_span(environment_id, trace, SpanId::generate(), 10))?;

    wait_for_rows(&store, 2).await;
    repository.shutdown().await;
    Ok(())
}
