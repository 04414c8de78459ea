//! Ingest upsert and routing tests.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use strand_core::{EnvironmentId, ProjectId};
use strand_pipeline::error::{Error, Result};
use strand_pipeline::ingest::{EventIngest, IngestConfig};
use strand_pipeline::queue::{job_names, InMemoryWorkerQueue, WorkerQueue};
use strand_pipeline::record::{
    PipelineStep, Queue, RawEvent, RuntimeEnvironment, SendEventOptions,
};
use strand_pipeline::store::{InMemoryPipelineStore, PipelineStore};

fn harness() -> (
    Arc<InMemoryPipelineStore>,
    Arc<InMemoryWorkerQueue>,
    EventIngest,
    RuntimeEnvironment,
) {
    let store = Arc::new(InMemoryPipelineStore::new());
    let queue = Arc::new(InMemoryWorkerQueue::new("worker"));
    let ingest = EventIngest::new(
        Arc::clone(&store) as Arc<dyn PipelineStore>,
        queue.clone(),
        IngestConfig::default(),
    );
    let environment = RuntimeEnvironment {
        id: EnvironmentId::generate(),
        project_id: ProjectId::generate(),
    };
    (store, queue, ingest, environment)
}

#[tokio::test]
async fn send_creates_record_and_enqueues_delivery() -> Result<()> {
    let (_store, queue, ingest, environment) = harness();

    let record = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({"foo": "ok"})),
            SendEventOptions::default(),
            None,
            Some("webapp"),
        )
        .await?;

    assert_eq!(record.event_id, "e1");
    assert_eq!(record.source, "webapp");
    assert!(record.queue_id.is_none());

    let entry = queue.take()?.expect("delivery job");
    assert_eq!(entry.job.name, job_names::DELIVER_EVENT);
    assert_eq!(entry.options.run_at, Some(record.deliver_at));
    assert_eq!(
        entry.options.job_key.as_deref(),
        Some(format!("event:{}", record.id).as_str())
    );
    Ok(())
}

#[tokio::test]
async fn send_routes_stepped_queue_to_pipeline() -> Result<()> {
    let (store, queue, ingest, environment) = harness();
    let orders = store
        .create_queue(Queue::new(
            environment.project_id,
            "orders",
            vec![PipelineStep::filter("only-ok", json!({"foo": ["ok"]}))],
        ))
        .await?;

    let record = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({"foo": "ok"})),
            SendEventOptions {
                queue_slug: Some("orders".into()),
                ..SendEventOptions::default()
            },
            None,
            None,
        )
        .await?;

    assert_eq!(record.queue_id, Some(orders.id));

    let entry = queue.take()?.expect("pipeline job");
    assert_eq!(entry.job.name, job_names::CREATE_PIPELINE);
    assert_eq!(entry.job.payload["queueId"], json!(orders.id));
    assert_eq!(entry.job.payload["eventRecordId"], json!(record.id));

    // No delivery job: the pipeline owns the event now.
    assert!(queue.take()?.is_none());
    Ok(())
}

#[tokio::test]
async fn send_routes_stepless_queue_to_delivery() -> Result<()> {
    let (store, queue, ingest, environment) = harness();
    store
        .create_queue(Queue::new(environment.project_id, "plain", Vec::new()))
        .await?;

    ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({})),
            SendEventOptions {
                queue_slug: Some("plain".into()),
                ..SendEventOptions::default()
            },
            None,
            None,
        )
        .await?;

    let entry = queue.take()?.expect("delivery job");
    assert_eq!(entry.job.name, job_names::DELIVER_EVENT);
    Ok(())
}

#[tokio::test]
async fn missing_queue_slug_fails() -> Result<()> {
    let (_store, _queue, ingest, environment) = harness();

    let err = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({})),
            SendEventOptions {
                queue_slug: Some("nonexistent".into()),
                ..SendEventOptions::default()
            },
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingEntity { .. }));
    Ok(())
}

#[tokio::test]
async fn resend_within_update_window_updates_payload() -> Result<()> {
    // Scenario: deliver in 60s, resend immediately with a new payload. The
    // scheduled delivery is far enough out, so the row updates.
    let (store, _queue, ingest, environment) = harness();
    let deliver_at = Utc::now() + Duration::seconds(60);

    let first = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({"v": 1})),
            SendEventOptions {
                deliver_at: Some(deliver_at),
                ..SendEventOptions::default()
            },
            None,
            None,
        )
        .await?;

    let second = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({"v": 2})),
            SendEventOptions {
                deliver_at: Some(deliver_at),
                ..SendEventOptions::default()
            },
            None,
            None,
        )
        .await?;

    assert_eq!(second.id, first.id);
    assert_eq!(second.payload, json!({"v": 2}));

    let stored = store.get_event(first.id).await?.unwrap();
    assert_eq!(stored.payload, json!({"v": 2}));
    Ok(())
}

#[tokio::test]
async fn resend_past_update_window_returns_existing_unchanged() -> Result<()> {
    // Immediate delivery: the update window has already closed when the
    // resend arrives, so the original row is final.
    let (store, _queue, ingest, environment) = harness();

    let first = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({"v": 1})),
            SendEventOptions::default(),
            None,
            None,
        )
        .await?;

    let second = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({"v": 2})),
            SendEventOptions::default(),
            None,
            None,
        )
        .await?;

    assert_eq!(second.id, first.id);
    assert_eq!(second.payload, json!({"v": 1}));

    let stored = store.get_event(first.id).await?.unwrap();
    assert_eq!(stored.payload, json!({"v": 1}));
    Ok(())
}

#[tokio::test]
async fn same_event_id_in_other_environment_is_distinct() -> Result<()> {
    let (_store, _queue, ingest, environment) = harness();
    let other = RuntimeEnvironment {
        id: EnvironmentId::generate(),
        project_id: environment.project_id,
    };

    let a = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({})),
            SendEventOptions::default(),
            None,
            None,
        )
        .await?;
    let b = ingest
        .send(
            &other,
            RawEvent::new("e1", "order.created", json!({})),
            SendEventOptions::default(),
            None,
            None,
        )
        .await?;

    assert_ne!(a.id, b.id);
    Ok(())
}

#[tokio::test]
async fn account_id_upserts_external_account() -> Result<()> {
    let (store, _queue, ingest, environment) = harness();

    let first = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({})),
            SendEventOptions {
                account_id: Some("cust_42".into()),
                deliver_at: Some(Utc::now() + Duration::seconds(60)),
                ..SendEventOptions::default()
            },
            None,
            None,
        )
        .await?;
    assert!(first.external_account_id.is_some());

    // A different event for the same account reuses the upserted row.
    let second = ingest
        .send(
            &environment,
            RawEvent::new("e2", "order.created", json!({})),
            SendEventOptions {
                account_id: Some("cust_42".into()),
                ..SendEventOptions::default()
            },
            None,
            None,
        )
        .await?;
    assert_eq!(first.external_account_id, second.external_account_id);

    let account = store
        .upsert_external_account(environment.id, "cust_42")
        .await?;
    assert_eq!(Some(account.id), first.external_account_id);
    Ok(())
}

#[tokio::test]
async fn delivery_disabled_skips_delivery_job() -> Result<()> {
    let store = Arc::new(InMemoryPipelineStore::new());
    let queue = Arc::new(InMemoryWorkerQueue::new("worker"));
    let ingest = EventIngest::new(
        Arc::clone(&store) as Arc<dyn PipelineStore>,
        queue.clone(),
        IngestConfig {
            delivery_enabled: false,
        },
    );
    let environment = RuntimeEnvironment {
        id: EnvironmentId::generate(),
        project_id: ProjectId::generate(),
    };

    ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({})),
            SendEventOptions::default(),
            None,
            None,
        )
        .await?;

    assert_eq!(queue.queue_depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn deliver_after_advances_deliver_at() -> Result<()> {
    let (_store, _queue, ingest, environment) = harness();
    let before = Utc::now();

    let record = ingest
        .send(
            &environment,
            RawEvent::new("e1", "order.created", json!({})),
            SendEventOptions {
                deliver_after: Some(30),
                ..SendEventOptions::default()
            },
            None,
            None,
        )
        .await?;

    assert!(record.deliver_at >= before + Duration::seconds(30));
    assert!(record.deliver_at <= Utc::now() + Duration::seconds(31));
    Ok(())
}
