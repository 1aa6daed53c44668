use std::sync::Arc;
use std::time::Duration;

use cv_agents::consumer::{EventConsumer, IngestOutcome, StoreApplier};
use cv_agents::escalation::EscalationManager;
use cv_agents::registry::AgentRegistry;
use cv_core::db::CoordDb;
use cv_core::dlq::{DeadLetterQueue, DlqFilter, RetryOutcome};
use cv_core::events::RawEvent;
use cv_core::task_store::TaskStore;
use cv_core::types::*;
use serde_json::json;
use uuid::Uuid;

struct Fixture {
    tasks: TaskStore,
    dlq: DeadLetterQueue,
    consumer: EventConsumer,
}

async fn fixture() -> Fixture {
    let db = Arc::new(CoordDb::open_in_memory("test").await.unwrap());
    let tasks = TaskStore::new(db.clone());
    let registry = AgentRegistry::new(db.clone(), Duration::from_secs(300));
    let escalations = EscalationManager::new(db.clone());
    let dlq = DeadLetterQueue::new(db, 5);
    let applier = Arc::new(StoreApplier::new(tasks.clone(), registry, escalations));
    Fixture {
        tasks,
        dlq: dlq.clone(),
        consumer: EventConsumer::new(applier, dlq),
    }
}

fn registered(agent_id: Uuid) -> RawEvent {
    RawEvent::new(
        "agent.registered",
        json!({ "agent_id": agent_id, "name": "w1", "capabilities": ["go"] }),
    )
}

#[tokio::test]
async fn well_formed_events_are_applied() {
    let f = fixture().await;
    let agent_id = Uuid::new_v4();
    let created = RawEvent::new(
        "task.created",
        json!({ "task": { "id": "T1", "sprint_id": "s", "required_capabilities": ["go"] } }),
    );
    let claimed = RawEvent::new("task.claimed", json!({ "task_id": "T1", "agent_id": agent_id }));

    for raw in [registered(agent_id), created, claimed] {
        assert_eq!(f.consumer.ingest(raw).await.unwrap(), IngestOutcome::Applied);
    }
    let t1 = f.tasks.get("T1").await.unwrap();
    assert_eq!(t1.status, TaskStatus::Claimed);
    assert_eq!(t1.claimed_by, Some(agent_id));
    assert!(f.dlq.list(DlqFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_and_malformed_events_are_dead_lettered() {
    let f = fixture().await;
    let unknown = RawEvent::new("task.teleported", json!({ "task_id": "T1" }));
    let malformed = RawEvent::new("task.claimed", json!({ "task_id": 7 }));

    for raw in [unknown.clone(), malformed.clone()] {
        let outcome = f.consumer.ingest(raw).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::DeadLettered { .. }));
    }
    let entries = f.dlq.list(DlqFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.original_event == unknown));
    assert!(entries.iter().any(|e| e.original_event == malformed));
    assert!(entries.iter().all(|e| e.status == DlqStatus::Pending));
}

#[tokio::test]
async fn derived_events_are_not_applicable() {
    let f = fixture().await;
    let raw = RawEvent::new("sprint.completed", json!({ "sprint_id": "s" }));
    match f.consumer.ingest(raw).await.unwrap() {
        IngestOutcome::DeadLettered { reason, .. } => assert!(reason.contains("sprint.completed")),
        other => panic!("expected dead letter, got {other:?}"),
    }
}

#[tokio::test]
async fn claim_on_unknown_task_resolves_once_the_task_exists() {
    let f = fixture().await;
    let agent_id = Uuid::new_v4();
    f.consumer.ingest(registered(agent_id)).await.unwrap();

    let claimed = RawEvent::new("task.claimed", json!({ "task_id": "T9", "agent_id": agent_id }));
    let IngestOutcome::DeadLettered { entry_id, reason } = f.consumer.ingest(claimed).await.unwrap()
    else {
        panic!("claim on a missing task must be dead-lettered");
    };
    assert!(reason.contains("not found"));

    let reports = f.dlq.retry_all(DlqFilter::pending(), f.consumer.applier()).await.unwrap();
    assert!(matches!(reports[0].outcome, RetryOutcome::Failed { .. }));
    assert_eq!(f.dlq.get(entry_id).await.unwrap().retry_count, 1);

    f.tasks.create(NewTask::new("T9", "s")).await.unwrap();
    let reports = f.dlq.retry_all(DlqFilter::pending(), f.consumer.applier()).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, RetryOutcome::Resolved);
    assert_eq!(f.dlq.get(entry_id).await.unwrap().status, DlqStatus::Resolved);
    assert_eq!(f.tasks.get("T9").await.unwrap().claimed_by, Some(agent_id));
}
