use std::sync::Arc;

use cv_agents::escalation::{EscalationFilter, EscalationManager};
use cv_core::db::CoordDb;
use cv_core::error::{CoordError, Precondition};
use cv_core::event_log::EventLog;
use cv_core::events::Event;
use cv_core::task_store::TaskStore;
use cv_core::types::*;
use uuid::Uuid;

async fn fixture() -> (EventLog, EscalationManager) {
    let db = Arc::new(CoordDb::open_in_memory("test").await.unwrap());
    let tasks = TaskStore::new(db.clone());
    tasks.create(NewTask::new("T1", "s")).await.unwrap();
    tasks.create(NewTask::new("T2", "s")).await.unwrap();
    (EventLog::new(db.clone()), EscalationManager::new(db))
}

#[tokio::test]
async fn critical_escalation_emits_a_distinct_event() {
    let (log, escalations) = fixture().await;
    let head = log.head().await.unwrap();
    let e = escalations
        .create("T1", "prod is down", Severity::Critical)
        .await
        .unwrap();
    assert_eq!(e.status, EscalationStatus::Open);

    let events = log.read_from(head, 10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0].event,
        Event::EscalationCreated { escalation_id, severity: Severity::Critical, .. } if *escalation_id == e.id
    ));
    assert!(matches!(
        &events[1].event,
        Event::EscalationCritical { escalation_id, .. } if *escalation_id == e.id
    ));
}

#[tokio::test]
async fn non_critical_escalation_emits_only_created() {
    let (log, escalations) = fixture().await;
    let head = log.head().await.unwrap();
    escalations.create("T1", "flaky", Severity::Medium).await.unwrap();
    let types: Vec<_> = log
        .read_from(head, 10)
        .await
        .unwrap()
        .iter()
        .map(|r| r.event.event_type())
        .collect();
    assert_eq!(types, vec!["escalation.created"]);
}

#[tokio::test]
async fn resolve_is_terminal() {
    let (log, escalations) = fixture().await;
    let e = escalations.create("T1", "stuck", Severity::High).await.unwrap();

    let resolved = escalations.resolve(e.id, "use the v2 API").await.unwrap();
    assert_eq!(resolved.status, EscalationStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
    let head = log.head().await.unwrap();

    let err = escalations.resolve(e.id, "something else").await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::Precondition(Precondition::AlreadyResolved(_))
    ));
    let stored = escalations.get(e.id).await.unwrap();
    assert_eq!(stored.resolution.as_deref(), Some("use the v2 API"));
    assert_eq!(log.head().await.unwrap(), head);
}

#[tokio::test]
async fn list_filters_by_status_severity_and_task() {
    let (_, escalations) = fixture().await;
    let a = escalations.create("T1", "a", Severity::High).await.unwrap();
    escalations.create("T1", "b", Severity::Low).await.unwrap();
    escalations.create("T2", "c", Severity::High).await.unwrap();
    escalations.resolve(a.id, "done").await.unwrap();

    assert_eq!(escalations.list(EscalationFilter::default()).await.unwrap().len(), 3);
    assert_eq!(escalations.list(EscalationFilter::open()).await.unwrap().len(), 2);

    let high_open = escalations
        .list(EscalationFilter {
            severity: Some(Severity::High),
            ..EscalationFilter::open()
        })
        .await
        .unwrap();
    assert_eq!(high_open.len(), 1);
    assert_eq!(high_open[0].task_id, "T2");

    let t1 = escalations
        .list(EscalationFilter {
            task_id: Some("T1".into()),
            ..EscalationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(t1.len(), 2);
}

#[tokio::test]
async fn escalation_requires_a_known_task() {
    let (_, escalations) = fixture().await;
    let err = escalations
        .create("missing", "?", Severity::Low)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::NotFound { entity: "task", .. }));

    let err = escalations.resolve(Uuid::new_v4(), "x").await.unwrap_err();
    assert!(matches!(err, CoordError::NotFound { entity: "escalation", .. }));
}
