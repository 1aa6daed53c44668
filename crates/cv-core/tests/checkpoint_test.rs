use std::sync::Arc;

use cv_core::checkpoint::{CheckpointFilter, CheckpointManager};
use cv_core::db::CoordDb;
use cv_core::event_log::EventLog;
use cv_core::events::Event;
use cv_core::projection::{Projection, TaskView};
use cv_core::task_store::{TaskFilter, TaskStore};
use cv_core::types::*;
use uuid::Uuid;

struct Fixture {
    tasks: TaskStore,
    checkpoints: CheckpointManager,
    log: EventLog,
}

async fn fixture() -> Fixture {
    let db = Arc::new(CoordDb::open_in_memory("test").await.unwrap());
    Fixture {
        tasks: TaskStore::new(db.clone()),
        checkpoints: CheckpointManager::new(db.clone()),
        log: EventLog::new(db),
    }
}

async fn live_views(tasks: &TaskStore) -> Vec<TaskView> {
    let mut views = Vec::new();
    for task in tasks.list(TaskFilter::default()).await.unwrap() {
        let verifications = tasks.verify(&task.id).await.unwrap();
        views.push(TaskView::from_live(&task, verifications));
    }
    views.sort_by(|a, b| a.id.cmp(&b.id));
    views
}

#[tokio::test]
async fn checkpoint_captures_head_before_its_own_event() {
    let f = fixture().await;
    f.tasks.create(NewTask::new("T1", "s1")).await.unwrap();
    let head = f.log.head().await.unwrap();

    let cp = f
        .checkpoints
        .create(NewCheckpoint {
            task_id: Some("T1".into()),
            commit_ref: "abc123".into(),
            modified_files: vec!["src/lib.rs".into()],
            message: "wip".into(),
            ..NewCheckpoint::default()
        })
        .await
        .unwrap();
    assert_eq!(cp.event_cursor, head);

    let latest = f.log.read_from(head, 10).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert!(matches!(
        latest[0].event,
        Event::CheckpointCreated { checkpoint_id, .. } if checkpoint_id == cp.id
    ));

    let fetched = f.checkpoints.get(cp.id).await.unwrap();
    assert_eq!(fetched, cp);
}

#[tokio::test]
async fn list_and_latest_filters() {
    let f = fixture().await;
    let first = f
        .checkpoints
        .create(NewCheckpoint {
            sprint_id: Some("s1".into()),
            message: "first".into(),
            ..NewCheckpoint::default()
        })
        .await
        .unwrap();
    f.checkpoints
        .create(NewCheckpoint {
            task_id: Some("T1".into()),
            sprint_id: Some("s1".into()),
            message: "task level".into(),
            ..NewCheckpoint::default()
        })
        .await
        .unwrap();
    let second = f
        .checkpoints
        .create(NewCheckpoint {
            sprint_id: Some("s1".into()),
            message: "second".into(),
            ..NewCheckpoint::default()
        })
        .await
        .unwrap();

    let all = f.checkpoints.list(CheckpointFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let orchestrator = f
        .checkpoints
        .list(CheckpointFilter::orchestrator("s1"))
        .await
        .unwrap();
    assert_eq!(orchestrator.len(), 2);
    assert_eq!(orchestrator[0].id, second.id);
    assert_eq!(orchestrator[1].id, first.id);

    let latest = f
        .checkpoints
        .latest(CheckpointFilter::orchestrator("s1"))
        .await
        .unwrap();
    assert_eq!(latest.map(|c| c.id), Some(second.id));

    assert!(f
        .checkpoints
        .latest(CheckpointFilter::orchestrator("other"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unknown_checkpoint_is_not_found() {
    let f = fixture().await;
    let err = f.checkpoints.get(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, cv_core::CoordError::NotFound { .. }));
}

#[tokio::test]
async fn prune_keeps_recent_checkpoints() {
    let f = fixture().await;
    f.checkpoints.create(NewCheckpoint::default()).await.unwrap();
    assert_eq!(f.checkpoints.prune(30).await.unwrap(), 0);
    assert_eq!(f.checkpoints.list(CheckpointFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn replay_to_checkpoint_cursor_reproduces_live_state() {
    let f = fixture().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    f.tasks
        .create(NewTask::new("T1", "s1").with_criteria(["tests"]))
        .await
        .unwrap();
    f.tasks
        .create(NewTask::new("T2", "s1").depends_on(["T1"]))
        .await
        .unwrap();
    f.tasks.create(NewTask::new("T3", "s1")).await.unwrap();

    f.tasks.claim("T1", a).await.unwrap();
    f.tasks.mark_in_progress("T1", a).await.unwrap();
    f.tasks.record_verification("T1", "tests", true, "ok").await.unwrap();
    f.tasks.complete("T1", a).await.unwrap();
    f.tasks.claim("T2", b).await.unwrap();
    f.tasks.block("T2", b, "waiting on review").await.unwrap();
    f.tasks.claim("T3", a).await.unwrap();
    f.tasks.release("T3", a).await.unwrap();

    let snapshot = live_views(&f.tasks).await;
    let cp = f
        .checkpoints
        .create(NewCheckpoint {
            sprint_id: Some("s1".into()),
            ..NewCheckpoint::default()
        })
        .await
        .unwrap();

    // Later writes must not leak into the replay.
    f.tasks.claim("T3", b).await.unwrap();
    f.tasks.mark_in_progress("T2", b).await.unwrap();

    let records = f.log.read_range(0, cp.event_cursor).await.unwrap();
    let projection = Projection::replay(&records);
    assert_eq!(projection.cursor, cp.event_cursor);
    let replayed: Vec<TaskView> = projection.tasks.into_values().collect();
    assert_eq!(replayed, snapshot);

    // Replaying the full log matches the current state.
    let head = f.log.head().await.unwrap();
    let all = f.log.read_range(0, head).await.unwrap();
    let now: Vec<TaskView> = Projection::replay(&all).tasks.into_values().collect();
    assert_eq!(now, live_views(&f.tasks).await);
}
