use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cv_agents::assignment::GuardedClaim;
use cv_agents::registry::AgentRegistry;
use cv_core::db::CoordDb;
use cv_core::error::{CoordError, Precondition};
use cv_core::task_store::TaskStore;
use cv_core::types::*;
use uuid::Uuid;

fn caps(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|c| c.to_string()).collect()
}

async fn fixture() -> (AgentRegistry, TaskStore, GuardedClaim) {
    let db = Arc::new(CoordDb::open_in_memory("test").await.unwrap());
    let registry = AgentRegistry::new(db.clone(), Duration::from_secs(300));
    let tasks = TaskStore::new(db);
    let claims = GuardedClaim::new(registry.clone(), tasks.clone());
    (registry, tasks, claims)
}

#[tokio::test]
async fn capability_mismatch_is_refused_above_the_store() {
    let (registry, tasks, claims) = fixture().await;
    let a = registry.register("A", caps(&["go"])).await.unwrap();
    let b = registry.register("B", caps(&["ts"])).await.unwrap();
    tasks.create(NewTask::new("T1", "s").requires(["go"])).await.unwrap();
    tasks.create(NewTask::new("T2", "s").requires(["go"])).await.unwrap();

    let err = claims.claim("T1", b.id).await.unwrap_err();
    match err {
        CoordError::Precondition(Precondition::CapabilityMismatch { missing, .. }) => {
            assert_eq!(missing, vec!["go".to_string()]);
        }
        other => panic!("expected capability mismatch, got {other:?}"),
    }
    assert_eq!(tasks.get("T1").await.unwrap().status, TaskStatus::Todo);

    let won = claims.claim("T1", a.id).await.unwrap();
    assert_eq!(won.claimed_by, Some(a.id));

    // The store itself has no capability concept.
    let raw = tasks.claim("T2", b.id).await.unwrap();
    assert_eq!(raw.claimed_by, Some(b.id));
}

#[tokio::test]
async fn incomplete_dependencies_block_the_claim() {
    let (registry, tasks, claims) = fixture().await;
    let a = registry.register("A", caps(&[])).await.unwrap();
    tasks.create(NewTask::new("T1", "s")).await.unwrap();
    tasks
        .create(NewTask::new("T2", "s").depends_on(["T1"]))
        .await
        .unwrap();

    let err = claims.claim("T2", a.id).await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::Precondition(Precondition::DependenciesIncomplete { ref pending, .. })
            if pending == &vec!["T1".to_string()]
    ));

    claims.claim("T1", a.id).await.unwrap();
    tasks.complete("T1", a.id).await.unwrap();
    claims.claim("T2", a.id).await.unwrap();
}

#[tokio::test]
async fn idle_and_unknown_agents_cannot_claim() {
    let (registry, tasks, claims) = fixture().await;
    let a = registry.register("A", caps(&[])).await.unwrap();
    registry.heartbeat(a.id, Some(AgentStatus::Idle)).await.unwrap();
    tasks.create(NewTask::new("T1", "s")).await.unwrap();

    let err = claims.claim("T1", a.id).await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::Precondition(Precondition::AgentNotActive(_))
    ));

    let err = claims.claim("T1", Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, CoordError::NotFound { entity: "agent", .. }));
}

#[tokio::test]
async fn lost_race_is_still_a_conflict() {
    let (registry, tasks, claims) = fixture().await;
    let a = registry.register("A", caps(&[])).await.unwrap();
    let b = registry.register("B", caps(&[])).await.unwrap();
    tasks.create(NewTask::new("T1", "s")).await.unwrap();

    claims.claim("T1", a.id).await.unwrap();
    assert!(claims.claim("T1", b.id).await.unwrap_err().is_conflict());
}
