use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cv_agents::escalation::{EscalationFilter, EscalationManager};
use cv_agents::executor::{ExecutionOutcome, TaskExecutor};
use cv_agents::registry::{AgentFilter, AgentRegistry};
use cv_agents::worker::{WorkerAgent, WorkerConfig, WorkerMode};
use cv_core::db::CoordDb;
use cv_core::event_log::EventLog;
use cv_core::task_store::TaskStore;
use cv_core::types::*;
use cv_harness::shutdown::ShutdownSignal;

struct PassAll {
    runs: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for PassAll {
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ExecutionOutcome::Succeeded {
            results: task
                .acceptance_criteria
                .iter()
                .map(|c| VerificationResult {
                    criterion: c.clone(),
                    passed: true,
                    detail: "ok".into(),
                })
                .collect(),
        }
    }
}

struct AlwaysFail;

#[async_trait]
impl TaskExecutor for AlwaysFail {
    async fn execute(&self, _task: &Task) -> ExecutionOutcome {
        ExecutionOutcome::Failed {
            reason: "build broke".into(),
        }
    }
}

struct FailOnce {
    runs: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for FailOnce {
    async fn execute(&self, _task: &Task) -> ExecutionOutcome {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            ExecutionOutcome::Failed {
                reason: "needs a decision".into(),
            }
        } else {
            ExecutionOutcome::Succeeded { results: vec![] }
        }
    }
}

struct Hang;

#[async_trait]
impl TaskExecutor for Hang {
    async fn execute(&self, _task: &Task) -> ExecutionOutcome {
        tokio::time::sleep(Duration::from_secs(60)).await;
        ExecutionOutcome::GaveUp {
            reason: "unreachable".into(),
        }
    }
}

struct Fixture {
    db: Arc<CoordDb>,
    registry: AgentRegistry,
    tasks: TaskStore,
    escalations: EscalationManager,
}

async fn fixture() -> Fixture {
    let db = Arc::new(CoordDb::open_in_memory("test").await.unwrap());
    Fixture {
        registry: AgentRegistry::new(db.clone(), Duration::from_secs(300)),
        tasks: TaskStore::new(db.clone()),
        escalations: EscalationManager::new(db.clone()),
        db,
    }
}

fn config(name: &str, caps: &[&str], mode: WorkerMode) -> WorkerConfig {
    let mut config = WorkerConfig::new(name, caps.iter().map(|c| c.to_string()));
    config.mode = mode;
    config.poll_interval = Duration::from_millis(10);
    config.heartbeat_interval = Duration::from_millis(20);
    config
}

fn worker(
    f: &Fixture,
    config: WorkerConfig,
    executor: Arc<dyn TaskExecutor>,
    shutdown: ShutdownSignal,
) -> WorkerAgent {
    WorkerAgent::new(
        config,
        f.registry.clone(),
        f.tasks.clone(),
        f.escalations.clone(),
        EventLog::new(f.db.clone()),
        executor,
        shutdown,
    )
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn peer_swarm_worker_completes_tasks_in_dependency_order() {
    let f = fixture().await;
    f.tasks
        .create(NewTask::new("T2", "s").depends_on(["T1"]).with_criteria(["tests pass"]))
        .await
        .unwrap();
    f.tasks.create(NewTask::new("T1", "s")).await.unwrap();
    f.tasks
        .create(NewTask::new("T3", "s").requires(["ts"]))
        .await
        .unwrap();

    let mut cfg = config("w1", &["go"], WorkerMode::PeerSwarm);
    cfg.max_idle_polls = Some(3);
    let executor = Arc::new(PassAll {
        runs: AtomicUsize::new(0),
    });
    let report = worker(&f, cfg, executor.clone(), ShutdownSignal::new())
        .run()
        .await
        .unwrap();

    assert_eq!(report.completed, vec!["T1".to_string(), "T2".to_string()]);
    assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
    assert_eq!(f.tasks.get("T3").await.unwrap().status, TaskStatus::Todo);
    let t2 = f.tasks.get("T2").await.unwrap();
    assert_eq!(t2.completed_by, report.agent_id);
    assert!(f.registry.list(AgentFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_execution_blocks_and_escalates() {
    let f = fixture().await;
    f.tasks.create(NewTask::new("T1", "s")).await.unwrap();

    let mut cfg = config("w1", &[], WorkerMode::PeerSwarm);
    cfg.max_idle_polls = Some(2);
    let report = worker(&f, cfg, Arc::new(AlwaysFail), ShutdownSignal::new())
        .run()
        .await
        .unwrap();

    assert_eq!(report.blocked, vec!["T1".to_string()]);
    let t1 = f.tasks.get("T1").await.unwrap();
    assert_eq!(t1.status, TaskStatus::Blocked);
    assert_eq!(t1.block_reason.as_deref(), Some("build broke"));

    let open = f.escalations.list(EscalationFilter::open()).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].severity, Severity::High);
    assert_eq!(open[0].task_id, "T1");
}

#[tokio::test]
async fn supervised_worker_only_runs_offered_tasks() {
    let f = fixture().await;
    f.tasks.create(NewTask::new("T1", "s")).await.unwrap();
    f.tasks.create(NewTask::new("T2", "s")).await.unwrap();

    let shutdown = ShutdownSignal::new();
    let executor = Arc::new(PassAll {
        runs: AtomicUsize::new(0),
    });
    let handle = tokio::spawn(
        worker(
            &f,
            config("w1", &[], WorkerMode::Supervised),
            executor.clone(),
            shutdown.clone(),
        )
        .run(),
    );

    let registry = f.registry.clone();
    wait_for(|| {
        let registry = registry.clone();
        async move { !registry.list(AgentFilter::default()).await.unwrap().is_empty() }
    })
    .await;
    let agent = f.registry.list(AgentFilter::default()).await.unwrap().remove(0);
    f.registry.record_offer("T2", agent.id).await.unwrap();

    let tasks = f.tasks.clone();
    wait_for(|| {
        let tasks = tasks.clone();
        async move { tasks.get("T2").await.unwrap().is_complete() }
    })
    .await;
    shutdown.shutdown();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.completed, vec!["T2".to_string()]);
    assert_eq!(f.tasks.get("T1").await.unwrap().status, TaskStatus::Todo);
}

#[tokio::test]
async fn shutdown_mid_task_releases_it() {
    let f = fixture().await;
    f.tasks.create(NewTask::new("T1", "s")).await.unwrap();

    let shutdown = ShutdownSignal::new();
    let handle = tokio::spawn(
        worker(
            &f,
            config("w1", &[], WorkerMode::PeerSwarm),
            Arc::new(Hang),
            shutdown.clone(),
        )
        .run(),
    );

    let tasks = f.tasks.clone();
    wait_for(|| {
        let tasks = tasks.clone();
        async move { tasks.get("T1").await.unwrap().status == TaskStatus::InProgress }
    })
    .await;
    shutdown.shutdown();
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(report.released, vec!["T1".to_string()]);
    let t1 = f.tasks.get("T1").await.unwrap();
    assert_eq!(t1.status, TaskStatus::Todo);
    assert!(t1.claimed_by.is_none());
}

#[tokio::test]
async fn resolved_escalation_lets_the_owner_resume() {
    let f = fixture().await;
    f.tasks.create(NewTask::new("T1", "s")).await.unwrap();

    let shutdown = ShutdownSignal::new();
    let handle = tokio::spawn(
        worker(
            &f,
            config("w1", &[], WorkerMode::PeerSwarm),
            Arc::new(FailOnce {
                runs: AtomicUsize::new(0),
            }),
            shutdown.clone(),
        )
        .run(),
    );

    let escalations = f.escalations.clone();
    wait_for(|| {
        let escalations = escalations.clone();
        async move { !escalations.list(EscalationFilter::open()).await.unwrap().is_empty() }
    })
    .await;
    assert_eq!(f.tasks.get("T1").await.unwrap().status, TaskStatus::Blocked);
    let open = f.escalations.list(EscalationFilter::open()).await.unwrap();
    f.escalations.resolve(open[0].id, "retry it").await.unwrap();

    let tasks = f.tasks.clone();
    wait_for(|| {
        let tasks = tasks.clone();
        async move { tasks.get("T1").await.unwrap().is_complete() }
    })
    .await;
    shutdown.shutdown();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.blocked, vec!["T1".to_string()]);
    assert_eq!(report.completed, vec!["T1".to_string()]);
}
