use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use cv_bridge::event_bus::EventBus;
use cv_bridge::notifications::{
    spawn_dispatch_loop, NotificationDispatcher, ReqwestTransport,
};
use cv_core::db::CoordDb;
use cv_core::events::{Event, EventRecord};
use cv_core::types::{HookKind, NotificationHook};
use cv_harness::retry::RetryPolicy;
use serde_json::Value;

/// Local webhook receiver that fails the first `fail_first` requests with 503.
#[derive(Clone, Default)]
struct Receiver {
    received: Arc<Mutex<Vec<Value>>>,
    calls: Arc<AtomicUsize>,
    fail_first: usize,
}

async fn receive(State(rx): State<Receiver>, Json(body): Json<Value>) -> StatusCode {
    let n = rx.calls.fetch_add(1, Ordering::SeqCst);
    if n < rx.fail_first {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    rx.received.lock().unwrap().push(body);
    StatusCode::OK
}

async fn receiver_fail_none() -> StatusCode {
    StatusCode::OK
}

async fn always_bad_request() -> StatusCode {
    StatusCode::BAD_REQUEST
}

async fn serve(receiver: Receiver) -> String {
    let app = Router::new()
        .route("/hook", post(receive))
        .route("/ok", post(receiver_fail_none))
        .route("/bad", post(always_bad_request))
        .with_state(receiver);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn hook(id: &str, url: String, filter: &[&str]) -> NotificationHook {
    NotificationHook {
        id: id.into(),
        kind: HookKind::Webhook,
        url,
        event_filter: filter.iter().map(|s| s.to_string()).collect(),
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        multiplier: 2.0,
        max_backoff: Duration::from_millis(50),
    }
}

fn record(cursor: u64, event: Event) -> EventRecord {
    EventRecord {
        cursor,
        project_id: "test".into(),
        timestamp: chrono::Utc::now(),
        event,
    }
}

async fn dispatcher(hooks: Vec<NotificationHook>, retry: RetryPolicy) -> Arc<NotificationDispatcher> {
    let db = Arc::new(CoordDb::open_in_memory("test").await.unwrap());
    Arc::new(NotificationDispatcher::new(
        db,
        hooks,
        Arc::new(ReqwestTransport::new().unwrap()),
        retry,
    ))
}

#[tokio::test]
async fn delivers_envelope_to_matching_hooks_only() {
    let receiver = Receiver::default();
    let base = serve(receiver.clone()).await;
    let dispatcher = dispatcher(
        vec![
            hook("sprints", format!("{base}/hook"), &["sprint.*"]),
            hook("tasks", format!("{base}/hook"), &["task.claimed"]),
        ],
        fast_retry(1),
    )
    .await;

    let handles = dispatcher.dispatch(&record(
        7,
        Event::SprintCompleted {
            sprint_id: "E1".into(),
        },
    ));
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.await.unwrap();
    }

    let received = receiver.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let body = &received[0];
    assert_eq!(body["event_type"], "sprint.completed");
    assert_eq!(body["project_id"], "test");
    assert_eq!(body["payload"]["sprint_id"], "E1");
    assert!(body["text"].as_str().unwrap().contains("E1"));

    let history = dispatcher.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].hook_id, "sprints");
    assert_eq!(history[0].event_cursor, Some(7));
    assert!(history[0].success);
    assert_eq!(history[0].status_code, Some(200));
}

#[tokio::test]
async fn transient_failures_are_retried_and_recorded() {
    let receiver = Receiver {
        fail_first: 2,
        ..Receiver::default()
    };
    let base = serve(receiver.clone()).await;
    let dispatcher = dispatcher(vec![hook("ops", format!("{base}/hook"), &["*"])], fast_retry(3)).await;

    let outcome = dispatcher.test("ops").await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.attempt, 3);
    assert_eq!(outcome.event_type, "notification.test");
    assert_eq!(outcome.event_cursor, None);
    assert_eq!(receiver.calls.load(Ordering::SeqCst), 3);

    let history = dispatcher.history(10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|d| !d.success).count(), 2);
    assert!(history
        .iter()
        .filter(|d| !d.success)
        .all(|d| d.status_code == Some(503)));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let base = serve(Receiver::default()).await;
    let dispatcher = dispatcher(vec![hook("bad", format!("{base}/bad"), &["*"])], fast_retry(5)).await;

    let outcome = dispatcher.test("bad").await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.attempt, 1);
    assert_eq!(outcome.status_code, Some(400));
    assert_eq!(dispatcher.history(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unreachable_hook_fails_without_propagating() {
    // Bind then drop a listener to get a port nothing is listening on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dispatcher = dispatcher(
        vec![hook("down", format!("http://{addr}/hook"), &["task.*"])],
        fast_retry(2),
    )
    .await;
    let handles = dispatcher.dispatch(&record(
        1,
        Event::TaskProgress {
            task_id: "T1".into(),
            agent_id: uuid::Uuid::new_v4(),
            note: "working".into(),
        },
    ));
    for handle in handles {
        handle.await.unwrap();
    }
    let history = dispatcher.history(10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|d| !d.success && d.error.is_some()));
}

#[tokio::test]
async fn bus_subscriber_feeds_dispatcher() {
    let receiver = Receiver::default();
    let base = serve(receiver.clone()).await;
    let dispatcher = dispatcher(vec![hook("ok", format!("{base}/ok"), &["*"])], fast_retry(1)).await;

    let bus = EventBus::new();
    let loop_handle = spawn_dispatch_loop(Arc::clone(&dispatcher), bus.subscribe());
    bus.publish(record(
        3,
        Event::SprintStalled {
            sprint_id: "E1".into(),
            incomplete: vec!["T1".into()],
        },
    ));

    let mut delivered = false;
    for _ in 0..100 {
        if !dispatcher.history(10).await.unwrap().is_empty() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered);
    loop_handle.abort();
}
