use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use cv_core::config::Config;
use cv_core::db::CoordDb;
use cv_core::events::Event;
use cv_core::types::{HookKind, NotificationHook};
use cv_daemon::daemon::{Daemon, DaemonIntervals};
use serde_json::Value;

type Received = Arc<Mutex<Vec<Value>>>;

async fn receive(State(received): State<Received>, Json(body): Json<Value>) -> StatusCode {
    received.lock().unwrap().push(body);
    StatusCode::OK
}

async fn serve_receiver() -> (String, Received) {
    let received = Received::default();
    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), received)
}

#[tokio::test]
async fn serves_api_and_forwards_events_to_hooks() {
    let (hook_url, received) = serve_receiver().await;
    let mut config = Config::default();
    config.notifications.hooks = vec![NotificationHook {
        id: "ops".into(),
        kind: HookKind::Webhook,
        url: hook_url,
        event_filter: vec!["sprint.*".into()],
    }];

    let db = Arc::new(CoordDb::open_in_memory("test").await.unwrap());
    let mut daemon = Daemon::with_db(config, db).unwrap();
    daemon.set_intervals(DaemonIntervals {
        patrol: Duration::from_millis(50),
        tail: Duration::from_millis(20),
    });
    let daemon = Arc::new(daemon);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let running = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run_with_listener(listener).await })
    };

    let client = reqwest::Client::new();
    let mut status = None;
    for _ in 0..100 {
        if let Ok(resp) = client.get(format!("http://{addr}/api/status")).send().await {
            status = Some(resp.status());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, Some(reqwest::StatusCode::OK));

    // Let the tailer take its start cursor before appending.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = &daemon.api_state().events;
    events
        .append(Event::SprintCompleted { sprint_id: "E1".into() })
        .await
        .unwrap();
    events
        .append(Event::TaskProgress {
            task_id: "T1".into(),
            agent_id: uuid::Uuid::new_v4(),
            note: "filtered out".into(),
        })
        .await
        .unwrap();

    let mut delivered = Vec::new();
    for _ in 0..200 {
        delivered = received.lock().unwrap().clone();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["event_type"], "sprint.completed");

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
