use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use cv_bridge::http_api::{api_router, ApiState};
use cv_bridge::notifications::{NotificationDispatcher, ReqwestTransport};
use cv_core::config::Config;
use cv_core::db::CoordDb;
use cv_harness::retry::RetryPolicy;
use cv_telemetry::tracing_setup::REQUEST_ID_HEADER;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn test_app() -> Router {
    let db = Arc::new(CoordDb::open_in_memory("test").await.unwrap());
    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::clone(&db),
        Vec::new(),
        Arc::new(ReqwestTransport::new().unwrap()),
        RetryPolicy::once(),
    ));
    let state = Arc::new(ApiState::new(db, &Config::default(), dispatcher));
    api_router(state)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn register(app: &Router, name: &str, caps: &[&str]) -> String {
    let (status, agent) = call(
        app,
        Method::POST,
        "/api/agents",
        Some(json!({ "name": name, "capabilities": caps })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    agent["id"].as_str().unwrap().to_string()
}

async fn create_task(app: &Router, body: Value) {
    let (status, _) = call(app, Method::POST, "/api/tasks", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_lifecycle_over_http() {
    let app = test_app().await;
    let go = register(&app, "worker-go", &["go"]).await;
    register(&app, "worker-ts", &["ts"]).await;

    let (status, list) = call(&app, Method::GET, "/api/agents?capability=go", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["worker-go"]);

    let (status, agent) = call(
        &app,
        Method::PATCH,
        &format!("/api/agents/{go}"),
        Some(json!({ "status": "idle" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(agent["status"], "idle");

    let (status, body) = call(&app, Method::DELETE, &format!("/api/agents/{go}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], json!([]));

    let (status, body) = call(&app, Method::GET, &format!("/api/agents/{go}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn duplicate_live_name_is_409() {
    let app = test_app().await;
    register(&app, "dup", &[]).await;
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/agents",
        Some(json!({ "name": "dup" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "precondition");
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_is_capability_guarded_and_exclusive() {
    let app = test_app().await;
    let go_a = register(&app, "go-a", &["go"]).await;
    let go_b = register(&app, "go-b", &["go"]).await;
    let ts = register(&app, "ts", &["ts"]).await;
    create_task(
        &app,
        json!({ "id": "T1", "sprint_id": "E1", "title": "parser", "required_capabilities": ["go"] }),
    )
    .await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/tasks/T1/claim",
        Some(json!({ "agent_id": ts })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "precondition");

    let (status, task) = call(
        &app,
        Method::POST,
        "/api/tasks/T1/claim",
        Some(json!({ "agent_id": go_a })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "claimed");
    assert_eq!(task["claimed_by"], go_a.as_str());

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/tasks/T1/claim",
        Some(json!({ "agent_id": go_b })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");
}

#[tokio::test]
async fn completion_requires_passed_criteria() {
    let app = test_app().await;
    let agent = register(&app, "a", &[]).await;
    create_task(
        &app,
        json!({ "id": "T1", "sprint_id": "E1", "title": "t", "acceptance_criteria": ["tests pass"] }),
    )
    .await;
    let owner = Some(json!({ "agent_id": agent }));
    call(&app, Method::POST, "/api/tasks/T1/claim", owner.clone()).await;
    let (status, _) = call(&app, Method::POST, "/api/tasks/T1/start", owner.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::POST, "/api/tasks/T1/complete", owner.clone()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "precondition");

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/tasks/T1/verifications",
        Some(json!({ "criterion": "tests pass", "passed": true, "detail": "42 passed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, results) = call(&app, Method::GET, "/api/tasks/T1/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results[0]["passed"], true);

    let (status, task) = call(&app, Method::POST, "/api/tasks/T1/complete", owner).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "complete");
    assert_eq!(task["completed_by"], agent.as_str());

    let (_, detail) = call(&app, Method::GET, "/api/tasks/T1", None).await;
    assert_eq!(detail["status"], "complete");
    assert_eq!(detail["verifications"][0]["detail"], "42 passed");
}

#[tokio::test]
async fn import_skips_existing_and_list_filters() {
    let app = test_app().await;
    create_task(&app, json!({ "id": "A", "sprint_id": "E1", "title": "a" })).await;
    let (status, summary) = call(
        &app,
        Method::POST,
        "/api/tasks/import",
        Some(json!([
            { "id": "A", "sprint_id": "E1", "title": "a" },
            { "id": "B", "sprint_id": "E1", "title": "b", "dependencies": ["A"] },
            { "id": "C", "sprint_id": "E2", "title": "c" },
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["created"], json!(["B", "C"]));
    assert_eq!(summary["skipped"], json!(["A"]));

    let (_, list) = call(&app, Method::GET, "/api/tasks?sprint_id=E1&status=todo", None).await;
    assert_eq!(list.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_and_missing_inputs() {
    let app = test_app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/tasks")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::GET, "/api/tasks/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = call(&app, Method::GET, "/api/agents/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Escalations & checkpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn escalation_resolve_is_terminal() {
    let app = test_app().await;
    create_task(&app, json!({ "id": "T1", "sprint_id": "E1", "title": "t" })).await;
    let (status, escalation) = call(
        &app,
        Method::POST,
        "/api/escalations",
        Some(json!({ "task_id": "T1", "reason": "needs a decision", "severity": "high" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = escalation["id"].as_str().unwrap().to_string();

    let uri = format!("/api/escalations/{id}/resolve");
    let (status, resolved) = call(&app, Method::POST, &uri, Some(json!({ "resolution": "ship it" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "resolved");

    let (status, body) = call(&app, Method::POST, &uri, Some(json!({ "resolution": "no" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "precondition");

    let (_, current) = call(&app, Method::GET, &format!("/api/escalations/{id}"), None).await;
    assert_eq!(current["resolution"], "ship it");

    let (_, open) = call(&app, Method::GET, "/api/escalations?status=open", None).await;
    assert!(open.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn checkpoints_capture_the_log_head() {
    let app = test_app().await;
    create_task(&app, json!({ "id": "T1", "sprint_id": "E1", "title": "t" })).await;
    let (status, checkpoint) = call(
        &app,
        Method::POST,
        "/api/checkpoints",
        Some(json!({ "sprint_id": "E1", "commit_ref": "abc123", "message": "before refactor" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(checkpoint["event_cursor"], 1);

    let id = checkpoint["id"].as_str().unwrap();
    let (status, fetched) = call(&app, Method::GET, &format!("/api/checkpoints/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["commit_ref"], "abc123");

    let (_, list) = call(
        &app,
        Method::GET,
        "/api/checkpoints?sprint_id=E1&orchestrator_only=true",
        None,
    )
    .await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Event ingestion & DLQ
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_ingest_lands_in_dlq_and_retries() {
    let app = test_app().await;
    let agent = register(&app, "a", &[]).await;

    let (status, outcome) = call(
        &app,
        Method::POST,
        "/api/events",
        Some(json!({ "type": "task.claimed", "payload": { "task_id": "LATE", "agent_id": agent } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(outcome["outcome"], "dead_lettered");
    let entry_id = outcome["entry_id"].as_str().unwrap().to_string();

    let (status, outcome) = call(
        &app,
        Method::POST,
        "/api/events",
        Some(json!({ "type": "task.created", "payload": { "task": { "id": "LATE", "sprint_id": "E1", "title": "late" } } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "applied");

    let (_, stats) = call(&app, Method::GET, "/api/dlq/stats", None).await;
    assert_eq!(stats["pending"], 1);

    let (status, report) = call(&app, Method::POST, &format!("/api/dlq/{entry_id}/retry"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["outcome"], "resolved");

    let (_, task) = call(&app, Method::GET, "/api/tasks/LATE", None).await;
    assert_eq!(task["status"], "claimed");

    let (_, pending) = call(&app, Method::GET, "/api/dlq?status=pending", None).await;
    assert!(pending.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_event_type_is_dead_lettered() {
    let app = test_app().await;
    let (status, outcome) = call(
        &app,
        Method::POST,
        "/api/events",
        Some(json!({ "type": "task.teleported", "payload": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(outcome["reason"].as_str().unwrap().contains("unknown event type"));

    let (_, entries) = call(&app, Method::GET, "/api/dlq?event_type=task.teleported", None).await;
    assert_eq!(entries.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn events_page_from_cursor() {
    let app = test_app().await;
    for id in ["A", "B", "C"] {
        create_task(&app, json!({ "id": id, "sprint_id": "E1", "title": id })).await;
    }
    let (status, page) = call(&app, Method::GET, "/api/events?after=1&limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["head"], 3);
    let events = page["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["cursor"], 2);
    assert_eq!(events[0]["event"]["type"], "task.created");
}

// ---------------------------------------------------------------------------
// Status, metrics, middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_and_metrics() {
    let app = test_app().await;
    register(&app, "a", &[]).await;
    let (status, body) = call(&app, Method::GET, "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project_id"], "test");
    assert_eq!(body["agents_active"], 1);

    let request = Request::builder()
        .uri("/api/metrics")
        .header(REQUEST_ID_HEADER, "req-42")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&body).contains("api_requests_total"));
}

#[tokio::test]
async fn unknown_hook_test_is_404() {
    let app = test_app().await;
    let (status, hooks) = call(&app, Method::GET, "/api/notifications/hooks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hooks, json!([]));
    let (status, _) = call(&app, Method::POST, "/api/notifications/hooks/none/test", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
