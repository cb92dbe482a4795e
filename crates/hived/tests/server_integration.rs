//! Integration tests for the HTTP API.
//!
//! Drives runs through the router: start, claim, complete, fail, and the
//! error mapping for missing or misused resources.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use hived::bus::EventBus;
use hived::engine::Engine;
use hived::server::{create_router, AppState};
use hived::storage::Storage;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const FEATURE_DEV: &str = r#"
id: feature-dev
agents:
  - id: planner
  - id: developer
steps:
  - id: plan
    agent: planner
    input: "Plan {{task}}"
    max_retries: 0
  - id: implement
    agent: developer
    type: loop
    loop:
      over: stories
    input: "Implement {{current_story_id}}"
"#;

async fn create_test_app() -> (axum::Router, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let workflows_dir = dir.path().join("workflows");
    std::fs::create_dir_all(workflows_dir.join("feature-dev")).unwrap();
    std::fs::write(workflows_dir.join("feature-dev/workflow.yml"), FEATURE_DEV).unwrap();
    std::fs::create_dir_all(workflows_dir.join("misnamed")).unwrap();
    std::fs::write(workflows_dir.join("misnamed/workflow.yml"), FEATURE_DEV).unwrap();

    let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let storage = Arc::new(storage);
    let engine = Arc::new(Engine::new(
        Arc::clone(&storage),
        EventBus::new(),
        chrono::Duration::minutes(15),
    ));

    let state = Arc::new(AppState {
        engine,
        storage,
        workflows_dir,
    });
    let router = create_router(Arc::clone(&state));
    (router, state, dir)
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn start_run(app: &axum::Router) -> String {
    let response = send(
        app,
        "POST",
        "/runs",
        Some(json!({ "workflow": "feature-dev", "task": "add login" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_to_json(response).await;
    json["run"]["id"].as_str().unwrap().to_string()
}

async fn claim(app: &axum::Router, agent: &str) -> Value {
    let response = send(app, "POST", "/steps/claim", Some(json!({ "agent_id": agent }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_to_json(response).await
}

#[tokio::test]
async fn health_check() {
    let (app, _, _dir) = create_test_app().await;
    let response = send(&app, "GET", "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_json(response).await["status"], "ok");
}

// --- Runs ---

#[tokio::test]
async fn run_lifecycle_create_list_get() {
    let (app, _, _dir) = create_test_app().await;

    let response = send(
        &app,
        "POST",
        "/runs",
        Some(json!({
            "workflow": "feature-dev",
            "task": "add login",
            "notify_url": "http://127.0.0.1:9/hook"
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_to_json(response).await;
    let run_id = json["run"]["id"].as_str().unwrap().to_string();
    assert_eq!(json["run"]["status"], "running");
    assert_eq!(json["run"]["workflow_id"], "feature-dev");
    assert_eq!(json["run"]["run_number"], 1);
    assert_eq!(json["run"]["notify_url"], "http://127.0.0.1:9/hook");

    let response = send(&app, "GET", "/runs", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["runs"].as_array().unwrap().len(), 1);

    let response = send(&app, "GET", "/runs?workflow=other", None).await;
    let json = body_to_json(response).await;
    assert!(json["runs"].as_array().unwrap().is_empty());

    let response = send(&app, "GET", &format!("/runs/{run_id}"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_json(response).await["run"]["task"], "add login");

    let response = send(&app, "GET", &format!("/runs/{run_id}/steps"), None).await;
    let json = body_to_json(response).await;
    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["status"], "pending");
    assert_eq!(steps[1]["status"], "waiting");
    assert_eq!(steps[1]["kind"], "loop");
}

#[tokio::test]
async fn create_run_validates_input() {
    let (app, _, _dir) = create_test_app().await;

    let response = send(
        &app,
        "POST",
        "/runs",
        Some(json!({ "workflow": "feature-dev", "task": "  " })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_to_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("task"));

    let response = send(
        &app,
        "POST",
        "/runs",
        Some(json!({ "workflow": "../etc", "task": "x" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &app,
        "POST",
        "/runs",
        Some(json!({ "workflow": "nope", "task": "x" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Directory name and declared id must agree.
    let response = send(
        &app,
        "POST",
        "/runs",
        Some(json!({ "workflow": "misnamed", "task": "x" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_workflow_file_is_bad_request() {
    let (app, state, _dir) = create_test_app().await;
    let broken = state.workflows_dir.join("broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("workflow.yml"), "id: broken\nagents: []\nsteps: []\n").unwrap();

    let response = send(
        &app,
        "POST",
        "/runs",
        Some(json!({ "workflow": "broken", "task": "x" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let (app, _, _dir) = create_test_app().await;
    for uri in [
        "/runs/missing",
        "/runs/missing/steps",
        "/runs/missing/stories",
        "/runs/missing/events",
    ] {
        let response = send(&app, "GET", uri, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

// --- Steps ---

#[tokio::test]
async fn claim_complete_through_loop() {
    let (app, _, _dir) = create_test_app().await;
    let run_id = start_run(&app).await;

    let response = send(&app, "GET", "/steps/peek?agent_id=feature-dev_planner", None).await;
    assert_eq!(body_to_json(response).await["has_work"], true);

    let json = claim(&app, "feature-dev_planner").await;
    assert_eq!(json["found"], true);
    assert_eq!(json["run_id"], run_id.as_str());
    assert_eq!(json["input"], "Plan add login");
    assert!(json.get("story_id").is_none());
    let plan_id = json["step_id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        "POST",
        &format!("/steps/{plan_id}/complete"),
        Some(json!({
            "output": "STATUS: done\nSTORIES_JSON: [{\"id\": \"US-1\", \"title\": \"Form\"}]"
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["advanced"], true);
    assert_eq!(json["run_completed"], false);

    let json = claim(&app, "feature-dev_developer").await;
    assert_eq!(json["found"], true);
    assert_eq!(json["input"], "Implement US-1");
    assert!(json["story_id"].is_string());
    let loop_id = json["step_id"].as_str().unwrap().to_string();

    let response = send(&app, "GET", &format!("/runs/{run_id}/stories"), None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["stories"][0]["status"], "running");

    let response = send(
        &app,
        "POST",
        &format!("/steps/{loop_id}/complete"),
        Some(json!({ "output": "STATUS: done" })),
    )
    .await;
    let json = body_to_json(response).await;
    assert_eq!(json["run_completed"], true);

    let response = send(&app, "GET", &format!("/runs/{run_id}"), None).await;
    assert_eq!(body_to_json(response).await["run"]["status"], "completed");

    let response = send(&app, "GET", &format!("/runs/{run_id}/events"), None).await;
    let json = body_to_json(response).await;
    let events = json["events"].as_array().unwrap();
    assert_eq!(events.first().unwrap()["event_type"], "run.started");
    assert_eq!(events.last().unwrap()["event_type"], "run.completed");
}

#[tokio::test]
async fn claim_without_work() {
    let (app, _, _dir) = create_test_app().await;
    let json = claim(&app, "feature-dev_planner").await;
    assert_eq!(json, json!({ "found": false }));

    let response = send(&app, "GET", "/steps/peek?agent_id=feature-dev_planner", None).await;
    assert_eq!(body_to_json(response).await["has_work"], false);
}

#[tokio::test]
async fn claim_and_peek_require_agent() {
    let (app, _, _dir) = create_test_app().await;
    let response = send(&app, "POST", "/steps/claim", Some(json!({ "agent_id": "" }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, "GET", "/steps/peek", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fail_exhausts_budget_and_fails_run() {
    let (app, _, _dir) = create_test_app().await;
    let run_id = start_run(&app).await;
    let json = claim(&app, "feature-dev_planner").await;
    let plan_id = json["step_id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        "POST",
        &format!("/steps/{plan_id}/fail"),
        Some(json!({ "error": "model unavailable" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json, json!({ "retrying": false, "run_failed": true }));

    let response = send(&app, "GET", &format!("/runs/{run_id}"), None).await;
    assert_eq!(body_to_json(response).await["run"]["status"], "failed");
}

#[tokio::test]
async fn completing_non_running_step_conflicts() {
    let (app, _, _dir) = create_test_app().await;
    let run_id = start_run(&app).await;

    let response = send(&app, "GET", &format!("/runs/{run_id}/steps"), None).await;
    let json = body_to_json(response).await;
    let waiting_id = json["steps"][1]["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        "POST",
        &format!("/steps/{waiting_id}/complete"),
        Some(json!({ "output": "STATUS: done" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = send(
        &app,
        "POST",
        "/steps/missing/fail",
        Some(json!({ "error": "boom" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
