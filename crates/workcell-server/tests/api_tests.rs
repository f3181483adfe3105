//! End-to-end tests for the workcell HTTP API
//!
//! Every test wires a full server over simulated devices with
//! `build_server`, then feeds requests through the real router with
//! `oneshot`. The dosing platform is a wiremock server where a test
//! needs one and a dead address where it does not; no hardware and no
//! sockets beyond the mock are involved.

use axum::body::{self, Body};
use axum::http::{self, Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use workcell_server::api::build_router;
use workcell_server::{build_server, ServerConfig, WorkcellServer};

struct TestContext {
    server: Arc<WorkcellServer>,
    _state_dir: tempfile::TempDir,
}

async fn setup(dosing_base_url: &str) -> TestContext {
    let state_dir = tempfile::tempdir().unwrap();
    let state_file = state_dir
        .path()
        .join("flows.json")
        .to_string_lossy()
        .into_owned();

    let config = ServerConfig {
        port: 0,
        bind_address: "127.0.0.1".to_string(),
        plc_address: String::new(),
        door_address: String::new(),
        furnace_address: String::new(),
        centrifuge_address: String::new(),
        dosing_base_url: dosing_base_url.to_string(),
        state_file,
        poll_interval_ms: 25,
        confirm_timeout_secs: 0,
        log_level: "debug".to_string(),
        simulation: true,
    };

    let server = build_server(config).await.unwrap();
    TestContext {
        server: Arc::new(server),
        _state_dir: state_dir,
    }
}

/// Context for tests that never reach the dosing platform. The address
/// points at a port that was just bound and released, so nothing is
/// listening; only a health probe would notice.
async fn setup_without_dosing() -> TestContext {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    setup(&format!("http://127.0.0.1:{}", port)).await
}

async fn make_request(
    ctx: &TestContext,
    method: http::Method,
    path: &str,
    request_body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(path).method(method);
    let request_body = match request_body {
        Some(value) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(request_body).unwrap();

    let app = build_router(ctx.server.clone());
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get_flow(ctx: &TestContext, flow_id: &str) -> Value {
    let (status, snapshot) = make_request(
        ctx,
        http::Method::GET,
        &format!("/api/v1/flows/{}", flow_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    snapshot
}

async fn wait_for_flow_state(ctx: &TestContext, flow_id: &str, state: &str) -> Value {
    for _ in 0..400 {
        let snapshot = get_flow(ctx, flow_id).await;
        if snapshot["state"] == state {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("flow {} never reached state {}", flow_id, state);
}

async fn wait_for_task_state(ctx: &TestContext, task_id: &str, state: &str) -> Value {
    for _ in 0..400 {
        let (status, view) = make_request(
            ctx,
            http::Method::GET,
            &format!("/api/v1/tasks/{}", task_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if view["state"] == state {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {} never reached state {}", task_id, state);
}

#[tokio::test]
async fn test_health_reports_both_dependencies() {
    let dosing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/GetTaskInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 200 })))
        .mount(&dosing)
        .await;
    let ctx = setup(&dosing.uri()).await;

    let (status, response) = make_request(&ctx, http::Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "UP");
    assert_eq!(response["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(response["dependencies"]["signalController"]["status"], "UP");
    assert_eq!(response["dependencies"]["dosingPlatform"]["status"], "UP");

    // Same handler under the versioned prefix.
    let (status, _) = make_request(&ctx, http::Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unreachable_dosing_degrades_health_without_failing_it() {
    let ctx = setup_without_dosing().await;

    let (status, response) = make_request(&ctx, http::Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["dependencies"]["signalController"]["status"], "UP");
    assert_eq!(
        response["dependencies"]["dosingPlatform"]["status"],
        "DEGRADED"
    );
}

#[tokio::test]
async fn test_device_status_covers_the_cell() {
    let ctx = setup_without_dosing().await;

    let (status, response) =
        make_request(&ctx, http::Method::GET, "/api/v1/devices/door/status", None).await;
    assert_eq!(status, StatusCode::OK);
    let doors = response["doors"].as_array().unwrap();
    assert_eq!(doors.len(), 6);
    assert_eq!(doors[0]["unit"], 1);
    assert!(doors.iter().all(|door| door["state"] == "closed"));

    let (status, response) = make_request(
        &ctx,
        http::Method::GET,
        "/api/v1/devices/furnace/status",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["chambers"].as_array().unwrap().len(), 24);

    let (status, response) = make_request(
        &ctx,
        http::Method::GET,
        "/api/v1/devices/robot/status",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["robot"]["system"], "idle");
    assert_eq!(response["robot"]["at_home"], true);

    let (status, response) = make_request(
        &ctx,
        http::Method::GET,
        "/api/v1/devices/centrifuge/status",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["centrifuge"]["connection"], "online");

    let (status, response) =
        make_request(&ctx, http::Method::GET, "/api/v1/devices/plc/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["plc"], "connected");
}

#[tokio::test]
async fn test_unit_status_lookup_and_bad_addresses() {
    let ctx = setup_without_dosing().await;

    let (status, response) = make_request(
        &ctx,
        http::Method::GET,
        "/api/v1/devices/door/2/status",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["unit"], 2);
    assert_eq!(response["state"], "closed");
    assert_eq!(response["connection"], "online");

    let (status, response) = make_request(
        &ctx,
        http::Method::GET,
        "/api/v1/devices/door/42/status",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_NOT_FOUND");

    let (status, response) = make_request(
        &ctx,
        http::Method::GET,
        "/api/v1/devices/toaster/status",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_VALIDATION_ERROR");

    // The robot has no unit index.
    let (status, response) = make_request(
        &ctx,
        http::Method::GET,
        "/api/v1/devices/robot/1/status",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_VALIDATION_ERROR");
}

#[tokio::test]
async fn test_manual_door_command_reaches_the_sim() {
    let ctx = setup_without_dosing().await;

    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/devices/door/2/command",
        Some(json!({ "action": "open" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(response["accepted"]["device"], "door/2");
    assert!(response["accepted"]["action"]
        .as_str()
        .unwrap()
        .contains("door 2"));

    // The sim acknowledges immediately; the poller converges the cache.
    for _ in 0..400 {
        let (_, response) = make_request(
            &ctx,
            http::Method::GET,
            "/api/v1/devices/door/2/status",
            None,
        )
        .await;
        if response["state"] == "open" {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("door 2 never reported open");
}

#[tokio::test]
async fn test_dispatch_toward_closed_chamber_is_denied() {
    let ctx = setup_without_dosing().await;

    // Task code 5 is a furnace place; chamber 7's lid starts closed.
    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/devices/robot/command",
        Some(json!({ "action": "dispatch", "task_code": 5, "station": 7, "quantity": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_INTERLOCK_DENIED");
    assert!(response["error"]
        .as_str()
        .unwrap()
        .starts_with("Interlock denied"));
}

#[tokio::test]
async fn test_command_validation_failures() {
    let ctx = setup_without_dosing().await;

    // set_speed without its parameter
    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/devices/centrifuge/command",
        Some(json!({ "action": "set_speed" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_VALIDATION_ERROR");

    // unknown action name
    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/devices/door/2/command",
        Some(json!({ "action": "wiggle" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_VALIDATION_ERROR");
}

#[tokio::test]
async fn test_flow_checkpoint_pause_resume_cancel() {
    let ctx = setup_without_dosing().await;

    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/flows/input",
        Some(json!({ "shelf": 3, "chamber": 7, "quantity": 4, "confirm_first": true })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let flow_id = response["flow_id"].as_str().unwrap().to_string();

    let snapshot = wait_for_flow_state(&ctx, &flow_id, "awaiting_confirmation").await;
    assert_eq!(snapshot["kind"], "input");
    assert_eq!(snapshot["pending_confirmation"], true);
    assert!(snapshot["current_label"].is_string());

    let (status, _) = make_request(
        &ctx,
        http::Method::POST,
        &format!("/api/v1/flows/{}/pause", flow_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_flow_state(&ctx, &flow_id, "paused").await;

    // Resuming in place lands back on the same checkpoint.
    let (status, _) = make_request(
        &ctx,
        http::Method::POST,
        &format!("/api/v1/flows/{}/resume", flow_id),
        Some(json!({ "recovery_mode": "resume_in_place" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_flow_state(&ctx, &flow_id, "awaiting_confirmation").await;

    let (status, _) = make_request(
        &ctx,
        http::Method::POST,
        &format!("/api/v1/flows/{}/cancel", flow_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let snapshot = wait_for_flow_state(&ctx, &flow_id, "cancelled").await;
    assert_eq!(snapshot["error"], Value::Null);

    let (status, response) = make_request(&ctx, http::Method::GET, "/api/v1/flows", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["flows"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_flow_error_responses() {
    let ctx = setup_without_dosing().await;

    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/flows/some-flow/resume",
        Some(json!({ "recovery_mode": "rewind" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        response["errorDetails"]["errorCode"],
        "ERR_INVALID_RECOVERY_MODE"
    );

    let (status, response) =
        make_request(&ctx, http::Method::GET, "/api/v1/flows/some-flow", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_NOT_FOUND");
    assert!(response["error"].as_str().unwrap().contains("not found"));

    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/flows/input",
        Some(json!({ "shelf": 0, "chamber": 7, "quantity": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_VALIDATION_ERROR");
}

#[tokio::test]
async fn test_task_round_trip_with_the_dosing_platform() {
    let dosing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/AddTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "task_id": 77,
            "workflow_id": 5,
            "shortage_list": [],
        })))
        .expect(1)
        .mount(&dosing)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/StartTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 200 })))
        .expect(1)
        .mount(&dosing)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/GetTaskInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "task_id": 77,
            "status": "finished",
        })))
        .mount(&dosing)
        .await;
    let ctx = setup(&dosing.uri()).await;

    let (status, task) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/tasks",
        Some(json!({
            "task_name": "pilot batch 4",
            "layout": [{ "layout_code": "B2", "quantity": 8 }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["state"], "submitted");
    assert_eq!(task["remote_task_id"], 77);
    assert_eq!(task["workflow_id"], 5);
    let task_id = task["task_id"].as_str().unwrap().to_string();

    let (status, started) = make_request(
        &ctx,
        http::Method::POST,
        &format!("/api/v1/tasks/{}/start", task_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["state"], "running");

    // No transfers, so the first coordinator pass settles the task
    // against the platform.
    let view = wait_for_task_state(&ctx, &task_id, "completed").await;
    assert_eq!(view["remote"]["status"], "finished");
    assert_eq!(view["flows"].as_array().unwrap().len(), 0);

    let (status, response) = make_request(&ctx, http::Method::GET, "/api/v1/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["tasks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_platform_refusal_leaves_no_task_behind() {
    let dosing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/AddTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 409 })))
        .expect(1)
        .mount(&dosing)
        .await;
    let ctx = setup(&dosing.uri()).await;

    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/tasks",
        Some(json!({ "task_name": "refused", "layout": [{ "layout_code": "A1" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        response["errorDetails"]["errorCode"],
        "ERR_REMOTE_TASK_ERROR"
    );
    assert!(response["error"].as_str().unwrap().contains("409"));

    let (_, response) = make_request(&ctx, http::Method::GET, "/api/v1/tasks", None).await;
    assert_eq!(response["tasks"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_upload_rejects_an_empty_definition() {
    // Validation fails before the platform is consulted, so the dead
    // address is never dialled.
    let ctx = setup_without_dosing().await;

    let (status, response) = make_request(
        &ctx,
        http::Method::POST,
        "/api/v1/tasks",
        Some(json!({ "task_name": "empty" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_VALIDATION_ERROR");

    let (status, response) =
        make_request(&ctx, http::Method::GET, "/api/v1/tasks/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["errorDetails"]["errorCode"], "ERR_NOT_FOUND");
}

#[tokio::test]
async fn test_status_snapshot_aggregates_the_cell() {
    let ctx = setup_without_dosing().await;

    let (status, response) = make_request(&ctx, http::Method::GET, "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["plc"], "connected");
    assert!(response["devices"]["devices"]["robot"].is_object());
    assert!(response["devices"]["devices"]["door/1"].is_object());
    assert_eq!(response["flows"].as_array().unwrap().len(), 0);
    assert!(response["generated_at"].is_string());
}
