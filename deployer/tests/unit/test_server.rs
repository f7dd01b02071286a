//! HTTP surface tests

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use tenant_deployer::server::serve::router;
use tenant_deployer::server::state::ServerState;

use crate::support::Harness;

fn app(h: &Harness) -> Router {
    router(Arc::new(ServerState::new(h.state.queue.clone())))
}

fn submission(tenant: &str) -> Value {
    json!({
        "template": {
            "id": "t1",
            "sourceLocation": "https://git.example.com/templates/t1.git"
        },
        "tenant": {
            "id": tenant,
            "userId": "u-42",
            "trackingId": "G-XYZ",
            "domain": format!("{}.example.com", tenant)
        }
    })
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, String) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn parse(body: &str) -> Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new().await;
    let (status, body) = send(&app(&h), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = parse(&body);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "tenant-deployer");
}

#[tokio::test]
async fn test_submit_then_query() {
    let h = Harness::new().await;
    let app = app(&h);

    let (status, body) = send(&app, Method::POST, "/deployments", Some(submission("biz1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let body = parse(&body);
    assert_eq!(body["admission"], "queued");
    assert_eq!(body["job"]["id"], json!({"templateId": "t1", "tenantId": "biz1"}));
    assert_eq!(body["job"]["state"], "waiting");
    assert_eq!(body["job"]["priority"], "normal");

    let (status, body) = send(&app, Method::POST, "/deployments", Some(submission("biz1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["admission"], "in_progress");

    let (status, body) = send(&app, Method::GET, "/deployments/t1/biz1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["state"], "waiting");

    let (status, body) = send(&app, Method::GET, "/deployments/t1/biz1/record", None).await;
    assert_eq!(status, StatusCode::OK);
    let record = parse(&body);
    assert_eq!(record["status"], "in_progress");
    assert_eq!(record["domain"], "biz1.example.com");
    assert!(record.get("error").is_none());
}

#[tokio::test]
async fn test_completed_run_is_visible() {
    let h = Harness::new().await;
    let app = app(&h);

    send(&app, Method::POST, "/deployments", Some(submission("biz1"))).await;
    h.run_next().await;

    let (status, body) = send(&app, Method::GET, "/deployments/t1/biz1", None).await;
    assert_eq!(status, StatusCode::OK);
    let job = parse(&body);
    assert_eq!(job["state"], "completed");
    assert_eq!(job["progress"], 100);
    assert_eq!(job["result"]["status"], "success");

    let (status, body) = send(&app, Method::GET, "/deployments/t1/biz1/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    let lines = parse(&body)["lines"].as_array().unwrap().len();
    assert!(lines > 16);

    let (status, body) = send(&app, Method::POST, "/deployments", Some(submission("biz1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["admission"], "already_deployed");
}

#[tokio::test]
async fn test_stream_replays_finished_run() {
    let h = Harness::new().await;
    let app = app(&h);

    send(&app, Method::POST, "/deployments", Some(submission("biz1"))).await;
    h.run_next().await;

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(5),
        send(&app, Method::GET, "/deployments/t1/biz1/stream", None),
    )
    .await
    .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: log"));
    assert!(body.contains("data: [1/8] Checking required tools..."));
    assert!(body.trim_end().ends_with("event: end\ndata: success"));
    assert_eq!(body.matches("event: end").count(), 1);
}

#[tokio::test]
async fn test_error_status_mapping() {
    let h = Harness::with_options(|options| options.queue.stale_after = Duration::ZERO).await;
    let app = app(&h);

    // Unknown key
    let (status, body) = send(&app, Method::GET, "/deployments/t1/nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(parse(&body)["error"].is_string());

    let (status, _) = send(&app, Method::GET, "/deployments/t1/nobody/logs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Malformed key in the path
    let (status, _) = send(&app, Method::GET, "/deployments/t_1/biz1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Malformed body
    let (status, body) = send(&app, Method::POST, "/deployments", Some(json!({"template": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(parse(&body)["error"].is_string());

    // Remote target
    let mut remote = submission("biz2");
    remote["target"] = json!({"type": "remote", "host": "10.0.0.5"});
    let (status, body) = send(&app, Method::POST, "/deployments", Some(remote)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(parse(&body)["error"].as_str().unwrap().contains("remote deployment is not supported"));

    // Active job behind a stale record
    send(&app, Method::POST, "/deployments", Some(submission("biz1"))).await;
    let (status, _) = send(&app, Method::POST, "/deployments", Some(submission("biz1"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Domain held by another tenant
    let mut shared = submission("biz3");
    shared["tenant"]["domain"] = json!("biz1.example.com");
    let (status, _) = send(&app, Method::POST, "/deployments", Some(shared)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Cancellation
    let (status, _) = send(&app, Method::DELETE, "/deployments/t1/biz1", None).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}
