//! Router tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use pairlink_core::RetryConfig;
use pairlink_runtime::testing::FakeConnector;
use pairlink_runtime::{LifecycleConfig, PairingService, ServiceConfig};
use pairlink_server::{PairlinkServer, ServerConfig};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct App {
    router: Router,
    _dir: TempDir,
}

fn app_with(fake: FakeConnector, max_sessions: usize) -> App {
    let dir = TempDir::new().unwrap();
    let shutdown = CancellationToken::new();
    let service = PairingService::new(
        Arc::new(fake),
        ServiceConfig {
            storage_root: dir.path().to_path_buf(),
            retry: RetryConfig::default(),
            lifecycle: LifecycleConfig::default(),
            max_sessions,
        },
        shutdown.clone(),
    );
    let server = PairlinkServer::new(ServerConfig::default(), service, shutdown);
    App {
        router: server.router(),
        _dir: dir,
    }
}

fn app() -> App {
    app_with(FakeConnector::new(), 8)
}

async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn pair_request(body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/api/request-pair-code")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app();
    let (status, body) = call(&app.router, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeSessions"], 0);
    assert!(body["uptimeSecs"].is_number());
}

#[tokio::test]
async fn pair_code_issued_and_visible_in_status() {
    let app = app();
    let (status, body) = call(
        &app.router,
        pair_request(r#"{"phoneNumber": "+1 555 123 4567"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["pairingCode"], "PAIR0001");
    assert!(body["message"].as_str().unwrap().contains("45 seconds"));

    let (status, body) = call(&app.router, get("/api/session-status/15551234567")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], true);
    assert_eq!(body["status"], "codeGenerated");
    assert_eq!(body["pairingCode"], "PAIR0001");
    assert!(body["lastUpdated"].is_string());

    let (_, body) = call(&app.router, get("/api/health")).await;
    assert_eq!(body["activeSessions"], 1);
}

#[tokio::test]
async fn missing_phone_is_400() {
    let app = app();
    let (status, body) = call(&app.router, pair_request("{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["category"], "validation");
    assert_eq!(body["error"], "Phone number is required");
}

#[tokio::test]
async fn malformed_body_is_400() {
    let app = app();
    let (status, body) = call(&app.router, pair_request("not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["category"], "validation");
}

#[tokio::test]
async fn duplicate_request_is_409() {
    let app = app();
    let req = r#"{"phoneNumber": "15551234567"}"#;
    let (first, _) = call(&app.router, pair_request(req)).await;
    assert_eq!(first, StatusCode::OK);

    let (status, body) = call(&app.router, pair_request(req)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["category"], "conflict");
}

#[tokio::test]
async fn full_registry_is_429() {
    let app = app_with(FakeConnector::new(), 1);
    let (first, _) = call(&app.router, pair_request(r#"{"phoneNumber": "15550000001"}"#)).await;
    assert_eq!(first, StatusCode::OK);

    let (status, body) =
        call(&app.router, pair_request(r#"{"phoneNumber": "15550000002"}"#)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["category"], "capacity");
}

#[tokio::test(start_paused = true)]
async fn connector_failure_is_502() {
    let app = app_with(FakeConnector::new().failing_first(10), 8);
    let (status, body) =
        call(&app.router, pair_request(r#"{"phoneNumber": "15551234567"}"#)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["category"], "connection_creation");

    let (_, body) = call(&app.router, get("/api/session-status/15551234567")).await;
    assert_eq!(body, json!({ "active": false }));
}

#[tokio::test]
async fn cleanup_removes_then_reports_nothing_to_do() {
    let app = app();
    let _ = call(&app.router, pair_request(r#"{"phoneNumber": "15551234567"}"#)).await;

    let (status, body) = call(&app.router, delete("/api/cleanup-session/15551234567")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "removed": true }));

    let (status, body) = call(&app.router, delete("/api/cleanup-session/15551234567")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "removed": false }));
}

#[tokio::test]
async fn invalid_phone_in_path_is_400() {
    let app = app();
    let (status, body) = call(&app.router, get("/api/session-status/123")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["category"], "validation");
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = app();
    let (status, _) = call(&app.router, get("/nonexistent")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_preflight_allowed() {
    let app = app();
    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/request-pair-code")
        .header("origin", "https://example.com")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let resp = app.router.clone().oneshot(req).await.unwrap();
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}
