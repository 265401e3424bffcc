//! Auth middleware matrix over the assembled router.

mod common;

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use payram_agent_core::config::AgentConfig;

use common::{app_state, StubSupervisor};

fn agent_config(home: &std::path::Path, token: Option<&str>, allowlist: &str) -> AgentConfig {
    AgentConfig {
        home: home.to_path_buf(),
        admin_token: token.map(str::to_string),
        admin_allowlist: allowlist.to_string(),
        ..AgentConfig::default()
    }
}

fn admin_request(remote: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri("/admin/child/status").method("GET");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    let mut request = builder.body(Body::empty()).unwrap();

    let remote: SocketAddr = remote.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(remote));
    request
}

async fn error_code(response: axum::response::Response) -> String {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["ok"], false);
    value["error"]["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn missing_server_token_yields_500() {
    let home = tempfile::tempdir().unwrap();
    let stub = StubSupervisor::new();
    let app = payram_agent_daemon::admin::router(app_state(
        agent_config(home.path(), None, ""),
        &stub,
    ));

    let response = app
        .oneshot(admin_request("127.0.0.1:4000", Some("Bearer tok")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_code(response).await, "ADMIN_TOKEN_MISSING");
}

#[tokio::test]
async fn missing_and_wrong_bearer_yield_401() {
    let home = tempfile::tempdir().unwrap();
    let stub = StubSupervisor::new();
    let app = payram_agent_daemon::admin::router(app_state(
        agent_config(home.path(), Some("tok"), ""),
        &stub,
    ));

    for auth in [None, Some("Bearer nope"), Some("tok")] {
        let response = app
            .clone()
            .oneshot(admin_request("127.0.0.1:4000", auth))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{auth:?}");
        assert_eq!(error_code(response).await, "UNAUTHORIZED");
    }
}

#[tokio::test]
async fn non_loopback_source_is_forbidden_before_token_check() {
    let home = tempfile::tempdir().unwrap();
    let stub = StubSupervisor::new();
    let app = payram_agent_daemon::admin::router(app_state(
        agent_config(home.path(), Some("tok"), ""),
        &stub,
    ));

    let response = app
        .oneshot(admin_request("203.0.113.9:4000", Some("Bearer tok")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "FORBIDDEN_IP");
}

#[tokio::test]
async fn allowlisted_source_with_token_passes() {
    let home = tempfile::tempdir().unwrap();
    let stub = StubSupervisor::new();
    let app = payram_agent_daemon::admin::router(app_state(
        agent_config(home.path(), Some("tok"), "203.0.113.0/24"),
        &stub,
    ));

    let response = app
        .oneshot(admin_request("203.0.113.9:4000", Some("Bearer tok")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn loopback_with_token_passes_with_empty_allowlist() {
    let home = tempfile::tempdir().unwrap();
    let stub = StubSupervisor::new();
    let app = payram_agent_daemon::admin::router(app_state(
        agent_config(home.path(), Some("tok"), ""),
        &stub,
    ));

    let response = app
        .oneshot(admin_request("127.0.0.1:4000", Some("Bearer tok")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["ok"], true);
    assert!(value["data"]["components"].is_array());
}

#[tokio::test]
async fn public_endpoints_require_no_auth() {
    let home = tempfile::tempdir().unwrap();
    let stub = StubSupervisor::new();
    let app = payram_agent_daemon::admin::router(app_state(
        agent_config(home.path(), None, ""),
        &stub,
    ));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/version")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["name"], "payram-agent");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
