//! Admin endpoint handlers.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use payram_agent_core::update::{ErrorCode, UpdateError};

use super::response::{respond_error, respond_ok, ErrorBody};
use super::AppState;
use crate::build_info;
use crate::metrics::{OUTCOME_FAILURE, OUTCOME_ROLLED_BACK, OUTCOME_SUCCESS};

const CHILD_VERSION_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_LOG_TAIL: usize = 200;

#[derive(Debug, Deserialize)]
pub(super) struct UpdateQuery {
    channel: Option<String>,
    ignore_compat: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct LogsQuery {
    component: Option<String>,
    tail: Option<String>,
}

/// Liveness probe; no auth, plain text.
pub(super) async fn health() -> &'static str {
    "ok"
}

/// Agent build info; no auth.
pub(super) async fn version() -> Json<build_info::BuildInfo> {
    Json(build_info::get())
}

/// Prometheus metrics; no auth, sampled at scrape time.
pub(super) async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.observe_children(&state.supervisor.status());
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct ChildVersionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

/// Agent plus best-effort child versions.
pub(super) async fn admin_version(State(state): State<AppState>) -> Response {
    let chat_url = format!("http://127.0.0.1:{}/version", state.config.chat_port);
    let mcp_url = format!("http://127.0.0.1:{}/version", state.config.mcp_port);

    let (chat, mcp) = tokio::join!(
        fetch_child_version(&state.http, &chat_url),
        fetch_child_version(&state.http, &mcp_url),
    );

    respond_ok(
        StatusCode::OK,
        json!({
            "agent": build_info::get(),
            "chat": chat,
            "mcp": mcp,
        }),
    )
}

async fn fetch_child_version(http: &reqwest::Client, url: &str) -> ChildVersionResult {
    let failed = |message: String| ChildVersionResult {
        info: None,
        error: Some(ErrorBody {
            code: "FETCH_FAILED".to_string(),
            message,
        }),
    };

    match http.get(url).timeout(CHILD_VERSION_TIMEOUT).send().await {
        Ok(response) if response.status().is_success() => {
            match response.json::<serde_json::Value>().await {
                Ok(info) => ChildVersionResult {
                    info: Some(info),
                    error: None,
                },
                Err(err) => failed(err.to_string()),
            }
        }
        Ok(response) => failed(format!("status {}", response.status().as_u16())),
        Err(err) => failed(err.to_string()),
    }
}

/// `GET /admin/update/available`.
pub(super) async fn update_available(
    State(state): State<AppState>,
    Query(query): Query<UpdateQuery>,
) -> Response {
    let channel = query.channel.as_deref().unwrap_or_default();
    let ignore_compat = state.config.ignore_compat || query_flag(query.ignore_compat.as_deref());

    match state.controller.available(channel, ignore_compat).await {
        Ok(report) => respond_ok(StatusCode::OK, report),
        Err(err) => update_error_response(&err),
    }
}

/// `POST /admin/update/apply`.
pub(super) async fn update_apply(
    State(state): State<AppState>,
    Query(query): Query<UpdateQuery>,
) -> Response {
    let channel = query.channel.as_deref().unwrap_or_default();
    let ignore_compat = state.config.ignore_compat || query_flag(query.ignore_compat.as_deref());

    match state.controller.apply(channel, ignore_compat).await {
        Ok(outcome) => {
            state.metrics.record_update_outcome(OUTCOME_SUCCESS);
            respond_ok(StatusCode::OK, outcome)
        }
        Err(err) => {
            let outcome = if err.code == ErrorCode::UpdateFailedRolledBack {
                OUTCOME_ROLLED_BACK
            } else {
                OUTCOME_FAILURE
            };
            state.metrics.record_update_outcome(outcome);
            update_error_response(&err)
        }
    }
}

/// `POST /admin/update/rollback`.
pub(super) async fn update_rollback(State(state): State<AppState>) -> Response {
    match state.controller.rollback().await {
        Ok(outcome) => respond_ok(StatusCode::OK, outcome),
        Err(err) => update_error_response(&err),
    }
}

/// `GET /admin/update/status`: the status document verbatim.
pub(super) async fn update_status(State(state): State<AppState>) -> Response {
    match state.status.load() {
        Ok(status) => respond_ok(StatusCode::OK, status),
        Err(err) => respond_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "STATUS_LOAD_FAILED",
            &err.to_string(),
        ),
    }
}

/// `GET /admin/child/status`.
pub(super) async fn child_status(State(state): State<AppState>) -> Response {
    respond_ok(StatusCode::OK, state.supervisor.status())
}

/// `POST /admin/child/restart`.
pub(super) async fn child_restart(State(state): State<AppState>) -> Response {
    match state.supervisor.restart_all() {
        Ok(()) => respond_ok(StatusCode::OK, json!({"status": "restarted"})),
        Err(reason) => respond_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "RESTART_FAILED",
            &reason,
        ),
    }
}

/// `GET /admin/logs?component=<name>&tail=<N>`.
pub(super) async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let Some(component) = query.component.filter(|c| !c.is_empty()) else {
        return respond_error(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            "component is required",
        );
    };

    let tail = query
        .tail
        .as_deref()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|tail| *tail > 0)
        .unwrap_or(DEFAULT_LOG_TAIL);

    match state.supervisor.logs(&component, tail) {
        Some(lines) => respond_ok(
            StatusCode::OK,
            json!({"component": component, "lines": lines}),
        ),
        None => respond_error(
            StatusCode::BAD_REQUEST,
            "INVALID_COMPONENT",
            "component must be chat or mcp",
        ),
    }
}

#[derive(Debug, Deserialize)]
struct PutSecretRequest {
    #[serde(default)]
    openai_api_key: String,
}

/// `PUT /admin/secrets/openai`.
pub(super) async fn put_secret(State(state): State<AppState>, body: Bytes) -> Response {
    let request: PutSecretRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return respond_error(
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                &format!("malformed request body: {err}"),
            )
        }
    };

    if request.openai_api_key.is_empty() {
        return respond_error(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            "openai_api_key is required",
        );
    }

    match state.secrets.put_openai_key(&request.openai_api_key) {
        Ok(()) => respond_ok(StatusCode::OK, json!({"status": "saved"})),
        Err(err) => respond_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SECRET_SAVE_FAILED",
            &err.to_string(),
        ),
    }
}

/// `DELETE /admin/secrets/openai`.
pub(super) async fn delete_secret(State(state): State<AppState>) -> Response {
    match state.secrets.delete_openai_key() {
        Ok(()) => respond_ok(StatusCode::OK, json!({"status": "deleted"})),
        Err(err) => respond_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SECRET_DELETE_FAILED",
            &err.to_string(),
        ),
    }
}

/// `GET /admin/secrets/status`: presence and source, never the value.
pub(super) async fn secrets_status(State(state): State<AppState>) -> Response {
    match state.secrets.load() {
        Ok((secrets, source)) => respond_ok(
            StatusCode::OK,
            json!({
                "openai_api_key_set": !secrets.openai_api_key.is_empty(),
                "source": source,
            }),
        ),
        Err(err) => respond_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SECRET_LOAD_FAILED",
            &err.to_string(),
        ),
    }
}

fn update_error_response(err: &UpdateError) -> Response {
    let status = StatusCode::from_u16(err.code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    respond_error(status, err.code.as_str(), &err.message)
}

fn query_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(str::to_lowercase).as_deref(),
        Some("1") | Some("true")
    )
}
