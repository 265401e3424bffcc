//! Uniform JSON response envelope for the admin surface.
//!
//! Every admin endpoint answers `{ok, data?, error?{code, message}}`;
//! the error code set is closed and stable for operators to match on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// The `error` member of a failed envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

/// A successful envelope with `data`.
pub fn respond_ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(Envelope {
            ok: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

/// A failed envelope with a code and message.
pub fn respond_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(Envelope::<()> {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }),
    )
        .into_response()
}
