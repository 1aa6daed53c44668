//! HTTP API error types.
//!
//! [`ApiError`] carries either a coordination error, mapped onto a status by
//! its taxonomy, or a request that could not be parsed at all. Bodies are
//! always `{"error": ..., "kind": ...}`.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cv_core::error::{CoordError, ErrorKind};
use serde_json::json;
use thiserror::Error;
use tracing::error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body or parameters were malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Coord(e) => status_for(e.kind()),
        }
    }

    fn kind_str(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Coord(e) => e.kind().as_str(),
        }
    }
}

/// HTTP status for each error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Precondition => StatusCode::CONFLICT,
        ErrorKind::CyclicDependency => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }
        let message = match &self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Coord(e) => e.to_string(),
        };
        let body = Json(json!({
            "error": message,
            "kind": self.kind_str(),
        }));
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
