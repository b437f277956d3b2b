//! Service-specific error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay::RelayError;
use thiserror::Error;

/// Per-request failures the proxy answers itself.
///
/// Upstream non-2xx answers are not errors: they are relayed as-is.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("missing or invalid access key")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("no route for {0}")]
    NotFound(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::Unauthorized => StatusCode::UNAUTHORIZED,
            RequestError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RequestError::NotFound(_) => StatusCode::NOT_FOUND,
            RequestError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self, request_id: &str) -> Response {
        error_response(self.status(), &self.to_string(), request_id)
    }
}

impl From<RelayError> for RequestError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::UnsupportedEndpoint(_) | RelayError::InvalidRequest(_) => {
                RequestError::BadRequest(err.to_string())
            }
            RelayError::Transport(_) | RelayError::Stream { .. } => {
                RequestError::Upstream(err.to_string())
            }
        }
    }
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
