//! Error types for the request-lifecycle engine.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use super::context::Dialect;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("upstream returned {status}: {body}")]
    UpstreamHttp { status: u16, body: String },

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("{0}")]
    AllBackendsFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// HTTP status code 499 (client closed request) is not in the registry,
/// so it is built from a raw u16.
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ClientDisconnected => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ProxyError::UpstreamHttp { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::AllBackendsFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyError::AuthFailed(_) => "authentication_error",
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::ClientDisconnected => "client_disconnected",
            ProxyError::UpstreamHttp { .. } => "upstream_error",
            ProxyError::UpstreamTimeout => "timeout_error",
            ProxyError::AllBackendsFailed(_) => "overloaded_error",
            ProxyError::Internal(_) => "api_error",
        }
    }

    /// Short name used when no HTTP status can be extracted from a failure.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ProxyError::AuthFailed(_) => "AuthFailed",
            ProxyError::BadRequest(_) => "BadRequest",
            ProxyError::ClientDisconnected => "ClientDisconnected",
            ProxyError::UpstreamHttp { .. } => "UpstreamHTTPError",
            ProxyError::UpstreamTimeout => "UpstreamTimeout",
            ProxyError::AllBackendsFailed(_) => "AllBackendsFailed",
            ProxyError::Internal(_) => "Internal",
        }
    }

    /// Render in the caller's wire dialect.
    pub fn into_dialect_response(self, dialect: Dialect) -> Response {
        let status = self.status();
        let message = self.to_string();
        crate::logger::error(
            "handler",
            &format!("returning error: status={}, message={}", status.as_u16(), message),
        );
        let body = match dialect {
            Dialect::Anthropic => json!({
                "type": "error",
                "error": { "type": self.kind(), "message": message }
            }),
            Dialect::OpenAi => json!({
                "error": { "type": self.kind(), "message": message, "code": null }
            }),
        };
        super::json_response(status, &body)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.into_dialect_response(Dialect::OpenAi)
    }
}
