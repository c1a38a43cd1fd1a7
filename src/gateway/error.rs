//! Error taxonomy for the gateway.
//!
//! Every failure surfaced to an HTTP caller or logged by a bridge is a
//! [`GatewayError`]. Each variant carries a stable machine-readable code and
//! maps to an HTTP status:
//!
//! | Variant | Code | Status |
//! |---------|------|--------|
//! | `InvalidRequest` | `invalid_request` | 400 |
//! | `NotFound` | `not_found` | 404 |
//! | `AgentUnreachable` | `agent_unreachable` | 503 |
//! | `SessionExists` | `session_exists` | 409 |
//! | `AlreadyAttached` | `already_attached` | 409 |
//! | `Protocol` | `protocol_error` | 400 |
//! | `Internal` | `internal` | 500 |
//!
//! Session creation reports a host without a live agent as `NotFound`, so
//! browsers see a 404 rather than a 503 for that case.

use poem::error::ResponseError;
use poem::http::StatusCode;
use poem::Response;
use thiserror::Error;

use super::codec::CodecError;

/// Errors produced by the registry, multiplexer, recorder and HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Malformed client input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown host, session or record.
    #[error("not found: {0}")]
    NotFound(String),

    /// The agent is not registered, its transport is gone, or its outbound
    /// buffer stayed full past the enqueue deadline.
    #[error("agent {0} is unreachable")]
    AgentUnreachable(String),

    /// A terminal session with this stream id already exists.
    #[error("session {0} already exists")]
    SessionExists(String),

    /// Another connection already owns this session's channel.
    #[error("session {0} is already attached")]
    AlreadyAttached(String),

    /// A wire-protocol frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Task delivery or persistence failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::AgentUnreachable(_) => "agent_unreachable",
            GatewayError::SessionExists(_) => "session_exists",
            GatewayError::AlreadyAttached(_) => "already_attached",
            GatewayError::Protocol(_) => "protocol_error",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl From<CodecError> for GatewayError {
    fn from(err: CodecError) -> Self {
        GatewayError::Protocol(err.to_string())
    }
}

impl ResponseError for GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AgentUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SessionExists(_) | GatewayError::AlreadyAttached(_) => {
                StatusCode::CONFLICT
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn as_response(&self) -> Response
    where
        Self: std::error::Error + Send + Sync + 'static,
    {
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        Response::builder()
            .status(self.status())
            .content_type("application/json")
            .body(body.to_string())
    }
}
