//! Error types.
//!
//! `ConnectError` is the classified failure returned by the lifecycle core.
//! It is `Clone` because a single failed attempt is observed by every caller
//! that was waiting on the same identity. `AppError` is the HTTP-facing error
//! of the service layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::response::ApiResponse;

/// Failure class surfaced to the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or incomplete description. Never reaches the network.
    Validation,
    /// Credentials rejected by the SSH or database server.
    Authentication,
    /// Host unreachable or connection dropped.
    Network,
    /// A network step did not finish in time.
    Timeout,
    /// Handshake or algorithm negotiation failure.
    Protocol,
    /// The SSH tunnel this connection depended on was force-closed.
    TunnelClosed,
    /// Client library failure not otherwise classified.
    Connection,
}

impl ErrorKind {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Authentication => "AUTHENTICATION_ERROR",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::Protocol => "PROTOCOL_ERROR",
            ErrorKind::TunnelClosed => "TUNNEL_CLOSED",
            ErrorKind::Connection => "CONNECTION_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::TunnelClosed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Network | ErrorKind::Protocol | ErrorKind::Connection => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

/// Classified connection failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Invalid connection description: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SSH tunnel closed: {0}")]
    TunnelClosed(String),

    #[error("Connection failed: {0}")]
    Connection(String),
}

impl ConnectError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn tunnel_closed(msg: impl Into<String>) -> Self {
        Self::TunnelClosed(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Validation(_) => ErrorKind::Validation,
            ConnectError::Authentication(_) => ErrorKind::Authentication,
            ConnectError::Network(_) => ErrorKind::Network,
            ConnectError::Timeout(_) => ErrorKind::Timeout,
            ConnectError::Protocol(_) => ErrorKind::Protocol,
            ConnectError::TunnelClosed(_) => ErrorKind::TunnelClosed,
            ConnectError::Connection(_) => ErrorKind::Connection,
        }
    }

    /// Whether the transport under a live handle is gone and the handle must be dropped.
    pub fn is_fatal_transport(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::TunnelClosed
        )
    }

    /// The one outward-facing error shape.
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Error shape that crosses the core boundary: kind plus human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),
}

/// Result alias for the service layer.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Connect(err) => (err.kind().status(), err.kind().code()),
            AppError::ConnectionNotFound(_) => (StatusCode::NOT_FOUND, "CONNECTION_NOT_FOUND"),
            AppError::TunnelNotFound(_) => (StatusCode::NOT_FOUND, "TUNNEL_NOT_FOUND"),
        };
        if status.is_server_error() {
            tracing::warn!(code, error = %self, "request failed");
        }
        (status, Json(ApiResponse::err(code, self.to_string()))).into_response()
    }
}
