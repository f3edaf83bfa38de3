//! Error types for the ChatPulse server.
//!
//! [`ServerError`] is the top-level error. It converts into an HTTP response
//! with a JSON body of the form `{"error": "...", "code": "..."}`, so route
//! handlers can return `Result<_, ServerError>` directly.

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use chatpulse_monitor::MonitorError;

use crate::config::ConfigError;

/// Top-level error type for the ChatPulse server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// The embedded monitor failed to start or stop.
    Monitor(MonitorError),

    /// A requested resource does not exist.
    NotFound(String),

    /// Malformed request data.
    Validation(String),

    /// WebSocket connection or protocol error.
    WebSocket(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Monitor(err) => write!(f, "monitor error: {err}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::WebSocket(msg) => write!(f, "websocket error: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Monitor(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<MonitorError> for ServerError {
    fn from(err: MonitorError) -> Self {
        Self::Monitor(err)
    }
}

impl ServerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Validation(_))
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP status used when this error reaches a client.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::Monitor(_) | Self::WebSocket(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Monitor(_) => "monitor_error",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "invalid_request",
            Self::WebSocket(_) => "websocket_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details stay in the logs.
        let error = if self.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error,
                code: self.code(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            ServerError::not_found("conversation abc").to_string(),
            "not found: conversation abc"
        );
        assert_eq!(
            ServerError::validation("bad channel").to_string(),
            "validation error: bad channel"
        );
        assert_eq!(
            ServerError::internal("boom").to_string(),
            "internal server error: boom"
        );
    }

    #[test]
    fn classification() {
        assert!(ServerError::not_found("x").is_client_error());
        assert!(ServerError::validation("x").is_client_error());
        assert!(ServerError::internal("x").is_server_error());
        assert!(ServerError::websocket("x").is_server_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ServerError::validation("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServerError::internal("x").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn config_error_converts_with_source() {
        let parse_err = "abc".parse::<u16>().unwrap_err();
        let err: ServerError = ConfigError::InvalidPort(parse_err).into();

        assert!(matches!(err, ServerError::Config(_)));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("configuration error"));
    }

    #[test]
    fn into_response_uses_status() {
        let response = ServerError::not_found("conversation x").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ServerError::internal("secret detail").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
