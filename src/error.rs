//! # Error Handling
//!
//! This module defines the error types used across the fleet backend and how
//! they're converted to HTTP responses for the control-plane API.
//!
//! ## Error Categories:
//! - **Config**: Device registry / configuration problems (fatal at startup)
//! - **Connect**: A device connection attempt failed or timed out (recoverable,
//!   the connection retries after its configured delay)
//! - **Protocol**: A device sent a malformed message (recoverable, the message
//!   is dropped and the session continues)
//! - **Transport**: Send/receive failed mid-session (ends the current session,
//!   recoverable via reconnect)
//! - **NotFound**: A request referenced a device that isn't managed
//! - **Internal**: Anything else (handler faults, server-side problems)
//!
//! Connection-level errors (Connect/Protocol/Transport) normally stay inside
//! the supervisor and never reach an HTTP client; the ResponseError mapping
//! exists so handlers can bubble any AppError without special-casing.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the fleet backend.
///
/// Each variant carries a human-readable message. The variant decides both the
/// retry behavior inside the supervisor and the HTTP status code when the
/// error surfaces through the API.
#[derive(Debug)]
pub enum AppError {
    /// Device registry or application configuration problems
    Config(String),

    /// A transport connect attempt failed or timed out
    Connect(String),

    /// A device sent a message we couldn't parse
    Protocol(String),

    /// Send/receive failure on an established connection
    Transport(String),

    /// Requested device is not managed by the supervisor
    NotFound(String),

    /// Internal server errors (handler failures, lock poisoning, etc.)
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Connect(msg) => write!(f, "Connect error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into the JSON error envelope returned by the API.
///
/// ## HTTP Status Code Mapping:
/// - Config/Internal → 500 (Internal Server Error)
/// - Protocol → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - Connect/Transport → 502 (Bad Gateway - the upstream device is the problem)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Device 'kitchen' not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Config(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Connect(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "connect_error",
                msg.clone(),
            ),
            AppError::Protocol(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "protocol_error",
                msg.clone(),
            ),
            AppError::Transport(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "transport_error",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// Allows general-purpose anyhow errors throughout the codebase to become
/// AppError::Internal when they cross into a handler boundary.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON (de)serialization failures are protocol errors: they come from
/// malformed payloads, either on the wire or in an API request body.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Protocol(format!("JSON parsing error: {}", err))
    }
}

/// Configuration loading can fail for various reasons (missing files, invalid
/// syntax, failed validation). These are startup-time configuration errors.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// WebSocket-level failures map onto the transport category; whether they end
/// up terminating a session or just one connect attempt is decided by the
/// connection state machine, not here.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;
