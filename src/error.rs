//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **`RelayError`**: everything that can go wrong while routing one client
//!   event (unknown connection, out-of-order commit, downstream failure, ...).
//!   These never terminate the process. They are turned into an
//!   acknowledgment frame and sent back to the client that caused them.
//! - **`AppError`**: errors returned by the HTTP handlers, converted into
//!   JSON responses through actix's `ResponseError` trait.
//!
//! ## Wire format
//! Every `RelayError` maps to a stable, machine-readable [`ErrorKind`]
//! (`snake_case` on the wire), so clients can branch on the kind without
//! parsing messages.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::session::{ConnectionId, SessionState};

/// Machine-readable classification of a relay error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateConnection,
    UnknownConnection,
    UnknownEvent,
    OutOfOrderEvent,
    SessionClosed,
    NothingToSummarize,
    DownstreamFailure,
    InvalidPayload,
    SessionLimitReached,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DuplicateConnection => "duplicate_connection",
            ErrorKind::UnknownConnection => "unknown_connection",
            ErrorKind::UnknownEvent => "unknown_event",
            ErrorKind::OutOfOrderEvent => "out_of_order_event",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::NothingToSummarize => "nothing_to_summarize",
            ErrorKind::DownstreamFailure => "downstream_failure",
            ErrorKind::InvalidPayload => "invalid_payload",
            ErrorKind::SessionLimitReached => "session_limit_reached",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while registering sessions or routing a single event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("connection '{0}' is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("no session for connection '{0}'")]
    UnknownConnection(ConnectionId),

    #[error("unrecognized event '{0}'")]
    UnknownEvent(String),

    #[error("event '{event}' is not allowed while session is {state}")]
    OutOfOrderEvent {
        event: &'static str,
        state: SessionState,
    },

    #[error("session '{0}' is closed")]
    SessionClosed(ConnectionId),

    #[error("session '{0}' has no transcript to summarize")]
    NothingToSummarize(ConnectionId),

    #[error("downstream call failed: {0}")]
    DownstreamFailure(String),

    #[error("invalid payload for '{event}': {reason}")]
    InvalidPayload { event: &'static str, reason: String },

    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimitReached(usize),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::DuplicateConnection(_) => ErrorKind::DuplicateConnection,
            RelayError::UnknownConnection(_) => ErrorKind::UnknownConnection,
            RelayError::UnknownEvent(_) => ErrorKind::UnknownEvent,
            RelayError::OutOfOrderEvent { .. } => ErrorKind::OutOfOrderEvent,
            RelayError::SessionClosed(_) => ErrorKind::SessionClosed,
            RelayError::NothingToSummarize(_) => ErrorKind::NothingToSummarize,
            RelayError::DownstreamFailure(_) => ErrorKind::DownstreamFailure,
            RelayError::InvalidPayload { .. } => ErrorKind::InvalidPayload,
            RelayError::SessionLimitReached(_) => ErrorKind::SessionLimitReached,
        }
    }
}

/// Convenience alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors returned by the HTTP API.
///
/// ## Error Categories:
/// - **BadRequest**: Client sent invalid data (400)
/// - **NotFound**: Requested resource doesn't exist (404)
/// - **ValidationError**: Data validation failed (400)
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
        }
    }
}

/// Renders every error as:
///
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Server port cannot be 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::OutOfOrderEvent).unwrap();
        assert_eq!(json, "\"out_of_order_event\"");
        assert_eq!(ErrorKind::OutOfOrderEvent.as_str(), "out_of_order_event");
    }

    #[test]
    fn test_relay_error_kind_mapping() {
        let err = RelayError::OutOfOrderEvent {
            event: "buffer.commit",
            state: SessionState::Idle,
        };
        assert_eq!(err.kind(), ErrorKind::OutOfOrderEvent);
        assert_eq!(
            err.to_string(),
            "event 'buffer.commit' is not allowed while session is idle"
        );

        let err = RelayError::UnknownConnection(ConnectionId::from("c9"));
        assert_eq!(err.kind(), ErrorKind::UnknownConnection);
        assert!(err.to_string().contains("c9"));
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_json_errors_are_bad_requests() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().starts_with("Bad request: JSON parsing error"));
    }
}
