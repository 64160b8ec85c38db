//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **`SessionError`**: everything that can end a transcoding session. Errors are
//!   session-scoped: they terminate one websocket connection and its transcoder
//!   process, never the server.
//! - **`AppError`**: errors returned by the plain HTTP endpoints, converted into
//!   JSON error responses.
//!
//! ## Session Error Taxonomy:
//! | Variant | Raised by | Meaning |
//! |---|---|---|
//! | `Connection` | read loop / upgrader | handshake, read or protocol failure on the client socket |
//! | `InvalidFormat` | framer | container header signature, format tag or sample format rejected |
//! | `ProcessStart` | process manager | the transcoder executable could not be spawned |
//! | `InputPipe` | input forwarder | writing PCM into the transcoder failed |
//! | `OutputDelivery` | output forwarder | writing a transcoded chunk to the client failed |
//! | `ProcessExit` | coordinator | the transcoder ended its output and exited with a failure status |

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors that terminate a single session.
///
/// `Clone` so the same error can be stored in the termination signal and the
/// final session report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid container format: {0}")]
    InvalidFormat(String),

    #[error("failed to start transcoder: {0}")]
    ProcessStart(String),

    #[error("transcoder input pipe error: {0}")]
    InputPipe(String),

    #[error("output delivery error: {0}")]
    OutputDelivery(String),

    #[error("transcoder exited abnormally: {0}")]
    ProcessExit(String),
}

impl SessionError {
    /// Stable machine-readable code, sent to clients in the closing error frame.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Connection(_) => "connection_error",
            SessionError::InvalidFormat(_) => "invalid_format",
            SessionError::ProcessStart(_) => "process_start_error",
            SessionError::InputPipe(_) => "input_pipe_error",
            SessionError::OutputDelivery(_) => "output_delivery_error",
            SessionError::ProcessExit(_) => "process_exit_error",
        }
    }
}

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ValidationError**: A configuration update failed validation (400 errors)
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into HTTP responses.
///
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Port must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
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

/// JSON parsing errors are almost always caused by the client, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}
