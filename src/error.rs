//! # Error Handling
//!
//! Two error families live here:
//!
//! - **BridgeError**: what can go wrong while bridging a call. Some variants are
//!   frame-level (log, drop the frame, keep the call up); the rest are
//!   connection-level and end the session.
//! - **AppError**: what the HTTP surface returns. Converted into a JSON error
//!   body by actix's `ResponseError` trait.
//!
//! ## Propagation policy:
//! Frame-level errors are handled where they happen (the leg adapter or the
//! pump that saw them). Connection-level errors always travel up to the
//! session orchestrator, which is the only place a session is torn down.
//! Nothing is retried inside the bridge.

use crate::bridge::Leg;
use crate::codec::CodecError;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors raised while bridging one call.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A single envelope or payload could not be understood.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The upstream speech endpoint could not be dialed or refused the handshake.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// One of the two sockets closed, normally or not.
    #[error("{leg} leg disconnected: {reason}")]
    LegDisconnected { leg: Leg, reason: String },

    /// A sample block failed to convert.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The registry refused a new session.
    #[error("maximum concurrent sessions ({0}) reached")]
    CapacityExceeded(usize),

    /// A session with this id is already registered.
    #[error("session id '{0}' already registered")]
    DuplicateSession(String),
}

impl BridgeError {
    /// Frame-level errors: the frame is dropped and the call continues.
    ///
    /// ## Example:
    /// ```ignore
    /// let err = BridgeError::MalformedFrame("bad base64".to_string());
    /// assert!(err.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BridgeError::MalformedFrame(_) | BridgeError::Codec(_))
    }

    pub fn upstream_closed(reason: impl Into<String>) -> Self {
        BridgeError::LegDisconnected {
            leg: Leg::Upstream,
            reason: reason.into(),
        }
    }
}

/// Errors returned by the HTTP endpoints.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: client sent invalid data (400)
/// - **NotFound**: unknown session or resource (404)
/// - **ValidationError**: input failed validation (400)
/// - **ServiceUnavailable**: the bridge is at its session limit (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ValidationError(String),
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// JSON error body shared by every endpoint:
///
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session 5f0c… not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
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

/// Session creation failures surface to the upgrade handler through this.
impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::CapacityExceeded(_) => AppError::ServiceUnavailable(err.to_string()),
            BridgeError::MalformedFrame(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}
