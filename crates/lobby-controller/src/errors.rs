//! Coordinator error types.
//!
//! Every error here is recovered locally: the offending connection receives a
//! single scoped `error` event with a client-safe message and session state is
//! left untouched. Internal details are logged server-side but not exposed.

use thiserror::Error;

/// Session coordinator error type.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The named session does not exist.
    #[error("Session not found")]
    SessionNotFound,

    /// A doctor-only action was attempted by a connection that is not the
    /// session's doctor.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The target patient is not in the expected set.
    #[error("Patient not found: {0}")]
    PatientNotFound(String),

    /// Role or session binding conflict (e.g. a patient connection acting as
    /// a doctor, or a connection joining a second session).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Inbound event `type` is not part of the protocol.
    #[error("Unknown message type: {0}")]
    UnknownEventType(String),

    /// Inbound payload was not valid JSON or is missing required fields.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Actor channel failure (coordinator unavailable).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CoordinatorError::SessionNotFound => "Session not found".to_string(),
            CoordinatorError::Unauthorized(msg) => format!("Unauthorized: {msg}"),
            CoordinatorError::PatientNotFound(msg) | CoordinatorError::Conflict(msg) => msg.clone(),
            CoordinatorError::UnknownEventType(_) => "Unknown message type".to_string(),
            CoordinatorError::MalformedPayload(_) => "Error processing message".to_string(),
            CoordinatorError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// The offending event `type`, echoed back on unknown-type errors.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        match self {
            CoordinatorError::UnknownEventType(t) => Some(t),
            _ => None,
        }
    }
}
