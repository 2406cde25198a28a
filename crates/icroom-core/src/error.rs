// Error taxonomy for debate operations.

use thiserror::Error;

use crate::model::SessionStatus;

/// Errors surfaced synchronously to the connection that caused them.
#[derive(Debug, Error)]
pub enum DebateError {
    #[error("debate session not found: {0}")]
    SessionNotFound(String),

    #[error("debate session {0} is completed")]
    SessionClosed(String),

    #[error("debate session {id} is {status}, not ACTIVE")]
    SessionNotActive { id: String, status: SessionStatus },

    #[error("debate session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl DebateError {
    /// Stable machine-readable code sent in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            DebateError::SessionNotFound(_) => "session_not_found",
            DebateError::SessionClosed(_) => "session_closed",
            DebateError::SessionNotActive { .. } => "session_not_active",
            DebateError::InvalidTransition { .. } => "invalid_transition",
            DebateError::InvalidRequest(_) => "invalid_request",
            DebateError::Storage(_) => "storage_error",
        }
    }

    /// Text safe to show to a client. Storage failures are not described.
    pub fn client_message(&self) -> String {
        match self {
            DebateError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type DebateResult<T> = Result<T, DebateError>;
