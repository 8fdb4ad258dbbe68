// Scheduler error types, mapped onto the shared taxonomy at the HTTP edge.

use loomline_contracts::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SchedulerError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        SchedulerError::Conflict(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        SchedulerError::Auth(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Validation(_) => ErrorKind::ValidationError,
            SchedulerError::NotFound(_) => ErrorKind::NotFound,
            SchedulerError::Conflict(_) => ErrorKind::Conflict,
            SchedulerError::Auth(_) => ErrorKind::AuthError,
            SchedulerError::State(_) => ErrorKind::StateError,
            SchedulerError::Internal(_) => ErrorKind::Internal,
        }
    }
}
