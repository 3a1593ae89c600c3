//! Error type shared by every coordinator operation.

use thiserror::Error;

/// Result alias used by every coordinator operation.
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors delivered to the caller of a coordinator operation.
///
/// None of these terminate the coordinator; each one is reported on the reply
/// of the operation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The coordinator, backing store or quota arbiter is not available.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The quota arbiter denied the space request.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The requested version is lower than the stored version.
    #[error("version error: {0}")]
    Version(String),
    /// A unique-key constraint would be violated.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The operation referenced something that is not tracked.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl DbError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        DbError::InvalidState(msg.into())
    }

    pub(crate) fn unknown(msg: impl Into<String>) -> Self {
        DbError::Unknown(msg.into())
    }

    pub(crate) fn constraint(msg: impl Into<String>) -> Self {
        DbError::Constraint(msg.into())
    }

    pub(crate) fn quota_exceeded(task: &str) -> Self {
        DbError::QuotaExceeded(format!(
            "failed to {task} in database because not enough space for domain"
        ))
    }

    pub(crate) fn user_delete() -> Self {
        DbError::Unknown("database deleted by request of the user".into())
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::InvalidState(_) => "InvalidState",
            DbError::QuotaExceeded(_) => "QuotaExceeded",
            DbError::Version(_) => "VersionError",
            DbError::Constraint(_) => "ConstraintError",
            DbError::Unknown(_) => "UnknownError",
        }
    }
}
