use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// A lost compare-and-swap has no variant: conditional updates report it
/// as `false`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A referenced schedule, job, metadata key or pagination marker is absent.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Malformed input, rejected before any mutation.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Duplicate key (e.g. a metadata key that already exists).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The recurrence fields cannot produce a next run.
    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),
}

impl SchedulerError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SchedulerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Short error code string for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::Invalid(_) => "INVALID",
            SchedulerError::Conflict(_) => "CONFLICT",
            SchedulerError::InvalidRecurrence(_) => "INVALID_RECURRENCE",
        }
    }

    /// HTTP status the API boundary maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulerError::NotFound { .. } => 404,
            SchedulerError::Invalid(_) | SchedulerError::InvalidRecurrence(_) => 400,
            SchedulerError::Conflict(_) => 409,
            SchedulerError::Database(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
