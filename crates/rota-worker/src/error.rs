use rota_scheduler::SchedulerError;
use thiserror::Error;

/// Failure of an external operation driven by an action strategy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// Worth retrying while the job's time budget lasts (network blip,
    /// rate limiting, 5xx).
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help; the job ends in `ERROR`.
    #[error("{0}")]
    Fatal(String),
}

impl ActionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Transient(_))
    }
}

/// Errors from the worker runtime's own plumbing.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The coordinator rejected or failed a call.
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] SchedulerError),

    /// No strategy is registered for a claimed job's action.
    #[error("No strategy registered for action: {0}")]
    UnknownAction(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
