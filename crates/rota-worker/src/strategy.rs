use async_trait::async_trait;
use rota_scheduler::Job;

use crate::error::ActionError;

/// State of the external operation as seen by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalStatus {
    /// Still running. The string is the external state name; a change in it
    /// counts as progress.
    InProgress(String),
    Succeeded,
    /// Ended badly, or can no longer be found.
    Failed(String),
}

/// The action-specific half of job processing.
///
/// The runtime calls `initiate` once, then `poll` until the status is
/// terminal, then `finalize` on success. Implementations never report job
/// status themselves.
#[async_trait]
pub trait ActionStrategy: Send + Sync {
    /// Start the external operation and return a handle to poll it by.
    async fn initiate(&self, job: &Job) -> Result<String, ActionError>;

    async fn poll(&self, handle: &str) -> Result<ExternalStatus, ActionError>;

    /// Post-success work such as pruning old artifacts.
    async fn finalize(&self, job: &Job, handle: &str) -> Result<(), ActionError>;
}
