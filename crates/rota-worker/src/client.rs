use async_trait::async_trait;
use rota_scheduler::{Coordinator, Job, StatusReport, StatusUpdate};

use crate::error::Result;

/// What a worker needs from the coordinator. Implemented in-process for
/// [`Coordinator`]; a remote client would implement it over the wire.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// `None` when nothing is queued for `action`.
    async fn claim_next_job(&self, worker_id: &str, action: &str) -> Result<Option<Job>>;

    async fn update_job_status(&self, job_id: &str, report: StatusReport) -> Result<StatusUpdate>;
}

#[async_trait]
impl JobClient for Coordinator {
    async fn claim_next_job(&self, worker_id: &str, action: &str) -> Result<Option<Job>> {
        Ok(Coordinator::claim_next_job(self, worker_id, action)?)
    }

    async fn update_job_status(&self, job_id: &str, report: StatusReport) -> Result<StatusUpdate> {
        Ok(self.report_status(job_id, &report)?)
    }
}
