use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rota_core::ActionPolicies;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::materializer::MIN_INTERVAL;
use crate::store::Store;
use crate::types::{Job, JobChanges, JobGuard, JobStatus};

/// Counters for one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: usize,
    pub timed_out: usize,
    /// Expired jobs that changed underneath us (heartbeat, report, other reaper).
    pub skipped: usize,
}

/// Enforces soft and hard deadlines on processing jobs.
pub struct Reaper {
    store: Arc<dyn Store>,
    policies: Arc<ActionPolicies>,
    interval: Duration,
}

impl Reaper {
    /// `interval` is raised to at least [`MIN_INTERVAL`].
    pub fn new(store: Arc<dyn Store>, policies: Arc<ActionPolicies>, interval: Duration) -> Self {
        Self {
            store,
            policies,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn reap(&self) -> Result<ReapReport> {
        self.reap_at(Utc::now())
    }

    /// Resolve every processing job whose deadline passed by `now`.
    ///
    /// Past the hard timeout a job is `TIMED_OUT` outright. Past the soft
    /// timeout it is requeued while retries remain, else `TIMED_OUT`. Each
    /// change is conditional on the attempt that was read, so a heartbeat
    /// landing in between wins.
    pub fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();

        for job in self.store.job_get_expired(now)? {
            let (changes, reason) = self.resolve(&job, now);
            match self
                .store
                .job_conditional_update(&job.id, &JobGuard::observed(&job), &changes)
            {
                Ok(true) if changes.status == Some(JobStatus::Queued) => {
                    info!(
                        job_id = %job.id,
                        worker_id = ?job.worker_id,
                        retry_count = job.retry_count + 1,
                        "{reason}; job requeued"
                    );
                    report.requeued += 1;
                }
                Ok(true) => {
                    warn!(job_id = %job.id, worker_id = ?job.worker_id, "{reason}; job timed out");
                    report.timed_out += 1;
                }
                Ok(false) => {
                    debug!(job_id = %job.id, "expired job changed before it could be reaped");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(job_id = %job.id, "reaping failed: {e}");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    fn resolve(&self, job: &Job, now: DateTime<Utc>) -> (JobChanges, &'static str) {
        if job.hard_timeout.is_some_and(|hard| hard <= now) {
            return (JobChanges::release(JobStatus::TimedOut), "hard timeout passed");
        }
        let policy = self.policies.policy(&job.action);
        if job.retry_count < policy.max_retry {
            (JobChanges::requeue(job.retry_count + 1), "soft timeout passed")
        } else {
            (
                JobChanges::release(JobStatus::TimedOut),
                "soft timeout passed with retries exhausted",
            )
        }
    }

    /// Reap every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "reaper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reap() {
                        error!("reaper pass error: {e}");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("reaper shutting down");
                    break;
                }
            }
        }
    }
}
