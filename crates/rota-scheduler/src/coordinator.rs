use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rota_core::config::PaginationConfig;
use rota_core::ActionPolicies;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::pagination::{resolve_limit, Page, PageRequest};
use crate::recurrence;
use crate::store::Store;
use crate::types::{
    clamp_storable, latest_storable, Job, JobChanges, JobFilter, JobGuard, JobStatus, Metadata,
    NewJob, ScheduleAdvance,
};

/// Queued candidates fetched per claim attempt.
const CLAIM_BATCH: u32 = 8;
/// Re-reads allowed when a status report races another writer.
const MAX_REPORT_ATTEMPTS: usize = 3;

/// `now + after`, saturating at the latest storable instant.
pub(crate) fn deadline(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or_else(latest_storable, clamp_storable)
}

/// A worker's heartbeat or terminal report.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: JobStatus,
    /// New soft deadline; `None` leaves the current one in place.
    pub timeout: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Reporting worker. When set, reports for an attempt claimed by
    /// someone else are ignored.
    pub worker_id: Option<String>,
}

impl StatusReport {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            timeout: None,
            error_message: None,
            worker_id: None,
        }
    }

    pub fn heartbeat(timeout: Option<DateTime<Utc>>) -> Self {
        Self {
            timeout,
            ..Self::new(JobStatus::Processing)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::new(JobStatus::Error)
        }
    }

    pub fn from_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Result of a status report. Neither variant is an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// The report was persisted; carries the updated job.
    Applied(Job),
    /// The job already moved on (reaped, finished, re-claimed); carries its
    /// current state, unchanged.
    Superseded(Job),
}

impl StatusUpdate {
    pub fn job(&self) -> &Job {
        match self {
            StatusUpdate::Applied(job) | StatusUpdate::Superseded(job) => job,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied(_))
    }
}

/// Status fields of a job as returned to polling callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub timeout: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Job dispatch: claiming, status reports and job accessors.
pub struct Coordinator {
    store: Arc<dyn Store>,
    policies: Arc<ActionPolicies>,
    pagination: PaginationConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        policies: Arc<ActionPolicies>,
        pagination: PaginationConfig,
    ) -> Self {
        Self {
            store,
            policies,
            pagination,
        }
    }

    pub fn policies(&self) -> &ActionPolicies {
        &self.policies
    }

    /// Claim the oldest queued job for `action`. `None` means nothing is
    /// waiting; it is not a failure.
    pub fn claim_next_job(&self, worker_id: &str, action: &str) -> Result<Option<Job>> {
        self.claim_next_job_at(worker_id, action, Utc::now())
    }

    pub fn claim_next_job_at(
        &self,
        worker_id: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let policy = self.policies.policy(action);
        let filter = JobFilter {
            status: Some(JobStatus::Queued),
            action: Some(action.to_string()),
            ..Default::default()
        };

        loop {
            let mut expired_any = false;
            for candidate in self.store.job_list(&filter, None, CLAIM_BATCH)? {
                // A retry that waited past the hard ceiling gets no further attempt.
                if candidate.hard_timeout.is_some_and(|hard| hard <= now) {
                    expired_any = true;
                    if self.store.job_conditional_update(
                        &candidate.id,
                        &JobGuard::Status(JobStatus::Queued),
                        &JobChanges::release(JobStatus::TimedOut),
                    )? {
                        warn!(
                            job_id = %candidate.id,
                            %action,
                            retry_count = candidate.retry_count,
                            "hard timeout passed while queued; job timed out"
                        );
                    }
                    continue;
                }

                // The hard ceiling is fixed on the first claim only; retries keep it.
                let first_claim = candidate.hard_timeout.is_none();
                let hard_timeout = candidate
                    .hard_timeout
                    .unwrap_or_else(|| deadline(now, policy.hard_timeout()));
                let timeout = deadline(now, policy.timeout()).min(hard_timeout);

                let changes = JobChanges {
                    status: Some(JobStatus::Processing),
                    worker_id: Some(Some(worker_id.to_string())),
                    timeout: Some(Some(timeout)),
                    hard_timeout: first_claim.then_some(Some(hard_timeout)),
                    ..Default::default()
                };
                if self.store.job_conditional_update(
                    &candidate.id,
                    &JobGuard::Status(JobStatus::Queued),
                    &changes,
                )? {
                    let job = self.store.job_get_by_id(&candidate.id)?;
                    info!(
                        job_id = %job.id,
                        %worker_id,
                        %action,
                        retry_count = job.retry_count,
                        "job claimed"
                    );
                    return Ok(Some(job));
                }
                debug!(job_id = %candidate.id, %worker_id, "claim lost to another worker");
            }
            // Expired candidates left the queue; look past them.
            if !expired_any {
                break;
            }
        }
        Ok(None)
    }

    /// Heartbeat or terminal report. `status` is case-insensitive.
    pub fn update_job_status(
        &self,
        job_id: &str,
        status: &str,
        timeout: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<StatusUpdate> {
        let status: JobStatus = status.parse().map_err(SchedulerError::Invalid)?;
        self.report_status(
            job_id,
            &StatusReport {
                status,
                timeout,
                error_message: error_message.map(str::to_string),
                worker_id: None,
            },
        )
    }

    pub fn report_status(&self, job_id: &str, report: &StatusReport) -> Result<StatusUpdate> {
        if report.status == JobStatus::Queued {
            return Err(SchedulerError::Invalid(
                "a job returns to QUEUED only through timeout enforcement".to_string(),
            ));
        }

        for _ in 0..MAX_REPORT_ATTEMPTS {
            let job = self.store.job_get_by_id(job_id)?;
            if is_stale(&job, report) {
                debug!(
                    %job_id,
                    current = %job.status,
                    reported = %report.status,
                    "status report superseded"
                );
                return Ok(StatusUpdate::Superseded(job));
            }

            let changes = match report.status {
                JobStatus::Processing => JobChanges {
                    // Heartbeats never push past the hard ceiling.
                    timeout: report
                        .timeout
                        .map(|t| Some(job.hard_timeout.map_or(t, |hard| t.min(hard)))),
                    ..Default::default()
                },
                JobStatus::Error => JobChanges {
                    error_message: Some(report.error_message.clone()),
                    ..JobChanges::release(JobStatus::Error)
                },
                other => JobChanges::release(other),
            };

            if self
                .store
                .job_conditional_update(job_id, &JobGuard::observed(&job), &changes)?
            {
                let updated = self.store.job_get_by_id(job_id)?;
                if report.status.is_terminal() {
                    info!(%job_id, status = %updated.status, "job finished");
                } else {
                    debug!(%job_id, timeout = ?updated.timeout, "heartbeat");
                }
                return Ok(StatusUpdate::Applied(updated));
            }
            debug!(%job_id, "status report raced another writer, re-reading");
        }

        warn!(%job_id, "status report gave up after repeated races");
        Ok(StatusUpdate::Superseded(self.store.job_get_by_id(job_id)?))
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<StatusUpdate> {
        self.report_status(job_id, &StatusReport::new(JobStatus::Cancelled))
    }

    /// Create a job straight from a schedule, advancing the schedule as
    /// materialization would.
    pub fn create_job(&self, schedule_id: &str) -> Result<Job> {
        let schedule = self.store.schedule_get_by_id(schedule_id)?;
        let now = Utc::now();
        let advance = ScheduleAdvance {
            next_run: recurrence::next_run(&schedule.recurrence, now)?,
            last_scheduled: Some(now),
        };
        let job = match self.store.schedule_materialize(&schedule, &advance)? {
            Some(job) => job,
            // A materializer advanced the schedule in between; the caller
            // still gets the job it asked for.
            None => self.store.job_create(&NewJob::from_schedule(&schedule))?,
        };
        info!(job_id = %job.id, %schedule_id, "job created");
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job> {
        self.store.job_get_by_id(job_id)
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobStatusView> {
        let job = self.store.job_get_by_id(job_id)?;
        Ok(JobStatusView {
            status: job.status,
            timeout: job.timeout,
            error_message: job.error_message,
        })
    }

    pub fn list_jobs(&self, filter: &JobFilter, page: &PageRequest) -> Result<Page<Job>> {
        let limit = resolve_limit(page.limit, &self.pagination)?;
        let jobs = self.store.job_list(filter, page.marker.as_deref(), limit)?;
        Ok(Page::new(jobs, limit, |j: &Job| j.id.as_str()))
    }

    /// Delete regardless of status.
    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        self.store.job_delete(job_id)?;
        info!(%job_id, "job deleted");
        Ok(())
    }

    pub fn list_job_metadata(&self, job_id: &str) -> Result<Metadata> {
        Ok(self.store.job_get_by_id(job_id)?.metadata)
    }

    pub fn get_job_metadata(&self, job_id: &str, key: &str) -> Result<String> {
        let mut metadata = self.list_job_metadata(job_id)?;
        metadata
            .remove(key)
            .ok_or_else(|| SchedulerError::not_found("metadata", key))
    }
}

/// A report that must not touch the job as it currently stands.
fn is_stale(job: &Job, report: &StatusReport) -> bool {
    if job.status.is_terminal() {
        return true;
    }
    if job.status == JobStatus::Queued {
        // Only cancellation applies to a queued job; anything else comes
        // from an attempt the reaper already took back.
        return report.status != JobStatus::Cancelled;
    }
    match (&report.worker_id, &job.worker_id) {
        (Some(reporter), Some(owner)) => reporter != owner,
        _ => false,
    }
}
