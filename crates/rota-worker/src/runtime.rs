use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rota_core::config::WorkerConfig;
use rota_core::{ActionPolicies, ActionPolicy};
use rota_scheduler::materializer::MIN_INTERVAL;
use rota_scheduler::{Job, JobStatus, StatusReport, StatusUpdate};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::JobClient;
use crate::error::{ActionError, Result, WorkerError};
use crate::registry::StrategyRegistry;
use crate::strategy::{ActionStrategy, ExternalStatus};

/// How a single job ended from this worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Reported `DONE`.
    Done,
    /// Reported `ERROR` with this message.
    Error(String),
    /// The local deadline passed first; timeout enforcement is left to the
    /// reaper.
    Abandoned,
    /// The coordinator no longer considers this attempt ours.
    Superseded,
    /// Shutdown requested mid-job. Nothing was reported.
    Cancelled,
}

/// Claims jobs for every registered action and drives each one through its
/// strategy, heartbeating as it goes.
pub struct ProcessorRuntime {
    worker_id: String,
    client: Arc<dyn JobClient>,
    registry: StrategyRegistry,
    policies: Arc<ActionPolicies>,
    poll_interval: Duration,
    idle_interval: Duration,
}

impl ProcessorRuntime {
    pub fn new(
        worker_id: impl Into<String>,
        client: Arc<dyn JobClient>,
        registry: StrategyRegistry,
        policies: Arc<ActionPolicies>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            client,
            registry,
            policies,
            poll_interval: Duration::from_secs(config.poll_interval_secs).max(MIN_INTERVAL),
            idle_interval: Duration::from_secs(config.idle_interval_secs).max(MIN_INTERVAL),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process jobs until `cancel` fires. Sleeps `idle_interval`
    /// whenever a full round over the registered actions found nothing.
    pub async fn run(&self, cancel: CancellationToken) {
        let actions = self.registry.actions();
        info!(worker_id = %self.worker_id, ?actions, "worker started");

        while !cancel.is_cancelled() {
            let mut claimed_any = false;
            for action in &actions {
                if cancel.is_cancelled() {
                    break;
                }
                match self.client.claim_next_job(&self.worker_id, action).await {
                    Ok(Some(job)) => {
                        claimed_any = true;
                        let job_id = job.id.clone();
                        match self.process_job(job, &cancel).await {
                            Ok(outcome) => debug!(%job_id, ?outcome, "job processed"),
                            Err(e) => error!(
                                %job_id,
                                worker_id = %self.worker_id,
                                "job processing failed: {e}"
                            ),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!(worker_id = %self.worker_id, %action, "claim failed: {e}"),
                }
            }

            if !claimed_any {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_interval) => {}
                }
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Drive one claimed job to an outcome.
    ///
    /// The runtime never reports `TIMED_OUT`: when its local view of the
    /// deadline runs out it stops and lets the reaper decide.
    pub async fn process_job(&self, job: Job, cancel: &CancellationToken) -> Result<JobOutcome> {
        let Some(strategy) = self.registry.get(&job.action) else {
            let message = WorkerError::UnknownAction(job.action.clone()).to_string();
            return self.finish(&job, StatusReport::error(message)).await;
        };
        let policy = self.policies.policy(&job.action).clone();
        let mut deadline = job
            .timeout
            .unwrap_or_else(|| fresh_deadline(Utc::now(), &policy));
        let mut local_deadline = to_local(deadline);

        info!(
            job_id = %job.id,
            worker_id = %self.worker_id,
            action = %job.action,
            "processing job"
        );
        if Instant::now() >= local_deadline {
            warn!(
                job_id = %job.id,
                worker_id = %self.worker_id,
                "job claimed past its deadline, abandoning"
            );
            return Ok(JobOutcome::Abandoned);
        }

        let handle = loop {
            match strategy.initiate(&job).await {
                Ok(handle) => break handle,
                Err(ActionError::Transient(e)) => {
                    warn!(job_id = %job.id, "initiate failed, retrying: {e}");
                }
                Err(ActionError::Fatal(e)) => {
                    return self
                        .finish(&job, StatusReport::error(format!("initiate failed: {e}")))
                        .await;
                }
            }
            if let Some(outcome) = self.pause(&job, cancel, local_deadline).await {
                return Ok(outcome);
            }
        };
        debug!(job_id = %job.id, %handle, "external operation started");

        // The operation is underway: restart the soft deadline.
        match self
            .heartbeat(&job, Some(fresh_deadline(Utc::now(), &policy)))
            .await?
        {
            Some(timeout) => {
                deadline = timeout;
                local_deadline = to_local(timeout);
            }
            None => return Ok(JobOutcome::Superseded),
        }

        loop {
            if let Some(outcome) = self.pause(&job, cancel, local_deadline).await {
                return Ok(outcome);
            }

            match strategy.poll(&handle).await {
                Ok(ExternalStatus::InProgress(state)) => {
                    debug!(job_id = %job.id, %handle, %state, "external operation in progress");
                    // Resubmit a timeout only when the current one is about
                    // to lapse and the hard ceiling still leaves room.
                    let remaining = local_deadline.saturating_duration_since(Instant::now());
                    let extend = remaining <= self.poll_interval
                        && job.hard_timeout.map_or(true, |hard| deadline < hard);
                    let timeout = extend.then(|| fresh_deadline(Utc::now(), &policy));

                    match self.heartbeat(&job, timeout).await? {
                        Some(t) if timeout.is_some() => {
                            debug!(job_id = %job.id, timeout = %t, "soft deadline extended");
                            deadline = t;
                            local_deadline = to_local(t);
                        }
                        Some(_) => {}
                        None => return Ok(JobOutcome::Superseded),
                    }
                }
                Ok(ExternalStatus::Succeeded) => {
                    return self.complete(&job, strategy.as_ref(), &handle).await;
                }
                Ok(ExternalStatus::Failed(reason)) => {
                    return self.finish(&job, StatusReport::error(reason)).await;
                }
                Err(ActionError::Transient(e)) => {
                    warn!(job_id = %job.id, %handle, "poll failed, retrying: {e}");
                }
                Err(ActionError::Fatal(e)) => {
                    return self
                        .finish(&job, StatusReport::error(format!("poll failed: {e}")))
                        .await;
                }
            }
        }
    }

    async fn complete(
        &self,
        job: &Job,
        strategy: &dyn ActionStrategy,
        handle: &str,
    ) -> Result<JobOutcome> {
        match strategy.finalize(job, handle).await {
            Ok(()) => self.finish(job, StatusReport::new(JobStatus::Done)).await,
            Err(e) => {
                self.finish(job, StatusReport::error(format!("finalize failed: {e}")))
                    .await
            }
        }
    }

    /// Sleep one poll interval. `Some` means stop processing.
    async fn pause(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        local_deadline: Instant,
    ) -> Option<JobOutcome> {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    "shutdown requested, leaving job to the reaper"
                );
                return Some(JobOutcome::Cancelled);
            }
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
        if Instant::now() >= local_deadline {
            warn!(
                job_id = %job.id,
                worker_id = %self.worker_id,
                "job deadline passed locally, abandoning"
            );
            return Some(JobOutcome::Abandoned);
        }
        None
    }

    /// `Some(current soft deadline)` while the attempt is still ours.
    async fn heartbeat(
        &self,
        job: &Job,
        timeout: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        let report = StatusReport::heartbeat(timeout).from_worker(self.worker_id.as_str());
        match self.client.update_job_status(&job.id, report).await? {
            StatusUpdate::Applied(current) => Ok(current.timeout),
            StatusUpdate::Superseded(current) => {
                warn!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    status = %current.status,
                    "job taken away mid-processing"
                );
                Ok(None)
            }
        }
    }

    async fn finish(&self, job: &Job, report: StatusReport) -> Result<JobOutcome> {
        let outcome = match (&report.status, &report.error_message) {
            (JobStatus::Error, message) => JobOutcome::Error(message.clone().unwrap_or_default()),
            _ => JobOutcome::Done,
        };
        let report = report.from_worker(self.worker_id.as_str());

        match self.client.update_job_status(&job.id, report).await? {
            StatusUpdate::Applied(current) => {
                info!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    status = %current.status,
                    "job reported"
                );
                Ok(outcome)
            }
            StatusUpdate::Superseded(current) => {
                warn!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    status = %current.status,
                    "final report superseded"
                );
                Ok(JobOutcome::Superseded)
            }
        }
    }
}

fn fresh_deadline(now: DateTime<Utc>, policy: &ActionPolicy) -> DateTime<Utc> {
    chrono::Duration::from_std(policy.timeout())
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Map a wall-clock deadline onto the monotonic clock.
fn to_local(deadline: DateTime<Utc>) -> Instant {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let now = Instant::now();
    now.checked_add(remaining)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);
