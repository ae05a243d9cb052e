use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::recurrence;
use crate::store::Store;
use crate::types::ScheduleAdvance;

/// Shortest tick period for the background loops.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Counters for one materializer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs created by this pass.
    pub created: usize,
    /// Due schedules another materializer advanced first.
    pub raced: usize,
    /// Schedules skipped because of an error; retried next pass.
    pub failed: usize,
}

/// Turns due schedules into queued jobs.
///
/// Safe to run in several processes at once: a schedule is advanced with a
/// conditional update on the `next_run` that was read, and only the winner
/// creates the job.
pub struct Materializer {
    store: Arc<dyn Store>,
    interval: Duration,
}

impl Materializer {
    /// `interval` is raised to at least [`MIN_INTERVAL`].
    pub fn new(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    /// One pass over every schedule due at `now`.
    ///
    /// Only listing due schedules can fail the pass; a failure on a single
    /// schedule is logged and the pass moves on.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        for schedule in self.store.schedule_get_due(now)? {
            let next_run = match recurrence::next_run(&schedule.recurrence, now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, "cannot compute next run: {e}");
                    report.failed += 1;
                    continue;
                }
            };
            let advance = ScheduleAdvance {
                next_run,
                last_scheduled: Some(now),
            };

            match self.store.schedule_materialize(&schedule, &advance) {
                Ok(Some(job)) => {
                    info!(
                        schedule_id = %schedule.id,
                        job_id = %job.id,
                        action = %job.action,
                        %next_run,
                        "job materialized"
                    );
                    report.created += 1;
                }
                Ok(None) => {
                    debug!(schedule_id = %schedule.id, "schedule already advanced elsewhere");
                    report.raced += 1;
                }
                Err(e) => {
                    error!(schedule_id = %schedule.id, "materialization failed: {e}");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Tick every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "materializer started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick() {
                        Ok(r) if r != TickReport::default() => {
                            debug!(
                                created = r.created,
                                raced = r.raced,
                                failed = r.failed,
                                "materializer pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("materializer tick error: {e}"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("materializer shutting down");
                    break;
                }
            }
        }
    }
}
