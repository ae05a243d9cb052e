//! Persistence contract the engine is written against.
//!
//! Every mutation another process may race is a conditional update that
//! returns `Ok(false)` when its precondition no longer holds. A `false` is
//! not a failure: somebody else already resolved that entity.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Job, JobChanges, JobFilter, JobGuard, Metadata, NewJob, NewSchedule, Schedule,
    ScheduleAdvance, ScheduleChanges, ScheduleFilter,
};

pub trait Store: Send + Sync {
    // --- schedules ---------------------------------------------------------

    fn schedule_create(&self, new: &NewSchedule, next_run: DateTime<Utc>) -> Result<Schedule>;

    fn schedule_get_by_id(&self, id: &str) -> Result<Schedule>;

    /// Schedules in creation order, starting after `marker`.
    /// An unknown marker is `NotFound`.
    fn schedule_list(
        &self,
        filter: &ScheduleFilter,
        marker: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Schedule>>;

    /// Plain edit. `next_run`, when given, is written alongside.
    fn schedule_update(
        &self,
        id: &str,
        changes: &ScheduleChanges,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<Schedule>;

    fn schedule_delete(&self, id: &str) -> Result<()>;

    /// Schedules whose `next_run <= before`.
    fn schedule_get_due(&self, before: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Advance `next_run` only if it still equals `expected_next_run`.
    fn schedule_conditional_update(
        &self,
        id: &str,
        expected_next_run: DateTime<Utc>,
        advance: &ScheduleAdvance,
    ) -> Result<bool>;

    /// Atomically advance the schedule (keyed on the `next_run` observed in
    /// `schedule`) and create its job. `None` when another materializer won.
    fn schedule_materialize(
        &self,
        schedule: &Schedule,
        advance: &ScheduleAdvance,
    ) -> Result<Option<Job>>;

    // --- schedule metadata -------------------------------------------------

    /// Duplicate key is `Conflict`.
    fn schedule_meta_create(&self, schedule_id: &str, key: &str, value: &str) -> Result<()>;

    fn schedule_meta_get(&self, schedule_id: &str, key: &str) -> Result<String>;

    fn schedule_meta_list(&self, schedule_id: &str) -> Result<Metadata>;

    fn schedule_meta_delete(&self, schedule_id: &str, key: &str) -> Result<()>;

    /// Replace the whole metadata set.
    fn schedule_meta_replace(&self, schedule_id: &str, metadata: &Metadata) -> Result<Metadata>;

    // --- jobs --------------------------------------------------------------

    fn job_create(&self, new: &NewJob) -> Result<Job>;

    fn job_get_by_id(&self, id: &str) -> Result<Job>;

    /// Jobs in creation order, starting after `marker`.
    /// An unknown marker is `NotFound`.
    fn job_list(&self, filter: &JobFilter, marker: Option<&str>, limit: u32) -> Result<Vec<Job>>;

    /// Apply `changes` only if the row still satisfies `expected`.
    fn job_conditional_update(
        &self,
        id: &str,
        expected: &JobGuard,
        changes: &JobChanges,
    ) -> Result<bool>;

    fn job_delete(&self, id: &str) -> Result<()>;

    /// `Processing` jobs whose soft or hard deadline is `<= now`.
    fn job_get_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;
}
