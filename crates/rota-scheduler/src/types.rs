use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key → value metadata, ordered by key; keys are unique per owner.
pub type Metadata = BTreeMap<String, String>;

/// `0000-01-01T00:00:00Z`
const EARLIEST_STORABLE_SECS: i64 = -62_167_219_200;
/// `9999-12-31T23:59:59Z`
const LATEST_STORABLE_SECS: i64 = 253_402_300_799;

/// Latest instant a stored timestamp can hold. Stored timestamps are
/// fixed-width RFC 3339, so the year has four digits.
pub fn latest_storable() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_STORABLE_SECS, 0).unwrap_or_default()
}

/// Clamp `ts` into the four-digit-year range.
pub fn clamp_storable(ts: DateTime<Utc>) -> DateTime<Utc> {
    let earliest = DateTime::from_timestamp(EARLIEST_STORABLE_SECS, 0).unwrap_or_default();
    ts.clamp(earliest, latest_storable())
}

/// Cron-style recurrence fields. `None` is the wildcard.
///
/// Valid ranges: minute 0–59, hour 0–23, day_of_month 1–31, month 1–12,
/// day_of_week 0–7 (0 and 7 are both Sunday).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u32>,
}

/// A recurring rule that produces jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub tenant: String,
    /// Action-type key copied onto every job this schedule produces.
    pub action: String,
    #[serde(flatten)]
    pub recurrence: Recurrence,
    /// Next materialization instant.
    pub next_run: DateTime<Utc>,
    /// When the materializer last produced a job from this schedule.
    pub last_scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for schedule creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSchedule {
    /// Caller-supplied id; must be a hyphenated UUID when present.
    pub id: Option<String>,
    pub tenant: String,
    pub action: String,
    #[serde(flatten)]
    pub recurrence: Recurrence,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Partial schedule edit. Recurrence fields use `Some(None)` to reset a
/// field to the wildcard.
#[derive(Debug, Clone, Default)]
pub struct ScheduleChanges {
    pub tenant: Option<String>,
    pub action: Option<String>,
    pub minute: Option<Option<u32>>,
    pub hour: Option<Option<u32>>,
    pub day_of_month: Option<Option<u32>>,
    pub month: Option<Option<u32>>,
    pub day_of_week: Option<Option<u32>>,
    pub metadata: Option<Metadata>,
}

impl ScheduleChanges {
    /// True when the edit touches any recurrence field, forcing a
    /// `next_run` recompute.
    pub fn touches_recurrence(&self) -> bool {
        self.minute.is_some()
            || self.hour.is_some()
            || self.day_of_month.is_some()
            || self.month.is_some()
            || self.day_of_week.is_some()
    }

    /// Overlay the edited recurrence fields on `base`.
    pub fn apply_recurrence(&self, base: &Recurrence) -> Recurrence {
        Recurrence {
            minute: self.minute.unwrap_or(base.minute),
            hour: self.hour.unwrap_or(base.hour),
            day_of_month: self.day_of_month.unwrap_or(base.day_of_month),
            month: self.month.unwrap_or(base.month),
            day_of_week: self.day_of_week.unwrap_or(base.day_of_week),
        }
    }
}

/// New values written by a conditional `next_run` advance.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleAdvance {
    pub next_run: DateTime<Utc>,
    /// `None` leaves `last_scheduled` untouched.
    pub last_scheduled: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub tenant: Option<String>,
    pub action: Option<String>,
    pub next_run_after: Option<DateTime<Utc>>,
    pub next_run_before: Option<DateTime<Utc>>,
}

/// Lifecycle state of a job.
///
/// `Queued` is initial; `Done`, `Error`, `TimedOut` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Error,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Error | JobStatus::TimedOut | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
            JobStatus::TimedOut => "TIMED_OUT",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    /// Case-insensitive; the canonical form is upper-case.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "PROCESSING" => Ok(JobStatus::Processing),
            "DONE" => Ok(JobStatus::Done),
            "ERROR" => Ok(JobStatus::Error),
            "TIMED_OUT" => Ok(JobStatus::TimedOut),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One materialized unit of work.
///
/// `worker_id` and `timeout` are set exactly while `status` is `Processing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Originating schedule. Not a foreign key: jobs outlive their schedule.
    pub schedule_id: String,
    pub tenant: String,
    pub action: String,
    pub worker_id: Option<String>,
    pub status: JobStatus,
    pub retry_count: u32,
    /// Soft deadline of the current processing attempt.
    pub timeout: Option<DateTime<Utc>>,
    /// Absolute ceiling, set at first claim and never advanced.
    pub hard_timeout: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for job creation. New jobs always start `Queued`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub schedule_id: String,
    pub tenant: String,
    pub action: String,
    pub metadata: Metadata,
}

impl NewJob {
    /// Copy action, tenant and metadata from the owning schedule.
    pub fn from_schedule(schedule: &Schedule) -> Self {
        Self {
            schedule_id: schedule.id.clone(),
            tenant: schedule.tenant.clone(),
            action: schedule.action.clone(),
            metadata: schedule.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tenant: Option<String>,
    pub schedule_id: Option<String>,
    pub action: Option<String>,
    pub worker_id: Option<String>,
}

/// Precondition of a conditional job update.
#[derive(Debug, Clone, PartialEq)]
pub enum JobGuard {
    /// Applies while the job is still in this status.
    Status(JobStatus),
    /// Applies only to the exact processing attempt that was read.
    Attempt {
        status: JobStatus,
        worker_id: Option<String>,
        timeout: Option<DateTime<Utc>>,
    },
}

impl JobGuard {
    pub fn observed(job: &Job) -> Self {
        JobGuard::Attempt {
            status: job.status,
            worker_id: job.worker_id.clone(),
            timeout: job.timeout,
        }
    }
}

/// Columns written by a conditional job update. `None` leaves the column as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobChanges {
    pub status: Option<JobStatus>,
    pub worker_id: Option<Option<String>>,
    pub timeout: Option<Option<DateTime<Utc>>>,
    pub hard_timeout: Option<Option<DateTime<Utc>>>,
    pub retry_count: Option<u32>,
    pub error_message: Option<Option<String>>,
}

impl JobChanges {
    /// Leave `Processing`: clear the claim and the soft deadline.
    pub fn release(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            worker_id: Some(None),
            timeout: Some(None),
            ..Default::default()
        }
    }

    /// Put a timed-out attempt back in the queue.
    pub fn requeue(retry_count: u32) -> Self {
        Self {
            retry_count: Some(retry_count),
            ..Self::release(JobStatus::Queued)
        }
    }
}
