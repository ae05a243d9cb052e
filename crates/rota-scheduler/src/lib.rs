//! `rota-scheduler` — recurring-job scheduling and dispatch over a shared store.
//!
//! # Overview
//!
//! Schedules describe a cron-style recurrence. The [`materializer::Materializer`]
//! turns due schedules into `QUEUED` jobs, workers claim and report on them
//! through the [`coordinator::Coordinator`], and the [`reaper::Reaper`]
//! requeues or times out jobs whose workers went quiet. Every component only
//! talks to the [`store::Store`]; any number of them may run in parallel
//! against one database.
//!
//! # Job lifecycle
//!
//! | From         | To                                      | Via         |
//! |--------------|-----------------------------------------|-------------|
//! | (schedule)   | `QUEUED`                                | materializer, `create_job` |
//! | `QUEUED`     | `PROCESSING`                            | claim       |
//! | `QUEUED`     | `CANCELLED`                             | cancel      |
//! | `PROCESSING` | `DONE`, `ERROR`, `CANCELLED`            | worker report |
//! | `PROCESSING` | `QUEUED` (retry) or `TIMED_OUT`         | reaper      |

pub mod coordinator;
pub mod db;
pub mod error;
pub mod materializer;
pub mod pagination;
pub mod reaper;
pub mod recurrence;
pub mod schedules;
pub mod sqlite;
pub mod store;
pub mod types;

pub use coordinator::{Coordinator, JobStatusView, StatusReport, StatusUpdate};
pub use error::{Result, SchedulerError};
pub use materializer::{Materializer, TickReport};
pub use pagination::{Page, PageRequest};
pub use reaper::{ReapReport, Reaper};
pub use schedules::ScheduleService;
pub use sqlite::SqliteStore;
pub use store::Store;
pub use types::{
    Job, JobFilter, JobStatus, Metadata, NewSchedule, Recurrence, Schedule, ScheduleChanges,
    ScheduleFilter,
};
