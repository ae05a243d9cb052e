use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::store::Store;
use crate::types::{
    clamp_storable, Job, JobChanges, JobFilter, JobGuard, JobStatus, Metadata, NewJob, NewSchedule,
    Recurrence, Schedule, ScheduleAdvance, ScheduleChanges, ScheduleFilter,
};

/// How long a writer waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEDULE_COLUMNS: &str = "id, tenant, action, minute, hour, day_of_month, month,
     day_of_week, next_run, last_scheduled, created_at, updated_at";

const JOB_COLUMNS: &str = "id, schedule_id, tenant, action, worker_id, status, retry_count,
     timeout, hard_timeout, error_message, created_at, updated_at";

/// SQLite implementation of [`Store`].
///
/// One handle owns one connection. Several handles (or processes) may share
/// a database file; they coordinate only through the conditional `UPDATE`s
/// and transactions below.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-query leaves SQLite itself consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// --- encoding helpers --------------------------------------------------------

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    clamp_storable(ts).to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fmt_opt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(fmt_ts)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_ts(idx, &r)).transpose()
}

/// Decode a background scan row by row. A row that fails to decode is
/// logged and skipped so it cannot stall the rest of the batch.
fn decode_each<T>(
    mut rows: rusqlite::Rows<'_>,
    decode: fn(&Row<'_>) -> rusqlite::Result<T>,
    kind: &'static str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        match decode(row) {
            Ok(item) => out.push(item),
            Err(e) => {
                let id: Option<String> = row.get(0).ok();
                warn!(%kind, id = ?id, "skipping undecodable row: {e}");
            }
        }
    }
    Ok(out)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        tenant: row.get(1)?,
        action: row.get(2)?,
        recurrence: Recurrence {
            minute: row.get(3)?,
            hour: row.get(4)?,
            day_of_month: row.get(5)?,
            month: row.get(6)?,
            day_of_week: row.get(7)?,
        },
        next_run: ts_col(row, 8)?,
        last_scheduled: opt_ts_col(row, 9)?,
        metadata: Metadata::new(),
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(5)?;
    let status: JobStatus = status
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;
    Ok(Job {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        tenant: row.get(2)?,
        action: row.get(3)?,
        worker_id: row.get(4)?,
        status,
        retry_count: row.get(6)?,
        timeout: opt_ts_col(row, 7)?,
        hard_timeout: opt_ts_col(row, 8)?,
        error_message: row.get(9)?,
        metadata: Metadata::new(),
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
    })
}

// --- connection-level queries (usable inside a transaction) -------------------

fn load_metadata(conn: &Connection, table: &str, owner_col: &str, owner: &str) -> Result<Metadata> {
    let sql = format!("SELECT key, value FROM {table} WHERE {owner_col} = ?1 ORDER BY key");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([owner], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Metadata>>()?)
}

fn insert_metadata(
    conn: &Connection,
    table: &str,
    owner_col: &str,
    owner: &str,
    metadata: &Metadata,
) -> Result<()> {
    let sql = format!("INSERT INTO {table} ({owner_col}, key, value) VALUES (?1, ?2, ?3)");
    let mut stmt = conn.prepare_cached(&sql)?;
    for (key, value) in metadata {
        stmt.execute(params![owner, key, value])?;
    }
    Ok(())
}

fn get_schedule(conn: &Connection, id: &str) -> Result<Schedule> {
    let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1");
    let mut schedule = conn
        .query_row(&sql, [id], schedule_from_row)
        .optional()?
        .ok_or_else(|| SchedulerError::not_found("schedule", id))?;
    schedule.metadata = load_metadata(conn, "schedule_metadata", "schedule_id", id)?;
    Ok(schedule)
}

fn get_job(conn: &Connection, id: &str) -> Result<Job> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    let mut job = conn
        .query_row(&sql, [id], job_from_row)
        .optional()?
        .ok_or_else(|| SchedulerError::not_found("job", id))?;
    job.metadata = load_metadata(conn, "job_metadata", "job_id", id)?;
    Ok(job)
}

fn insert_job(conn: &Connection, new: &NewJob) -> Result<Job> {
    let id = Uuid::new_v4().to_string();
    let now = fmt_ts(Utc::now());
    conn.execute(
        "INSERT INTO jobs
         (id, schedule_id, tenant, action, worker_id, status, retry_count,
          timeout, hard_timeout, error_message, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, NULL, 'QUEUED', 0, NULL, NULL, NULL, ?5, ?5)",
        params![id, new.schedule_id, new.tenant, new.action, now],
    )?;
    insert_metadata(conn, "job_metadata", "job_id", &id, &new.metadata)?;
    get_job(conn, &id)
}

fn ensure_schedule(conn: &Connection, id: &str) -> Result<()> {
    let exists = conn
        .query_row("SELECT 1 FROM schedules WHERE id = ?1", [id], |_| Ok(()))
        .optional()?;
    exists.ok_or_else(|| SchedulerError::not_found("schedule", id))
}

/// `seq` of the row named by a pagination marker.
fn marker_seq(conn: &Connection, table: &str, marker: &str) -> Result<i64> {
    let sql = format!("SELECT seq FROM {table} WHERE id = ?1");
    conn.query_row(&sql, [marker], |row| row.get(0))
        .optional()?
        .ok_or_else(|| SchedulerError::not_found("marker", marker))
}

/// Accumulates `AND`-joined predicates with positional parameters.
#[derive(Default)]
struct Conditions {
    clauses: Vec<&'static str>,
    params: Vec<Value>,
}

impl Conditions {
    fn push(&mut self, clause: &'static str, value: Value) {
        self.clauses.push(clause);
        self.params.push(value);
    }

    fn push_text(&mut self, clause: &'static str, value: Option<&String>) {
        if let Some(v) = value {
            self.push(clause, Value::Text(v.clone()));
        }
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn opt_text(v: Option<&str>) -> Value {
    v.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn opt_int(v: Option<u32>) -> Value {
    v.map_or(Value::Null, |n| Value::Integer(i64::from(n)))
}

impl Store for SqliteStore {
    fn schedule_create(&self, new: &NewSchedule, next_run: DateTime<Utc>) -> Result<Schedule> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = fmt_ts(Utc::now());
        let rec = &new.recurrence;

        tx.execute(
            "INSERT INTO schedules
             (id, tenant, action, minute, hour, day_of_month, month, day_of_week,
              next_run, last_scheduled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, ?10)",
            params![
                id,
                new.tenant,
                new.action,
                rec.minute,
                rec.hour,
                rec.day_of_month,
                rec.month,
                rec.day_of_week,
                fmt_ts(next_run),
                now,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                SchedulerError::Conflict(format!("schedule {id} already exists"))
            } else {
                e.into()
            }
        })?;
        insert_metadata(&tx, "schedule_metadata", "schedule_id", &id, &new.metadata)?;
        let schedule = get_schedule(&tx, &id)?;
        tx.commit()?;
        Ok(schedule)
    }

    fn schedule_get_by_id(&self, id: &str) -> Result<Schedule> {
        get_schedule(&self.conn(), id)
    }

    fn schedule_list(
        &self,
        filter: &ScheduleFilter,
        marker: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        let mut cond = Conditions::default();
        if let Some(m) = marker {
            cond.push("seq > ?", Value::Integer(marker_seq(&conn, "schedules", m)?));
        }
        cond.push_text("tenant = ?", filter.tenant.as_ref());
        cond.push_text("action = ?", filter.action.as_ref());
        if let Some(after) = filter.next_run_after {
            cond.push("next_run >= ?", Value::Text(fmt_ts(after)));
        }
        if let Some(before) = filter.next_run_before {
            cond.push("next_run <= ?", Value::Text(fmt_ts(before)));
        }
        cond.params.push(Value::Integer(i64::from(limit)));

        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules {} ORDER BY seq LIMIT ?",
            cond.where_sql()
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut schedules = stmt
            .query_map(params_from_iter(cond.params.iter()), schedule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for s in &mut schedules {
            s.metadata = load_metadata(&conn, "schedule_metadata", "schedule_id", &s.id)?;
        }
        Ok(schedules)
    }

    fn schedule_update(
        &self,
        id: &str,
        changes: &ScheduleChanges,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<Schedule> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_schedule(&tx, id)?;

        let mut sets: Vec<&'static str> = vec!["updated_at = ?"];
        let mut values: Vec<Value> = vec![Value::Text(fmt_ts(Utc::now()))];
        if let Some(t) = &changes.tenant {
            sets.push("tenant = ?");
            values.push(Value::Text(t.clone()));
        }
        if let Some(a) = &changes.action {
            sets.push("action = ?");
            values.push(Value::Text(a.clone()));
        }
        let fields = [
            ("minute = ?", changes.minute),
            ("hour = ?", changes.hour),
            ("day_of_month = ?", changes.day_of_month),
            ("month = ?", changes.month),
            ("day_of_week = ?", changes.day_of_week),
        ];
        for (set, value) in fields {
            if let Some(v) = value {
                sets.push(set);
                values.push(opt_int(v));
            }
        }
        if let Some(next) = next_run {
            sets.push("next_run = ?");
            values.push(Value::Text(fmt_ts(next)));
        }
        values.push(Value::Text(id.to_string()));

        let sql = format!("UPDATE schedules SET {} WHERE id = ?", sets.join(", "));
        tx.execute(&sql, params_from_iter(values.iter()))?;

        if let Some(metadata) = &changes.metadata {
            tx.execute("DELETE FROM schedule_metadata WHERE schedule_id = ?1", [id])?;
            insert_metadata(&tx, "schedule_metadata", "schedule_id", id, metadata)?;
        }
        let schedule = get_schedule(&tx, id)?;
        tx.commit()?;
        Ok(schedule)
    }

    fn schedule_delete(&self, id: &str) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::not_found("schedule", id));
        }
        Ok(())
    }

    fn schedule_get_due(&self, before: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE next_run <= ?1 ORDER BY next_run, seq"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut due = decode_each(stmt.query([fmt_ts(before)])?, schedule_from_row, "schedule")?;
        for s in &mut due {
            s.metadata = load_metadata(&conn, "schedule_metadata", "schedule_id", &s.id)?;
        }
        Ok(due)
    }

    fn schedule_conditional_update(
        &self,
        id: &str,
        expected_next_run: DateTime<Utc>,
        advance: &ScheduleAdvance,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE schedules
             SET next_run = ?1, last_scheduled = COALESCE(?2, last_scheduled), updated_at = ?3
             WHERE id = ?4 AND next_run = ?5",
            params![
                fmt_ts(advance.next_run),
                fmt_opt_ts(advance.last_scheduled),
                fmt_ts(Utc::now()),
                id,
                fmt_ts(expected_next_run),
            ],
        )?;
        Ok(n == 1)
    }

    fn schedule_materialize(
        &self,
        schedule: &Schedule,
        advance: &ScheduleAdvance,
    ) -> Result<Option<Job>> {
        let mut conn = self.conn();
        // IMMEDIATE takes the write lock up front so two materializers
        // serialise here instead of failing on lock upgrade.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute(
            "UPDATE schedules
             SET next_run = ?1, last_scheduled = COALESCE(?2, last_scheduled), updated_at = ?3
             WHERE id = ?4 AND next_run = ?5",
            params![
                fmt_ts(advance.next_run),
                fmt_opt_ts(advance.last_scheduled),
                fmt_ts(Utc::now()),
                schedule.id,
                fmt_ts(schedule.next_run),
            ],
        )?;
        if n == 0 {
            debug!(schedule_id = %schedule.id, "next_run already advanced elsewhere");
            return Ok(None);
        }
        let job = insert_job(&tx, &NewJob::from_schedule(schedule))?;
        tx.commit()?;
        Ok(Some(job))
    }

    fn schedule_meta_create(&self, schedule_id: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        ensure_schedule(&conn, schedule_id)?;
        conn.execute(
            "INSERT INTO schedule_metadata (schedule_id, key, value) VALUES (?1, ?2, ?3)",
            params![schedule_id, key, value],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                SchedulerError::Conflict(format!(
                    "metadata key '{key}' already exists on schedule {schedule_id}"
                ))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn schedule_meta_get(&self, schedule_id: &str, key: &str) -> Result<String> {
        let conn = self.conn();
        ensure_schedule(&conn, schedule_id)?;
        conn.query_row(
            "SELECT value FROM schedule_metadata WHERE schedule_id = ?1 AND key = ?2",
            params![schedule_id, key],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| SchedulerError::not_found("metadata", key))
    }

    fn schedule_meta_list(&self, schedule_id: &str) -> Result<Metadata> {
        let conn = self.conn();
        ensure_schedule(&conn, schedule_id)?;
        load_metadata(&conn, "schedule_metadata", "schedule_id", schedule_id)
    }

    fn schedule_meta_delete(&self, schedule_id: &str, key: &str) -> Result<()> {
        let conn = self.conn();
        ensure_schedule(&conn, schedule_id)?;
        let n = conn.execute(
            "DELETE FROM schedule_metadata WHERE schedule_id = ?1 AND key = ?2",
            params![schedule_id, key],
        )?;
        if n == 0 {
            return Err(SchedulerError::not_found("metadata", key));
        }
        Ok(())
    }

    fn schedule_meta_replace(&self, schedule_id: &str, metadata: &Metadata) -> Result<Metadata> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_schedule(&tx, schedule_id)?;
        tx.execute(
            "DELETE FROM schedule_metadata WHERE schedule_id = ?1",
            [schedule_id],
        )?;
        insert_metadata(&tx, "schedule_metadata", "schedule_id", schedule_id, metadata)?;
        let stored = load_metadata(&tx, "schedule_metadata", "schedule_id", schedule_id)?;
        tx.commit()?;
        Ok(stored)
    }

    fn job_create(&self, new: &NewJob) -> Result<Job> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let job = insert_job(&tx, new)?;
        tx.commit()?;
        Ok(job)
    }

    fn job_get_by_id(&self, id: &str) -> Result<Job> {
        get_job(&self.conn(), id)
    }

    fn job_list(&self, filter: &JobFilter, marker: Option<&str>, limit: u32) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut cond = Conditions::default();
        if let Some(m) = marker {
            cond.push("seq > ?", Value::Integer(marker_seq(&conn, "jobs", m)?));
        }
        if let Some(status) = filter.status {
            cond.push("status = ?", Value::Text(status.as_str().to_string()));
        }
        cond.push_text("tenant = ?", filter.tenant.as_ref());
        cond.push_text("schedule_id = ?", filter.schedule_id.as_ref());
        cond.push_text("action = ?", filter.action.as_ref());
        cond.push_text("worker_id = ?", filter.worker_id.as_ref());
        cond.params.push(Value::Integer(i64::from(limit)));

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs {} ORDER BY seq LIMIT ?",
            cond.where_sql()
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut jobs = stmt
            .query_map(params_from_iter(cond.params.iter()), job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for j in &mut jobs {
            j.metadata = load_metadata(&conn, "job_metadata", "job_id", &j.id)?;
        }
        Ok(jobs)
    }

    fn job_conditional_update(
        &self,
        id: &str,
        expected: &JobGuard,
        changes: &JobChanges,
    ) -> Result<bool> {
        let mut sets: Vec<&'static str> = vec!["updated_at = ?"];
        let mut values: Vec<Value> = vec![Value::Text(fmt_ts(Utc::now()))];
        if let Some(status) = changes.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(worker_id) = &changes.worker_id {
            sets.push("worker_id = ?");
            values.push(opt_text(worker_id.as_deref()));
        }
        if let Some(timeout) = changes.timeout {
            sets.push("timeout = ?");
            values.push(opt_text(fmt_opt_ts(timeout).as_deref()));
        }
        if let Some(hard) = changes.hard_timeout {
            sets.push("hard_timeout = ?");
            values.push(opt_text(fmt_opt_ts(hard).as_deref()));
        }
        if let Some(retry) = changes.retry_count {
            sets.push("retry_count = ?");
            values.push(Value::Integer(i64::from(retry)));
        }
        if let Some(msg) = &changes.error_message {
            sets.push("error_message = ?");
            values.push(opt_text(msg.as_deref()));
        }

        let mut guard = String::from("id = ? AND status = ?");
        values.push(Value::Text(id.to_string()));
        match expected {
            JobGuard::Status(status) => {
                values.push(Value::Text(status.as_str().to_string()));
            }
            JobGuard::Attempt {
                status,
                worker_id,
                timeout,
            } => {
                values.push(Value::Text(status.as_str().to_string()));
                // `IS` treats NULL = NULL as a match.
                guard.push_str(" AND worker_id IS ? AND timeout IS ?");
                values.push(opt_text(worker_id.as_deref()));
                values.push(opt_text(fmt_opt_ts(*timeout).as_deref()));
            }
        }

        let sql = format!("UPDATE jobs SET {} WHERE {guard}", sets.join(", "));
        let n = self.conn().execute(&sql, params_from_iter(values.iter()))?;
        Ok(n == 1)
    }

    fn job_delete(&self, id: &str) -> Result<()> {
        let n = self.conn().execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::not_found("job", id));
        }
        Ok(())
    }

    fn job_get_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'PROCESSING'
               AND ((timeout IS NOT NULL AND timeout <= ?1)
                 OR (hard_timeout IS NOT NULL AND hard_timeout <= ?1))
             ORDER BY seq"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let jobs = decode_each(stmt.query([fmt_ts(now)])?, job_from_row, "job");
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn new_schedule(tenant: &str) -> NewSchedule {
        NewSchedule {
            tenant: tenant.to_string(),
            action: "snapshot".to_string(),
            recurrence: Recurrence {
                minute: Some(30),
                hour: Some(2),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + ChronoDuration::microseconds(1);
        let c = a + ChronoDuration::days(400);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert!(fmt_ts(b) < fmt_ts(c));
        assert_eq!(fmt_ts(a).len(), fmt_ts(c).len());
    }

    #[test]
    fn schedule_round_trip_with_metadata() {
        let s = store();
        let mut new = new_schedule("t1");
        new.metadata.insert("instance_id".into(), "vm-1".into());
        let next = Utc::now();
        let created = s.schedule_create(&new, next).unwrap();
        assert_eq!(created.recurrence.minute, Some(30));
        assert_eq!(created.recurrence.day_of_week, None);
        assert_eq!(created.metadata["instance_id"], "vm-1");
        assert_eq!(fmt_ts(created.next_run), fmt_ts(next));
        assert!(created.last_scheduled.is_none());
    }

    #[test]
    fn duplicate_schedule_id_conflicts() {
        let s = store();
        let mut new = new_schedule("t1");
        new.id = Some("2a0a6a3c-2b4e-4f4c-9d0e-3c1c2a7b9f10".into());
        s.schedule_create(&new, Utc::now()).unwrap();
        let err = s.schedule_create(&new, Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
    }

    #[test]
    fn conditional_next_run_advance_has_one_winner() {
        let s = store();
        let created = s.schedule_create(&new_schedule("t1"), Utc::now()).unwrap();
        let advance = ScheduleAdvance {
            next_run: created.next_run + ChronoDuration::days(1),
            last_scheduled: Some(created.next_run),
        };
        assert!(s
            .schedule_conditional_update(&created.id, created.next_run, &advance)
            .unwrap());
        assert!(!s
            .schedule_conditional_update(&created.id, created.next_run, &advance)
            .unwrap());
        let reread = s.schedule_get_by_id(&created.id).unwrap();
        assert_eq!(fmt_ts(reread.next_run), fmt_ts(advance.next_run));
        assert!(reread.last_scheduled.is_some());
    }

    #[test]
    fn materialize_copies_schedule_and_is_exclusive() {
        let s = store();
        let mut new = new_schedule("t1");
        new.metadata.insert("instance_id".into(), "vm-1".into());
        let created = s.schedule_create(&new, Utc::now()).unwrap();
        let advance = ScheduleAdvance {
            next_run: created.next_run + ChronoDuration::days(1),
            last_scheduled: Some(Utc::now()),
        };
        let job = s.schedule_materialize(&created, &advance).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.schedule_id, created.id);
        assert_eq!(job.tenant, "t1");
        assert_eq!(job.metadata["instance_id"], "vm-1");
        assert!(job.worker_id.is_none() && job.timeout.is_none());

        // Stale view of the schedule: no second job.
        assert!(s.schedule_materialize(&created, &advance).unwrap().is_none());
        let jobs = s.job_list(&JobFilter::default(), None, 10).unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn metadata_conflict_and_not_found() {
        let s = store();
        let created = s.schedule_create(&new_schedule("t1"), Utc::now()).unwrap();
        s.schedule_meta_create(&created.id, "k", "v1").unwrap();
        assert!(matches!(
            s.schedule_meta_create(&created.id, "k", "v2"),
            Err(SchedulerError::Conflict(_))
        ));
        assert!(matches!(
            s.schedule_meta_get(&created.id, "missing"),
            Err(SchedulerError::NotFound { kind: "metadata", .. })
        ));
        assert!(matches!(
            s.schedule_meta_get("nope", "k"),
            Err(SchedulerError::NotFound { kind: "schedule", .. })
        ));
        let replaced = s.schedule_meta_replace(&created.id, &Metadata::new()).unwrap();
        assert!(replaced.is_empty());
    }

    #[test]
    fn job_list_pages_in_creation_order() {
        let s = store();
        let sched = s.schedule_create(&new_schedule("t1"), Utc::now()).unwrap();
        let ids: Vec<String> = (0..5)
            .map(|_| s.job_create(&NewJob::from_schedule(&sched)).unwrap().id)
            .collect();

        let first = s.job_list(&JobFilter::default(), None, 2).unwrap();
        assert_eq!(first.iter().map(|j| &j.id).collect::<Vec<_>>(), vec![&ids[0], &ids[1]]);
        let second = s
            .job_list(&JobFilter::default(), Some(&ids[1]), 2)
            .unwrap();
        assert_eq!(second[0].id, ids[2]);
        assert!(matches!(
            s.job_list(&JobFilter::default(), Some("not-a-job"), 2),
            Err(SchedulerError::NotFound { kind: "marker", .. })
        ));
    }

    #[test]
    fn attempt_guard_rejects_changed_timeout() {
        let s = store();
        let sched = s.schedule_create(&new_schedule("t1"), Utc::now()).unwrap();
        let job = s.job_create(&NewJob::from_schedule(&sched)).unwrap();
        let deadline = Utc::now() + ChronoDuration::minutes(5);
        let claim = JobChanges {
            status: Some(JobStatus::Processing),
            worker_id: Some(Some("w1".into())),
            timeout: Some(Some(deadline)),
            ..Default::default()
        };
        assert!(s
            .job_conditional_update(&job.id, &JobGuard::Status(JobStatus::Queued), &claim)
            .unwrap());
        let claimed = s.job_get_by_id(&job.id).unwrap();

        let stale = JobGuard::Attempt {
            status: JobStatus::Processing,
            worker_id: Some("w1".into()),
            timeout: Some(deadline + ChronoDuration::seconds(1)),
        };
        let done = JobChanges::release(JobStatus::Done);
        assert!(!s.job_conditional_update(&job.id, &stale, &done).unwrap());
        assert!(s
            .job_conditional_update(&job.id, &JobGuard::observed(&claimed), &done)
            .unwrap());
        let finished = s.job_get_by_id(&job.id).unwrap();
        assert_eq!(finished.status, JobStatus::Done);
        assert!(finished.worker_id.is_none() && finished.timeout.is_none());
    }

    #[test]
    fn far_future_deadline_is_stored_readable() {
        let s = store();
        let sched = s.schedule_create(&new_schedule("t1"), Utc::now()).unwrap();
        let job = s.job_create(&NewJob::from_schedule(&sched)).unwrap();
        let claim = JobChanges {
            status: Some(JobStatus::Processing),
            worker_id: Some(Some("w1".into())),
            timeout: Some(Some(DateTime::<Utc>::MAX_UTC)),
            hard_timeout: Some(Some(DateTime::<Utc>::MAX_UTC)),
            ..Default::default()
        };
        assert!(s
            .job_conditional_update(&job.id, &JobGuard::Status(JobStatus::Queued), &claim)
            .unwrap());

        let claimed = s.job_get_by_id(&job.id).unwrap();
        assert_eq!(claimed.hard_timeout, Some(crate::types::latest_storable()));
        assert!(s.job_get_expired(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn expired_scan_skips_undecodable_rows() {
        let s = store();
        let sched = s.schedule_create(&new_schedule("t1"), Utc::now()).unwrap();
        let past = Utc::now() - ChronoDuration::minutes(1);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let job = s.job_create(&NewJob::from_schedule(&sched)).unwrap();
            let claim = JobChanges {
                status: Some(JobStatus::Processing),
                worker_id: Some(Some("w1".into())),
                timeout: Some(Some(past)),
                ..Default::default()
            };
            assert!(s
                .job_conditional_update(&job.id, &JobGuard::Status(JobStatus::Queued), &claim)
                .unwrap());
            ids.push(job.id);
        }
        // An expanded-year timestamp sorts before every real one.
        s.conn()
            .execute(
                "UPDATE jobs SET hard_timeout = '+262143-01-01T00:00:00Z' WHERE id = ?1",
                [&ids[0]],
            )
            .unwrap();

        let expired = s.job_get_expired(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, ids[1]);
    }

    #[test]
    fn deleting_schedule_keeps_jobs() {
        let s = store();
        let sched = s.schedule_create(&new_schedule("t1"), Utc::now()).unwrap();
        let job = s.job_create(&NewJob::from_schedule(&sched)).unwrap();
        s.schedule_delete(&sched.id).unwrap();
        assert!(s.job_get_by_id(&job.id).is_ok());
        assert!(matches!(
            s.schedule_delete(&sched.id),
            Err(SchedulerError::NotFound { .. })
        ));
    }
}
