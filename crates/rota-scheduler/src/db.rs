use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Idempotent. `seq` columns give a stable creation order for pagination and
/// FIFO claiming; timestamps are fixed-width RFC 3339 UTC text so comparing
/// them as strings compares them as instants.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT    NOT NULL UNIQUE,
            tenant          TEXT    NOT NULL,
            action          TEXT    NOT NULL,
            minute          INTEGER,            -- NULL is the wildcard
            hour            INTEGER,
            day_of_month    INTEGER,
            month           INTEGER,
            day_of_week     INTEGER,
            next_run        TEXT    NOT NULL,
            last_scheduled  TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- Due scan: SELECT … WHERE next_run <= ?
        CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules (next_run);

        CREATE TABLE IF NOT EXISTS schedule_metadata (
            schedule_id TEXT NOT NULL REFERENCES schedules (id) ON DELETE CASCADE,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            PRIMARY KEY (schedule_id, key)
        ) STRICT;

        -- schedule_id is not a foreign key: jobs outlive schedules.
        CREATE TABLE IF NOT EXISTS jobs (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT    NOT NULL UNIQUE,
            schedule_id     TEXT    NOT NULL,
            tenant          TEXT    NOT NULL,
            action          TEXT    NOT NULL,
            worker_id       TEXT,
            status          TEXT    NOT NULL DEFAULT 'QUEUED',
            retry_count     INTEGER NOT NULL DEFAULT 0,
            timeout         TEXT,
            hard_timeout    TEXT,
            error_message   TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- Claim: oldest QUEUED job for an action.
        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (action, status, seq);
        -- Reaper: PROCESSING jobs past a deadline.
        CREATE INDEX IF NOT EXISTS idx_jobs_timeout ON jobs (status, timeout);

        CREATE TABLE IF NOT EXISTS job_metadata (
            job_id  TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            key     TEXT NOT NULL,
            value   TEXT NOT NULL,
            PRIMARY KEY (job_id, key)
        ) STRICT;
        ",
    )?;
    Ok(())
}
