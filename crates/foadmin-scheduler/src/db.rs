use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates `sys_job` and the append-only `sys_job_log` (idempotent). The
/// status index backs the startup load; the log indexes back per-job
/// listing and age-based purging.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sys_job (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            name             TEXT    NOT NULL,
            job_id           TEXT    NOT NULL UNIQUE,
            job_type         TEXT    NOT NULL,   -- cron / interval / date
            func_name        TEXT    NOT NULL,
            func_args        TEXT,               -- JSON array
            func_kwargs      TEXT,               -- JSON object
            cron_expression  TEXT,
            interval_seconds INTEGER,
            run_date         TEXT,
            status           INTEGER NOT NULL DEFAULT 1,   -- 1 enabled, 0 paused
            description      TEXT,
            remark           TEXT,
            last_run_time    TEXT,
            next_run_time    TEXT,
            run_count        INTEGER NOT NULL DEFAULT 0,
            fail_count       INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sys_job_status ON sys_job (status);

        CREATE TABLE IF NOT EXISTS sys_job_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id      TEXT    NOT NULL,
            job_name    TEXT    NOT NULL,
            start_time  TEXT    NOT NULL,
            end_time    TEXT,
            duration    INTEGER,            -- milliseconds
            status      INTEGER NOT NULL,   -- 1 success, 0 failure
            result      TEXT,
            error       TEXT,
            traceback   TEXT,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sys_job_log_job_id ON sys_job_log (job_id);
        CREATE INDEX IF NOT EXISTS idx_sys_job_log_created_at ON sys_job_log (created_at);
        ",
    )?;
    Ok(())
}
