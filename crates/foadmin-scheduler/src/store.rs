use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{
        Job, JobFilter, JobLog, JobStatus, JobType, LogFilter, LogStatus, NewJob, NewJobLog, Page,
    },
};

const JOB_COLUMNS: &str = "id, name, job_id, job_type, func_name, func_args, func_kwargs,
     cron_expression, interval_seconds, run_date, status, description, remark,
     last_run_time, next_run_time, run_count, fail_count, created_at, updated_at";

const LOG_COLUMNS: &str = "id, job_id, job_name, start_time, end_time, duration, status,
     result, error, traceback, created_at";

/// Transactional access to `sys_job` and `sys_job_log`.
///
/// Cheap to clone; every clone shares one connection behind a `Mutex`.
/// Each method is one short-lived unit of work and never holds the lock
/// across jobs.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&self.conn())
    }

    // --- jobs --------------------------------------------------------------

    /// Insert a new job. Fails with `Conflict` when `job_id` is taken.
    ///
    /// `run_date` must already be an absolute instant.
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    pub fn insert_job(&self, job: &NewJob) -> Result<Job> {
        let run_date = job
            .run_date
            .map(|d| {
                d.instant().ok_or_else(|| {
                    SchedulerError::Configuration("run_date has no timezone".to_string())
                })
            })
            .transpose()?;
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sys_job WHERE job_id = ?1)",
            [&job.job_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(SchedulerError::Conflict {
                job_id: job.job_id.clone(),
            });
        }

        let now = Utc::now();
        conn.execute(
            "INSERT INTO sys_job
             (name, job_id, job_type, func_name, func_args, func_kwargs,
              cron_expression, interval_seconds, run_date, status, description, remark,
              run_count, fail_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,0,0,?13,?13)",
            params![
                job.name,
                job.job_id,
                job.job_type.to_string(),
                job.func_name,
                job.func_args,
                job.func_kwargs,
                job.cron_expression,
                job.interval_seconds,
                run_date,
                job.status.as_i64(),
                job.description,
                job.remark,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(id, "job inserted");

        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM sys_job WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .map_err(SchedulerError::from)
    }

    /// Fetch by numeric primary key.
    pub fn get_job(&self, id: i64) -> Result<Job> {
        self.conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM sys_job WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| SchedulerError::not_found(id.to_string()))
    }

    /// Fetch by the stable `job_id`, returning `None` when absent.
    pub fn find_by_job_id(&self, job_id: &str) -> Result<Option<Job>> {
        let job = self
            .conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM sys_job WHERE job_id = ?1"),
                [job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Persist the definition fields of `job` (not its statistics).
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    pub fn update_job(&self, job: &Job) -> Result<Job> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE sys_job SET
                name=?1, func_name=?2, func_args=?3, func_kwargs=?4,
                cron_expression=?5, interval_seconds=?6, run_date=?7,
                status=?8, description=?9, remark=?10, updated_at=?11
             WHERE id=?12",
            params![
                job.name,
                job.func_name,
                job.func_args,
                job.func_kwargs,
                job.cron_expression,
                job.interval_seconds,
                job.run_date,
                job.status.as_i64(),
                job.description,
                job.remark,
                Utc::now(),
                job.id,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::not_found(job.id.to_string()));
        }
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM sys_job WHERE id = ?1"),
            [job.id],
            row_to_job,
        )
        .map_err(SchedulerError::from)
    }

    /// Flip the enabled/paused flag.
    pub fn set_status(&self, id: i64, status: JobStatus) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE sys_job SET status=?1, updated_at=?2 WHERE id=?3",
            params![status.as_i64(), Utc::now(), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::not_found(id.to_string()));
        }
        Ok(())
    }

    /// Delete a job row. Its logs are kept.
    #[instrument(skip(self))]
    pub fn delete_job(&self, id: i64) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM sys_job WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::not_found(id.to_string()));
        }
        info!("job deleted");
        Ok(())
    }

    /// All jobs with `status = enabled`, oldest first.
    pub fn enabled_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM sys_job WHERE status = ?1 ORDER BY id"
        ))?;
        let jobs = stmt
            .query_map([JobStatus::Enabled.as_i64()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Filtered page of jobs, newest first.
    pub fn list_jobs(&self, filter: &JobFilter, page: u32, size: u32) -> Result<Page<Job>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(name) = filter.name.as_deref().filter(|s| !s.is_empty()) {
            clauses.push("name LIKE ?");
            values.push(SqlValue::Text(format!("%{name}%")));
        }
        if let Some(job_type) = filter.job_type {
            clauses.push("job_type = ?");
            values.push(SqlValue::Text(job_type.to_string()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(SqlValue::Integer(status.as_i64()));
        }
        let where_sql = where_clause(&clauses);

        let conn = self.conn();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM sys_job{where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut page_values = values;
        page_values.push(SqlValue::Integer(size as i64));
        page_values.push(SqlValue::Integer(offset(page, size)));
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM sys_job{where_sql} ORDER BY id DESC LIMIT ? OFFSET ?"
        ))?;
        let items = stmt
            .query_map(params_from_iter(page_values.iter()), row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page,
            size,
        })
    }

    /// Record the registry's next fire time for `job_id`.
    pub fn set_next_run_time(&self, job_id: &str, next: Option<DateTime<Utc>>) -> Result<()> {
        self.conn().execute(
            "UPDATE sys_job SET next_run_time=?1 WHERE job_id=?2",
            params![next, job_id],
        )?;
        Ok(())
    }

    // --- logs --------------------------------------------------------------

    /// Append `log` and bump the owning job's statistics in one transaction.
    ///
    /// A log whose job row has since been deleted is still written.
    pub fn record_execution(&self, log: &NewJobLog) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sys_job_log
             (job_id, job_name, start_time, end_time, duration, status,
              result, error, traceback, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                log.job_id,
                log.job_name,
                log.start_time,
                log.end_time,
                log.duration,
                log.status.as_i64(),
                log.result,
                log.error,
                log.traceback,
                Utc::now(),
            ],
        )?;
        let log_id = tx.last_insert_rowid();

        let failed = i64::from(log.status == LogStatus::Failure);
        tx.execute(
            "UPDATE sys_job SET last_run_time=?1, run_count=run_count+1,
                    fail_count=fail_count+?2
             WHERE job_id=?3",
            params![log.start_time, failed, log.job_id],
        )?;

        tx.commit()?;
        debug!(job_id = %log.job_id, log_id, "execution recorded");
        Ok(log_id)
    }

    /// Filtered page of logs, newest first.
    pub fn list_logs(&self, filter: &LogFilter, page: u32, size: u32) -> Result<Page<JobLog>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(job_id) = filter.job_id.as_deref().filter(|s| !s.is_empty()) {
            clauses.push("job_id = ?");
            values.push(SqlValue::Text(job_id.to_string()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(SqlValue::Integer(status.as_i64()));
        }
        let where_sql = where_clause(&clauses);

        let conn = self.conn();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM sys_job_log{where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut page_values = values;
        page_values.push(SqlValue::Integer(size as i64));
        page_values.push(SqlValue::Integer(offset(page, size)));
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM sys_job_log{where_sql} ORDER BY id DESC LIMIT ? OFFSET ?"
        ))?;
        let items = stmt
            .query_map(params_from_iter(page_values.iter()), row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page,
            size,
        })
    }

    /// Delete logs created before `cutoff`. Returns the number removed.
    #[instrument(skip(self))]
    pub fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let n = self
            .conn()
            .execute("DELETE FROM sys_job_log WHERE created_at < ?1", [cutoff])?;
        info!(deleted = n, "job logs purged");
        Ok(n)
    }
}

fn where_clause(clauses: &[&str]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn offset(page: u32, size: u32) -> i64 {
    i64::from(page.saturating_sub(1)) * i64::from(size)
}

/// Map a row selected with `JOB_COLUMNS` to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let job_type: String = row.get(3)?;
    let job_type: JobType = job_type.parse().map_err(|e: SchedulerError| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        job_id: row.get(2)?,
        job_type,
        func_name: row.get(4)?,
        func_args: row.get(5)?,
        func_kwargs: row.get(6)?,
        cron_expression: row.get(7)?,
        interval_seconds: row.get(8)?,
        run_date: row.get(9)?,
        status: JobStatus::from_i64(row.get(10)?),
        description: row.get(11)?,
        remark: row.get(12)?,
        last_run_time: row.get(13)?,
        next_run_time: row.get(14)?,
        run_count: row.get(15)?,
        fail_count: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

/// Map a row selected with `LOG_COLUMNS` to a `JobLog`.
fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobLog> {
    Ok(JobLog {
        id: row.get(0)?,
        job_id: row.get(1)?,
        job_name: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        duration: row.get(5)?,
        status: LogStatus::from_i64(row.get(6)?),
        result: row.get(7)?,
        error: row.get(8)?,
        traceback: row.get(9)?,
        created_at: row.get(10)?,
    })
}
