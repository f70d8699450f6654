use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::bridge::PersistenceBridge;
use crate::error::{Result, SchedulerError};
use crate::executor::ExecutionOutcome;
use crate::registry::JobRegistry;
use crate::resolver::TaskArgs;
use crate::store::JobStore;
use crate::types::{
    Job, JobFilter, JobLog, JobPatch, JobStatus, LogFilter, NewJob, Page, RunDate,
};

pub const DEFAULT_JOB_PAGE_SIZE: u32 = 20;
pub const MAX_JOB_PAGE_SIZE: u32 = 100;
pub const DEFAULT_LOG_PAGE_SIZE: u32 = 50;
pub const MAX_LOG_PAGE_SIZE: u32 = 200;
pub const DEFAULT_CLEAR_DAYS: i64 = 30;

/// Admin operations over persisted jobs, kept in step with the live
/// registry.
#[derive(Clone)]
pub struct JobService {
    bridge: Arc<PersistenceBridge>,
}

impl JobService {
    pub fn new(bridge: Arc<PersistenceBridge>) -> Self {
        Self { bridge }
    }

    fn store(&self) -> &JobStore {
        self.bridge.store()
    }

    fn registry(&self) -> &JobRegistry {
        self.bridge.registry()
    }

    /// Replace the stored next run time with the live one, when live.
    fn overlay(&self, mut job: Job) -> Job {
        if let Some(next) = self.registry().next_run_time(&job.job_id) {
            job.next_run_time = Some(next);
        }
        job
    }

    #[instrument(skip(self))]
    pub fn list_jobs(&self, filter: &JobFilter, page: u32, size: u32) -> Result<Page<Job>> {
        check_page(page, size, MAX_JOB_PAGE_SIZE)?;
        let mut result = self.store().list_jobs(filter, page, size)?;
        result.items = result
            .items
            .into_iter()
            .map(|job| self.overlay(job))
            .collect();
        Ok(result)
    }

    pub fn get_job(&self, id: i64) -> Result<Job> {
        Ok(self.overlay(self.store().get_job(id)?))
    }

    /// Validate, persist and (when enabled) schedule a new job. Nothing is
    /// written when validation fails. A `run_date` without an offset is
    /// read in the scheduler timezone.
    #[instrument(skip(self, new), fields(job_id = %new.job_id))]
    pub fn create_job(&self, mut new: NewJob) -> Result<Job> {
        let tz = self.registry().timezone();
        new.run_date = new
            .run_date
            .map(|d| d.resolve(tz).map(RunDate::At))
            .transpose()?;
        require("name", &new.name)?;
        require("job_id", &new.job_id)?;
        require("func_name", &new.func_name)?;
        if self.store().find_by_job_id(&new.job_id)?.is_some() {
            return Err(SchedulerError::Conflict { job_id: new.job_id });
        }
        self.bridge.prepare(
            &new,
            &new.func_name,
            new.func_args.as_deref(),
            new.func_kwargs.as_deref(),
        )?;

        let job = self.store().insert_job(&new)?;
        if job.status == JobStatus::Enabled {
            self.bridge.schedule(&job)?;
        }
        info!(id = job.id, "job created");
        self.get_job(job.id)
    }

    /// Apply `patch`, re-validate, persist and reschedule.
    #[instrument(skip(self, patch))]
    pub fn update_job(&self, id: i64, patch: JobPatch) -> Result<Job> {
        let mut job = self.store().get_job(id)?;
        patch.apply(&mut job, self.registry().timezone())?;
        require("name", &job.name)?;
        require("func_name", &job.func_name)?;
        self.bridge.prepare(
            &job,
            &job.func_name,
            job.func_args.as_deref(),
            job.func_kwargs.as_deref(),
        )?;

        let job = self.store().update_job(&job)?;
        if job.status == JobStatus::Enabled {
            // Swaps the live entry in place.
            self.bridge.schedule(&job)?;
        } else {
            self.registry().remove(&job.job_id);
            self.store().set_next_run_time(&job.job_id, None)?;
        }
        info!(job_id = %job.job_id, "job updated");
        self.get_job(id)
    }

    #[instrument(skip(self))]
    pub fn delete_job(&self, id: i64) -> Result<()> {
        let job = self.store().get_job(id)?;
        self.registry().remove(&job.job_id);
        self.store().delete_job(id)?;
        self.registry().executor().forget(&job.job_id);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn pause_job(&self, id: i64) -> Result<()> {
        let job = self.store().get_job(id)?;
        self.store().set_status(id, JobStatus::Paused)?;
        match self.registry().pause(&job.job_id) {
            Ok(()) => {}
            Err(SchedulerError::NotFound { .. }) => {
                debug!(job_id = %job.job_id, "job not live, status updated only");
            }
            Err(e) => return Err(e),
        }
        self.store().set_next_run_time(&job.job_id, None)
    }

    #[instrument(skip(self))]
    pub fn resume_job(&self, id: i64) -> Result<Option<DateTime<Utc>>> {
        let mut job = self.store().get_job(id)?;
        self.store().set_status(id, JobStatus::Enabled)?;
        job.status = JobStatus::Enabled;

        if self.registry().contains(&job.job_id) {
            let next = self.registry().resume(&job.job_id)?;
            self.bridge.persist_next_run_time(&job.job_id)?;
            Ok(next)
        } else {
            self.bridge.schedule(&job)
        }
    }

    /// Submit one immediate execution of job `id`, independent of its
    /// schedule and pause state.
    ///
    /// Resolution and argument errors are returned here. Task failures end
    /// up in the job log.
    #[instrument(skip(self))]
    pub fn run_job_now(&self, id: i64) -> Result<JoinHandle<Result<ExecutionOutcome>>> {
        let job = self.store().get_job(id)?;
        let task = self.bridge.tasks().resolve(&job.func_name)?;
        let (args, kwargs) = job.arguments()?;
        let executor = self.registry().executor().clone();

        info!(job_id = %job.job_id, "job submitted for immediate run");
        Ok(tokio::spawn(async move {
            executor
                .execute(&job.job_id, &job.name, task, TaskArgs::new(args, kwargs))
                .await
        }))
    }

    pub fn list_logs(&self, filter: &LogFilter, page: u32, size: u32) -> Result<Page<JobLog>> {
        check_page(page, size, MAX_LOG_PAGE_SIZE)?;
        self.store().list_logs(filter, page, size)
    }

    /// Delete logs created more than `days` days ago.
    #[instrument(skip(self))]
    pub fn clear_logs(&self, days: i64) -> Result<usize> {
        if days < 1 {
            return Err(SchedulerError::InvalidRequest(format!(
                "days must be at least 1, got {days}"
            )));
        }
        let now = Utc::now();
        let cutoff = Duration::try_days(days)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store().purge_logs_before(cutoff)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SchedulerError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

fn check_page(page: u32, size: u32, max_size: u32) -> Result<()> {
    if page < 1 {
        return Err(SchedulerError::InvalidRequest("page must be at least 1".to_string()));
    }
    if !(1..=max_size).contains(&size) {
        return Err(SchedulerError::InvalidRequest(format!(
            "size must be between 1 and {max_size}, got {size}"
        )));
    }
    Ok(())
}
