use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::registry::JobRegistry;
use crate::resolver::{TaskArgs, TaskRef, TaskTable};
use crate::store::JobStore;
use crate::trigger::{build_trigger, ScheduleSpec, Trigger};
use crate::types::{decode_arguments, Job, JobType};

/// Result of the startup load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedJob {
    pub job_id: String,
    pub code: &'static str,
    pub reason: String,
}

/// A job definition that has passed validation and is ready to register.
pub struct Prepared {
    pub task: TaskRef,
    pub trigger: Trigger,
    pub args: TaskArgs,
}

/// Keeps the live registry in step with `sys_job`.
pub struct PersistenceBridge {
    store: JobStore,
    tasks: Arc<TaskTable>,
    registry: Arc<JobRegistry>,
}

impl PersistenceBridge {
    pub fn new(store: JobStore, tasks: Arc<TaskTable>, registry: Arc<JobRegistry>) -> Self {
        Self {
            store,
            tasks,
            registry,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Build the trigger, resolve the task and decode the arguments without
    /// touching the registry or the store.
    pub fn prepare<'a>(
        &self,
        schedule: impl Into<ScheduleSpec<'a>>,
        func_name: &str,
        func_args: Option<&str>,
        func_kwargs: Option<&str>,
    ) -> Result<Prepared> {
        let trigger = build_trigger(schedule)?;
        let task = self.tasks.resolve(func_name)?;
        let (args, kwargs) = decode_arguments(func_args, func_kwargs)?;
        Ok(Prepared {
            task,
            trigger,
            args: TaskArgs::new(args, kwargs),
        })
    }

    /// Register `job` in the registry and record its next fire time.
    ///
    /// A `date` job that has already run at or after its `run_date` is not
    /// registered again.
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    pub fn schedule(&self, job: &Job) -> Result<Option<DateTime<Utc>>> {
        let prepared = self.prepare(
            job,
            &job.func_name,
            job.func_args.as_deref(),
            job.func_kwargs.as_deref(),
        )?;

        if job.job_type == JobType::Date {
            if let (Some(last), Some(run_date)) = (job.last_run_time, job.run_date) {
                if last >= run_date {
                    info!(%run_date, "one-shot job already ran, not rescheduled");
                    self.registry.remove(&job.job_id);
                    return Ok(None);
                }
            }
        }

        let next = self.registry.add_or_replace(
            &job.job_id,
            &job.name,
            prepared.task,
            prepared.trigger,
            prepared.args,
        );
        self.persist_next_run_time(&job.job_id)?;
        Ok(next)
    }

    /// Copy the registry's next fire time for `job_id` onto its row. Nothing
    /// is written when the job has no next fire.
    pub fn persist_next_run_time(&self, job_id: &str) -> Result<()> {
        if let Some(next) = self.registry.next_run_time(job_id) {
            self.store.set_next_run_time(job_id, Some(next))?;
        }
        Ok(())
    }

    /// Schedule every enabled job. Jobs that fail to schedule are logged
    /// and skipped; their rows are left untouched.
    #[instrument(skip(self))]
    pub fn load_enabled_jobs(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for job in self.store.enabled_jobs()? {
            match self.schedule(&job) {
                Ok(_) => report.loaded.push(job.job_id),
                Err(e) => {
                    warn!(
                        job_id = %job.job_id,
                        func_name = %job.func_name,
                        code = e.code(),
                        error = %e,
                        "skipping job that cannot be scheduled"
                    );
                    report.skipped.push(SkippedJob {
                        job_id: job.job_id,
                        code: e.code(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "enabled jobs loaded"
        );
        Ok(report)
    }
}
