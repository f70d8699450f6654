use std::sync::{Arc, Mutex};

use foadmin_core::config::SchedulerConfig;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{LoadReport, PersistenceBridge};
use crate::error::{Result, SchedulerError};
use crate::executor::Executor;
use crate::registry::{FireEvent, JobRegistry};
use crate::resolver::TaskTable;
use crate::store::JobStore;

/// Owns the registry's run state and the fire-event listener.
pub struct Scheduler {
    bridge: Arc<PersistenceBridge>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(bridge: Arc<PersistenceBridge>) -> Self {
        Self {
            bridge,
            listener: Mutex::new(None),
        }
    }

    /// Wire store, task table, executor and registry from `config`.
    pub fn build(store: JobStore, tasks: TaskTable, config: &SchedulerConfig) -> Result<Self> {
        let tz = config
            .tz()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;
        let executor = Executor::new(store.clone(), config.overlap);
        let registry = Arc::new(JobRegistry::new(tz, config.past_due_one_shot, executor));
        let bridge = Arc::new(PersistenceBridge::new(store, Arc::new(tasks), registry));
        Ok(Self::new(bridge))
    }

    pub fn bridge(&self) -> &Arc<PersistenceBridge> {
        &self.bridge
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.bridge.registry()
    }

    pub fn is_running(&self) -> bool {
        self.registry().is_running()
    }

    /// Start the registry, spawn the event listener and load every enabled
    /// job. Returns `None` when already running.
    pub fn start(&self) -> Result<Option<LoadReport>> {
        let events = self.registry().subscribe();
        if !self.registry().start() {
            debug!("scheduler already running");
            return Ok(None);
        }

        let handle = tokio::spawn(listen(events));
        if let Some(old) = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle)
        {
            old.abort();
        }

        let report = self.bridge.load_enabled_jobs()?;
        info!(
            timezone = %self.registry().timezone(),
            jobs = report.loaded.len(),
            "scheduler started"
        );
        Ok(Some(report))
    }

    /// Cancel every driver. In-flight executions are not awaited.
    pub fn shutdown(&self) -> bool {
        if !self.registry().shutdown() {
            return false;
        }
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
        info!("scheduler stopped");
        true
    }
}

/// Log every fire outcome.
async fn listen(mut events: broadcast::Receiver<FireEvent>) {
    loop {
        match events.recv().await {
            Ok(FireEvent::Executed {
                job_id,
                scheduled_for,
                outcome,
            }) => {
                if outcome.succeeded() {
                    info!(
                        %job_id,
                        %scheduled_for,
                        duration_ms = outcome.duration_ms,
                        log_id = outcome.log_id,
                        "job fired"
                    );
                } else {
                    warn!(
                        %job_id,
                        %scheduled_for,
                        duration_ms = outcome.duration_ms,
                        error = outcome.error.as_deref().unwrap_or_default(),
                        "job fired with failure"
                    );
                }
            }
            Ok(FireEvent::PersistenceFailed {
                job_id,
                scheduled_for,
                error,
            }) => {
                error!(%job_id, %scheduled_for, %error, "job fired but its log could not be written");
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "fire event listener lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStatus, JobType, NewJob};
    use serde_json::Value;

    fn scheduler() -> Scheduler {
        let store = JobStore::open_in_memory().unwrap();
        store
            .insert_job(&NewJob {
                name: "Hourly".to_string(),
                job_id: "hourly".to_string(),
                job_type: JobType::Cron,
                func_name: "tasks.noop".to_string(),
                func_args: None,
                func_kwargs: None,
                cron_expression: Some("0 * * * *".to_string()),
                interval_seconds: None,
                run_date: None,
                status: JobStatus::Enabled,
                description: None,
                remark: None,
            })
            .unwrap();
        let mut tasks = TaskTable::new();
        tasks
            .register_fn("tasks.noop", |_| async { anyhow::Ok(Value::Null) })
            .unwrap();
        let config = SchedulerConfig {
            timezone: "UTC".to_string(),
            ..SchedulerConfig::default()
        };
        Scheduler::build(store, tasks, &config).unwrap()
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let scheduler = scheduler();

        let report = scheduler.start().unwrap().expect("first start loads jobs");
        assert_eq!(report.loaded, vec!["hourly".to_string()]);
        assert!(scheduler.start().unwrap().is_none());
        assert_eq!(scheduler.registry().len(), 1);

        assert!(scheduler.shutdown());
        assert!(!scheduler.shutdown());
        assert!(!scheduler.is_running());
        assert!(scheduler.registry().is_empty());

        // A restart reloads from the store.
        assert!(scheduler.start().unwrap().is_some());
        assert!(scheduler.registry().contains("hourly"));
        scheduler.shutdown();
    }

    #[test]
    fn unknown_timezone_is_a_configuration_error() {
        let config = SchedulerConfig {
            timezone: "Nowhere/Special".to_string(),
            ..SchedulerConfig::default()
        };
        let result = Scheduler::build(JobStore::open_in_memory().unwrap(), TaskTable::new(), &config);
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }
}
