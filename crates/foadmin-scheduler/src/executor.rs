use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use foadmin_core::config::OverlapPolicy;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::resolver::{TaskArgs, TaskRef};
use crate::store::JobStore;
use crate::types::{LogStatus, NewJobLog};

/// Stored as `result` when a task returns a falsy value.
pub const SUCCESS_MARKER: &str = "executed successfully";

/// What one execution produced, after it has been persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub job_id: String,
    pub log_id: i64,
    pub status: LogStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == LogStatus::Success
    }
}

/// Runs tasks, turns every error or panic into a log row, and keeps the
/// owning job's counters in step.
#[derive(Clone)]
pub struct Executor {
    store: JobStore,
    overlap: OverlapPolicy,
    /// One async lock per job id, held for the whole execution under
    /// `OverlapPolicy::Serialize`.
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Executor {
    pub fn new(store: JobStore, overlap: OverlapPolicy) -> Self {
        Self {
            store,
            overlap,
            slots: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    fn slot(&self, job_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.slots
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Drop the overlap slot of a job that no longer exists. A slot still
    /// held by a running execution is kept.
    pub fn forget(&self, job_id: &str) {
        self.slots
            .remove_if(job_id, |_, slot| Arc::strong_count(slot) == 1);
    }

    /// Invoke `task` once and record the attempt.
    ///
    /// Task failures never surface here; they are part of the returned
    /// outcome. `Err` means the log row or the statistics update could not
    /// be written.
    pub async fn execute(
        &self,
        job_id: &str,
        job_name: &str,
        task: TaskRef,
        args: TaskArgs,
    ) -> Result<ExecutionOutcome> {
        let _slot = match self.overlap {
            OverlapPolicy::Serialize => Some(self.slot(job_id).lock_owned().await),
            OverlapPolicy::Allow => None,
        };

        let start_time = Utc::now();
        let clock = Instant::now();
        let invocation = AssertUnwindSafe(task.run(args)).catch_unwind().await;
        let end_time = Utc::now();
        let duration = clock.elapsed().as_millis() as i64;

        let (status, result, error_msg, traceback) = match invocation {
            Ok(Ok(value)) => (LogStatus::Success, Some(render_result(&value)), None, None),
            Ok(Err(e)) => (
                LogStatus::Failure,
                None,
                Some(e.to_string()),
                Some(format!("{e:?}")),
            ),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                (
                    LogStatus::Failure,
                    None,
                    Some(format!("task panicked: {msg}")),
                    Some(format!("panic in job {job_id}: {msg}")),
                )
            }
        };

        match status {
            LogStatus::Success => info!(%job_id, duration_ms = duration, "job executed"),
            LogStatus::Failure => warn!(
                %job_id,
                duration_ms = duration,
                error = error_msg.as_deref().unwrap_or_default(),
                "job failed"
            ),
        }

        let log = NewJobLog {
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            start_time,
            end_time,
            duration,
            status,
            result: result.clone(),
            error: error_msg.clone(),
            traceback,
        };
        let log_id = self.store.record_execution(&log).map_err(|e| {
            error!(%job_id, %job_name, error = %e, "failed to record job execution");
            e
        })?;

        Ok(ExecutionOutcome {
            job_id: job_id.to_string(),
            log_id,
            status,
            result,
            error: error_msg,
            duration_ms: duration,
        })
    }
}

/// String form of a task's return value, or [`SUCCESS_MARKER`] when falsy.
pub fn render_result(value: &Value) -> String {
    let falsy = match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    };
    match value {
        _ if falsy => SUCCESS_MARKER.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::TaskTable;
    use crate::types::{JobStatus, JobType, LogFilter, NewJob};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn seeded_store(job_id: &str) -> JobStore {
        let store = JobStore::open_in_memory().unwrap();
        store
            .insert_job(&NewJob {
                name: "Seeded".to_string(),
                job_id: job_id.to_string(),
                job_type: JobType::Interval,
                func_name: "t.ok".to_string(),
                func_args: None,
                func_kwargs: None,
                cron_expression: None,
                interval_seconds: Some(60),
                run_date: None,
                status: JobStatus::Enabled,
                description: None,
                remark: None,
            })
            .unwrap();
        store
    }

    fn tasks() -> TaskTable {
        let mut table = TaskTable::new();
        table
            .register_fn("t.ok", |_| async { anyhow::Ok(Value::from("done")) })
            .unwrap();
        table
            .register_fn("t.empty", |_| async { anyhow::Ok(Value::Null) })
            .unwrap();
        table
            .register_fn("t.fail", |_| async {
                Err::<Value, _>(
                    anyhow::anyhow!("disk unavailable").context("backup step failed"),
                )
            })
            .unwrap();
        table
            .register_fn("t.panic", |_| async {
                if true {
                    panic!("boom");
                }
                anyhow::Ok(Value::Null)
            })
            .unwrap();
        table
    }

    #[tokio::test]
    async fn success_records_result_and_counts() {
        let store = seeded_store("j1");
        let exec = Executor::new(store.clone(), OverlapPolicy::Serialize);
        let task = tasks().resolve("t.ok").unwrap();

        let outcome = exec
            .execute("j1", "Seeded", task, TaskArgs::default())
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.result.as_deref(), Some("done"));

        let job = store.find_by_job_id("j1").unwrap().unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.fail_count, 0);
    }

    #[tokio::test]
    async fn forget_releases_idle_slots_only() {
        let store = seeded_store("j1");
        let exec = Executor::new(store, OverlapPolicy::Serialize);
        let task = tasks().resolve("t.ok").unwrap();
        exec.execute("j1", "Seeded", task, TaskArgs::default())
            .await
            .unwrap();
        assert!(exec.slots.contains_key("j1"));

        let held = exec.slot("j2");
        exec.forget("j2");
        assert!(exec.slots.contains_key("j2"));
        drop(held);

        exec.forget("j1");
        exec.forget("j2");
        exec.forget("never-ran");
        assert!(exec.slots.is_empty());
    }

    #[tokio::test]
    async fn falsy_result_uses_marker() {
        let store = seeded_store("j1");
        let exec = Executor::new(store, OverlapPolicy::Serialize);
        let task = tasks().resolve("t.empty").unwrap();
        let outcome = exec
            .execute("j1", "Seeded", task, TaskArgs::default())
            .await
            .unwrap();
        assert_eq!(outcome.result.as_deref(), Some(SUCCESS_MARKER));
    }

    #[tokio::test]
    async fn error_is_captured_with_trace() {
        let store = seeded_store("j1");
        let exec = Executor::new(store.clone(), OverlapPolicy::Serialize);
        let task = tasks().resolve("t.fail").unwrap();

        let outcome = exec
            .execute("j1", "Seeded", task, TaskArgs::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, LogStatus::Failure);
        assert_eq!(outcome.error.as_deref(), Some("backup step failed"));

        let logs = store.list_logs(&LogFilter::default(), 1, 10).unwrap();
        let row = &logs.items[0];
        assert_eq!(row.status, LogStatus::Failure);
        assert!(row.result.is_none());
        assert!(row.traceback.as_deref().unwrap().contains("disk unavailable"));

        let job = store.find_by_job_id("j1").unwrap().unwrap();
        assert_eq!((job.run_count, job.fail_count), (1, 1));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let store = seeded_store("j1");
        let exec = Executor::new(store.clone(), OverlapPolicy::Serialize);
        let task = tasks().resolve("t.panic").unwrap();

        let outcome = exec
            .execute("j1", "Seeded", task, TaskArgs::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, LogStatus::Failure);
        assert!(outcome.error.unwrap().contains("boom"));
        assert_eq!(store.find_by_job_id("j1").unwrap().unwrap().fail_count, 1);
    }

    #[tokio::test]
    async fn orphaned_execution_still_logs() {
        let store = JobStore::open_in_memory().unwrap();
        let exec = Executor::new(store.clone(), OverlapPolicy::Serialize);
        let task = tasks().resolve("t.ok").unwrap();
        exec.execute("gone", "Gone", task, TaskArgs::default())
            .await
            .unwrap();
        assert_eq!(store.list_logs(&LogFilter::default(), 1, 10).unwrap().total, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serialize_policy_prevents_overlap() {
        let store = seeded_store("j1");
        let exec = Executor::new(store.clone(), OverlapPolicy::Serialize);

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut table = TaskTable::new();
        {
            let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
            table
                .register_fn("t.slow", move |_| {
                    let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        anyhow::Ok(Value::Null)
                    }
                })
                .unwrap();
        }
        let task = table.resolve("t.slow").unwrap();

        let a = exec.execute("j1", "Seeded", Arc::clone(&task), TaskArgs::default());
        let b = exec.execute("j1", "Seeded", task, TaskArgs::default());
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(store.find_by_job_id("j1").unwrap().unwrap().run_count, 2);
    }

    #[test]
    fn render_result_follows_truthiness() {
        assert_eq!(render_result(&Value::from("Hello")), "Hello");
        assert_eq!(render_result(&Value::from(42)), "42");
        assert_eq!(render_result(&serde_json::json!({"n": 1})), r#"{"n":1}"#);
        for falsy in [
            Value::Null,
            Value::Bool(false),
            Value::from(0),
            Value::from(""),
            serde_json::json!([]),
            serde_json::json!({}),
        ] {
            assert_eq!(render_result(&falsy), SUCCESS_MARKER);
        }
    }
}
