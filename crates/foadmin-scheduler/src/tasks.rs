//! Tasks shipped with the scheduler.
//!
//! Each is registered under `tasks.<name>` and, so that rows written by
//! older deployments keep resolving, under `app.tasks.demo.<name>`.

use async_trait::async_trait;
use chrono::{Duration, Local, Utc};
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::resolver::{Task, TaskArgs, TaskTable};
use crate::store::JobStore;

const MODULES: [&str; 2] = ["tasks", "app.tasks.demo"];

/// Register every built-in task in `table`.
pub fn register_builtin(table: &mut TaskTable, store: JobStore, retention_days: u32) -> Result<()> {
    for module in MODULES {
        table.register_fn(&format!("{module}.hello_task"), |args| async move {
            anyhow::Ok(Value::from(hello(&args)))
        })?;
        table.register(
            &format!("{module}.cleanup_old_logs"),
            CleanupOldLogs {
                store: store.clone(),
                default_days: retention_days,
            },
        )?;
        table.register_fn(&format!("{module}.database_backup"), |_| async {
            let msg = "Database backup task executed";
            info!("{msg}");
            anyhow::Ok(Value::from(msg))
        })?;
        table.register_fn(&format!("{module}.send_daily_report"), |_| async {
            let msg = "Daily report sent";
            info!("{msg}");
            anyhow::Ok(Value::from(msg))
        })?;
    }
    Ok(())
}

fn hello(args: &TaskArgs) -> String {
    let name = args.str_param(0, "name", "World");
    let msg = format!(
        "Hello, {name}! Current time: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.6f")
    );
    info!("{msg}");
    msg
}

/// Purges job logs older than `days` (first argument or `days` keyword).
struct CleanupOldLogs {
    store: JobStore,
    default_days: u32,
}

#[async_trait]
impl Task for CleanupOldLogs {
    async fn run(&self, args: TaskArgs) -> anyhow::Result<Value> {
        let days = match args.param(0, "days") {
            None => i64::from(self.default_days),
            Some(v) => v
                .as_i64()
                .filter(|d| *d >= 1)
                .ok_or_else(|| anyhow::anyhow!("days must be a positive integer, got {v}"))?,
        };
        let cutoff = Utc::now() - Duration::days(days);
        let deleted = self.store.purge_logs_before(cutoff)?;
        let msg = format!("Cleaned up {deleted} old job logs");
        info!("{msg}");
        Ok(Value::from(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogFilter, LogStatus, NewJobLog};
    use serde_json::{json, Map};

    fn table(store: &JobStore) -> TaskTable {
        let mut table = TaskTable::new();
        register_builtin(&mut table, store.clone(), 30).unwrap();
        table
    }

    #[tokio::test]
    async fn hello_greets_by_position_or_keyword() {
        let store = JobStore::open_in_memory().unwrap();
        let task = table(&store).resolve("tasks.hello_task").unwrap();

        let out = task
            .run(TaskArgs::new(vec![json!("World")], Map::new()))
            .await
            .unwrap();
        assert!(out.as_str().unwrap().starts_with("Hello, World! Current time: "));

        let mut kwargs = Map::new();
        kwargs.insert("name".into(), json!("Ops"));
        let out = task.run(TaskArgs::new(Vec::new(), kwargs)).await.unwrap();
        assert!(out.as_str().unwrap().starts_with("Hello, Ops!"));
    }

    #[tokio::test]
    async fn long_names_resolve_to_the_same_tasks() {
        let store = JobStore::open_in_memory().unwrap();
        let table = table(&store);
        assert_eq!(table.len(), 8);
        let out = table
            .resolve("app.tasks.demo.send_daily_report")
            .unwrap()
            .run(TaskArgs::default())
            .await
            .unwrap();
        assert_eq!(out, json!("Daily report sent"));
    }

    #[tokio::test]
    async fn cleanup_purges_rows_older_than_window() {
        let store = JobStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .record_execution(&NewJobLog {
                job_id: "x".to_string(),
                job_name: "X".to_string(),
                start_time: now,
                end_time: now,
                duration: 0,
                status: LogStatus::Success,
                result: None,
                error: None,
                traceback: None,
            })
            .unwrap();
        let task = table(&store).resolve("tasks.cleanup_old_logs").unwrap();

        let out = task.run(TaskArgs::default()).await.unwrap();
        assert_eq!(out, json!("Cleaned up 0 old job logs"));
        assert_eq!(store.list_logs(&LogFilter::default(), 1, 10).unwrap().total, 1);

        assert!(task
            .run(TaskArgs::new(vec![json!(0)], Map::new()))
            .await
            .is_err());
    }
}
