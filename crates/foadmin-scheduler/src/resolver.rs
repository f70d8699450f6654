//! Task registration table. Jobs name their task by a dotted path
//! (`module.function`); the path is only ever a key into this table.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ResolveFailure, Result, SchedulerError};

/// Decoded positional and keyword arguments for one invocation.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Look up a parameter by keyword first, then by position.
    pub fn param(&self, index: usize, name: &str) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(index))
    }

    /// String parameter, falling back to `default` when absent or not a string.
    pub fn str_param<'a>(&'a self, index: usize, name: &str, default: &'a str) -> &'a str {
        self.param(index, name)
            .and_then(Value::as_str)
            .unwrap_or(default)
    }
}

/// A schedulable unit of work.
#[async_trait]
pub trait Task: Send + Sync {
    /// Run once. The returned value is stringified into the job log.
    async fn run(&self, args: TaskArgs) -> anyhow::Result<Value>;
}

/// Adapter so plain async closures can be registered.
struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, args: TaskArgs) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

pub type TaskRef = Arc<dyn Task>;

/// Module name → function name → task.
#[derive(Default)]
pub struct TaskTable {
    modules: BTreeMap<String, BTreeMap<String, TaskRef>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under `path`. A later registration of the same path
    /// replaces the earlier one.
    pub fn register<T: Task + 'static>(&mut self, path: &str, task: T) -> Result<()> {
        let (module, function) = split_path(path)?;
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(function.to_string(), Arc::new(task));
        debug!(task = %path, "task registered");
        Ok(())
    }

    /// Register an async closure under `path`.
    pub fn register_fn<F, Fut>(&mut self, path: &str, f: F) -> Result<()>
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(path, FnTask(f))
    }

    /// Resolve a dotted path to its task.
    ///
    /// On failure the known alternatives are logged, since a typo in a
    /// stored `func_name` is the usual cause.
    pub fn resolve(&self, path: &str) -> Result<TaskRef> {
        let (module, function) = split_path(path)?;

        let Some(functions) = self.modules.get(module) else {
            warn!(
                task = %path,
                known_modules = ?self.modules.keys().collect::<Vec<_>>(),
                "task module not registered"
            );
            return Err(resolution_error(path, module, ResolveFailure::UnknownModule));
        };

        match functions.get(function) {
            Some(task) => Ok(Arc::clone(task)),
            None => {
                warn!(
                    task = %path,
                    known_functions = ?functions.keys().collect::<Vec<_>>(),
                    "task function not registered in module"
                );
                Err(resolution_error(path, module, ResolveFailure::UnknownFunction))
            }
        }
    }

    /// Every registered dotted path, sorted.
    pub fn names(&self) -> Vec<String> {
        self.modules
            .iter()
            .flat_map(|(module, functions)| {
                functions.keys().map(move |f| format!("{module}.{f}"))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split at the last `.` into (module, function).
fn split_path(path: &str) -> Result<(&str, &str)> {
    match path.trim().rsplit_once('.') {
        Some((module, function)) if !module.is_empty() && !function.is_empty() => {
            Ok((module, function))
        }
        _ => Err(resolution_error(path, path, ResolveFailure::MissingSeparator)),
    }
}

fn resolution_error(path: &str, module: &str, reason: ResolveFailure) -> SchedulerError {
    SchedulerError::Resolution {
        path: path.to_string(),
        module: module.to_string(),
        reason,
    }
}
