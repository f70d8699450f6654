//! `foadmin-scheduler`: persistent job scheduling for the admin backend.
//!
//! # Overview
//!
//! Job definitions live in the SQLite `sys_job` table and every execution
//! attempt is appended to `sys_job_log`. At startup the
//! [`lifecycle::Scheduler`] loads each enabled job into the in-memory
//! [`registry::JobRegistry`], where a dedicated tokio task sleeps until the
//! job's next fire time and hands the work to the [`executor::Executor`].
//!
//! # Job types
//!
//! | Type       | Schedule field     | Behaviour                                   |
//! |------------|--------------------|---------------------------------------------|
//! | `cron`     | `cron_expression`  | 5 fields (second fixed to 0) or 6 fields    |
//! | `interval` | `interval_seconds` | Every N seconds from registration           |
//! | `date`     | `run_date`         | Single fire; past dates follow config       |
//!
//! Tasks are looked up by dotted name (`tasks.hello_task`) in a
//! [`resolver::TaskTable`] populated at startup.

pub mod bridge;
pub mod db;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod store;
pub mod tasks;
pub mod trigger;
pub mod types;

pub use bridge::{LoadReport, PersistenceBridge};
pub use error::{Result, SchedulerError};
pub use executor::{ExecutionOutcome, Executor};
pub use lifecycle::Scheduler;
pub use registry::{FireEvent, JobRegistry};
pub use resolver::{Task, TaskArgs, TaskTable};
pub use service::JobService;
pub use store::JobStore;
pub use types::{Job, JobFilter, JobLog, JobPatch, JobStatus, JobType, LogFilter, LogStatus, NewJob, Page, RunDate};
