use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, SchedulerError};

/// Which schedule field of a [`Job`] drives its trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// `cron_expression`, 5 or 6 fields.
    Cron,
    /// `interval_seconds`, anchored to registration time.
    Interval,
    /// `run_date`, a single fire.
    Date,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobType::Cron => "cron",
            JobType::Interval => "interval",
            JobType::Date => "date",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cron" => Ok(JobType::Cron),
            "interval" => Ok(JobType::Interval),
            "date" => Ok(JobType::Date),
            other => Err(SchedulerError::Configuration(format!(
                "unknown job type: {other}"
            ))),
        }
    }
}

/// Whether a persisted job should be live in the registry. Travels as
/// `1` / `0` on the wire and in SQLite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "i64", try_from = "i64")]
pub enum JobStatus {
    #[default]
    Enabled,
    Paused,
}

impl JobStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            JobStatus::Enabled => 1,
            JobStatus::Paused => 0,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        if v == 1 {
            JobStatus::Enabled
        } else {
            JobStatus::Paused
        }
    }
}

/// Outcome recorded on a [`JobLog`] row, `1` for success and `0` for failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum LogStatus {
    Success,
    Failure,
}

impl LogStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            LogStatus::Success => 1,
            LogStatus::Failure => 0,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        if v == 1 {
            LogStatus::Success
        } else {
            LogStatus::Failure
        }
    }
}

macro_rules! status_conversions {
    ($ty:ident, $one:ident, $zero:ident) => {
        impl From<$ty> for i64 {
            fn from(status: $ty) -> i64 {
                status.as_i64()
            }
        }

        impl TryFrom<i64> for $ty {
            type Error = String;

            fn try_from(v: i64) -> std::result::Result<Self, String> {
                match v {
                    1 => Ok($ty::$one),
                    0 => Ok($ty::$zero),
                    other => Err(format!("{} must be 0 or 1, got {other}", stringify!($ty))),
                }
            }
        }
    };
}

status_conversions!(JobStatus, Enabled, Paused);
status_conversions!(LogStatus, Success, Failure);

/// A persisted job definition (`sys_job` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    /// Stable unique key shared with the in-memory registry.
    pub job_id: String,
    pub job_type: JobType,
    /// Dotted task path, e.g. `tasks.hello_task`.
    pub func_name: String,
    /// JSON array of positional arguments.
    pub func_args: Option<String>,
    /// JSON object of keyword arguments.
    pub func_kwargs: Option<String>,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub run_date: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub description: Option<String>,
    pub remark: Option<String>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub fail_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the stored argument blobs.
    pub fn arguments(&self) -> Result<(Vec<Value>, Map<String, Value>)> {
        decode_arguments(self.func_args.as_deref(), self.func_kwargs.as_deref())
    }
}

/// Decode `func_args` / `func_kwargs` text. Missing or blank text means "none".
pub fn decode_arguments(
    func_args: Option<&str>,
    func_kwargs: Option<&str>,
) -> Result<(Vec<Value>, Map<String, Value>)> {
    let args = match func_args.map(str::trim).filter(|s| !s.is_empty()) {
        None => Vec::new(),
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                return Err(SchedulerError::InvalidArguments(format!(
                    "func_args must be a JSON array, got {other}"
                )))
            }
            Err(e) => {
                return Err(SchedulerError::InvalidArguments(format!(
                    "func_args is not valid JSON: {e}"
                )))
            }
        },
    };

    let kwargs = match func_kwargs.map(str::trim).filter(|s| !s.is_empty()) {
        None => Map::new(),
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(SchedulerError::InvalidArguments(format!(
                    "func_kwargs must be a JSON object, got {other}"
                )))
            }
            Err(e) => {
                return Err(SchedulerError::InvalidArguments(format!(
                    "func_kwargs is not valid JSON: {e}"
                )))
            }
        },
    };

    Ok((args, kwargs))
}

/// A submitted `run_date`: an absolute instant, or a wall-clock time without
/// an offset that is read in the scheduler's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDate {
    At(DateTime<Utc>),
    Local(NaiveDateTime),
}

const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

impl RunDate {
    /// The absolute instant, reading a wall-clock value in `tz`. A time
    /// skipped by a DST jump is rejected; an ambiguous one takes the
    /// earlier instant.
    pub fn resolve(self, tz: Tz) -> Result<DateTime<Utc>> {
        match self {
            RunDate::At(at) => Ok(at),
            RunDate::Local(local) => tz
                .from_local_datetime(&local)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| {
                    SchedulerError::Configuration(format!(
                        "run_date {local} does not exist in {tz}"
                    ))
                }),
        }
    }

    /// The instant, if already absolute.
    pub fn instant(self) -> Option<DateTime<Utc>> {
        match self {
            RunDate::At(at) => Some(at),
            RunDate::Local(_) => None,
        }
    }
}

impl From<DateTime<Utc>> for RunDate {
    fn from(at: DateTime<Utc>) -> Self {
        RunDate::At(at)
    }
}

impl std::str::FromStr for RunDate {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(at) = DateTime::parse_from_rfc3339(s) {
            return Ok(RunDate::At(at.with_timezone(&Utc)));
        }
        LOCAL_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(RunDate::Local)
            .ok_or_else(|| SchedulerError::Configuration(format!("invalid run_date: {s:?}")))
    }
}

impl Serialize for RunDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RunDate::At(at) => serializer.serialize_str(&at.to_rfc3339()),
            RunDate::Local(local) => {
                serializer.collect_str(&local.format("%Y-%m-%dT%H:%M:%S%.f"))
            }
        }
    }
}

impl<'de> Deserialize<'de> for RunDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub job_id: String,
    pub job_type: JobType,
    pub func_name: String,
    #[serde(default)]
    pub func_args: Option<String>,
    #[serde(default)]
    pub func_kwargs: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub run_date: Option<RunDate>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
}

/// Partial update. `job_id` and `job_type` are immutable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub func_name: Option<String>,
    pub func_args: Option<String>,
    pub func_kwargs: Option<String>,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub run_date: Option<RunDate>,
    pub status: Option<JobStatus>,
    pub description: Option<String>,
    pub remark: Option<String>,
}

impl JobPatch {
    /// Overlay the set fields onto `job`. A wall-clock `run_date` is read
    /// in `tz`.
    pub fn apply(self, job: &mut Job, tz: Tz) -> Result<()> {
        if let Some(v) = self.name {
            job.name = v;
        }
        if let Some(v) = self.func_name {
            job.func_name = v;
        }
        if let Some(v) = self.func_args {
            job.func_args = Some(v);
        }
        if let Some(v) = self.func_kwargs {
            job.func_kwargs = Some(v);
        }
        if let Some(v) = self.cron_expression {
            job.cron_expression = Some(v);
        }
        if let Some(v) = self.interval_seconds {
            job.interval_seconds = Some(v);
        }
        if let Some(v) = self.run_date {
            job.run_date = Some(v.resolve(tz)?);
        }
        if let Some(v) = self.status {
            job.status = v;
        }
        if let Some(v) = self.description {
            job.description = Some(v);
        }
        if let Some(v) = self.remark {
            job.remark = Some(v);
        }
        Ok(())
    }
}

/// One execution attempt (`sys_job_log` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: String,
    /// Job name at the time of execution.
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole milliseconds.
    pub duration: Option<i64>,
    pub status: LogStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A log row before it has been assigned an id.
#[derive(Debug, Clone)]
pub struct NewJobLog {
    pub job_id: String,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: i64,
    pub status: LogStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub traceback: Option<String>,
}

/// Filters for listing jobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    /// Substring match on `name`.
    pub name: Option<String>,
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
}

/// Filters for listing job logs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub job_id: Option<String>,
    pub status: Option<LogStatus>,
}

/// One page of results plus the unpaginated total.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}
