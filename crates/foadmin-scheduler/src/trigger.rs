//! Trigger construction from a job's persisted schedule fields, and
//! next-fire computation for registered triggers.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use foadmin_core::config::PastDuePolicy;

use crate::error::{Result, SchedulerError};
use crate::types::{Job, JobType, NewJob, RunDate};

/// The schedule fields of a job, borrowed from either a stored [`Job`] or a
/// not-yet-persisted [`NewJob`].
#[derive(Debug, Clone, Copy)]
pub struct ScheduleSpec<'a> {
    pub job_type: JobType,
    pub cron_expression: Option<&'a str>,
    pub interval_seconds: Option<i64>,
    pub run_date: Option<DateTime<Utc>>,
}

impl<'a> From<&'a Job> for ScheduleSpec<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            job_type: job.job_type,
            cron_expression: job.cron_expression.as_deref(),
            interval_seconds: job.interval_seconds,
            run_date: job.run_date,
        }
    }
}

/// A wall-clock `run_date` must be resolved against the scheduler zone
/// first; until then it counts as missing.
impl<'a> From<&'a NewJob> for ScheduleSpec<'a> {
    fn from(job: &'a NewJob) -> Self {
        Self {
            job_type: job.job_type,
            cron_expression: job.cron_expression.as_deref(),
            interval_seconds: job.interval_seconds,
            run_date: job.run_date.and_then(RunDate::instant),
        }
    }
}

/// A rule producing fire timestamps.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Cron recurrence evaluated in the registry's timezone.
    Cron {
        expression: String,
        schedule: cron::Schedule,
    },
    /// Fixed period, counted from the registration instant.
    Interval { period: Duration },
    /// A single fire.
    Date { run_at: DateTime<Utc> },
}

/// Build a trigger from the schedule fields selected by `job_type`.
pub fn build_trigger<'a>(spec: impl Into<ScheduleSpec<'a>>) -> Result<Trigger> {
    let spec = spec.into();
    match spec.job_type {
        JobType::Cron => {
            let expression = spec
                .cron_expression
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    SchedulerError::Configuration(
                        "cron job requires a cron_expression".to_string(),
                    )
                })?;
            let normalized = normalize_cron(expression)?;
            let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
                SchedulerError::Configuration(format!("invalid cron expression {expression:?}: {e}"))
            })?;
            Ok(Trigger::Cron {
                expression: expression.to_string(),
                schedule,
            })
        }
        JobType::Interval => match spec.interval_seconds {
            Some(secs) if secs > 0 => Duration::try_seconds(secs)
                .map(|period| Trigger::Interval { period })
                .ok_or_else(|| {
                    SchedulerError::Configuration(format!("interval_seconds too large: {secs}"))
                }),
            Some(secs) => Err(SchedulerError::Configuration(format!(
                "interval_seconds must be positive, got {secs}"
            ))),
            None => Err(SchedulerError::Configuration(
                "interval job requires interval_seconds".to_string(),
            )),
        },
        JobType::Date => spec
            .run_date
            .map(|run_at| Trigger::Date { run_at })
            .ok_or_else(|| {
                SchedulerError::Configuration("date job requires a run_date".to_string())
            }),
    }
}

/// Map a 5-field (minute-resolution) or 6-field (second-resolution)
/// expression onto the seconds-first format of the `cron` crate.
///
/// Day-of-week numbers follow crontab (0-7, both 0 and 7 are Sunday) and are
/// rewritten into the crate's Sunday-first 1-7 numbering.
fn normalize_cron(expression: &str) -> Result<String> {
    let mut fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => fields.insert(0, "0"),
        6 => {}
        n => {
            return Err(SchedulerError::Configuration(format!(
                "cron expression must have 5 or 6 fields, got {n}: {expression:?}"
            )))
        }
    }
    let day_of_week = crontab_day_of_week(fields[5]).ok_or_else(|| {
        SchedulerError::Configuration(format!(
            "invalid day-of-week field {:?} in cron expression {expression:?}",
            fields[5]
        ))
    })?;
    Ok(format!("{} {day_of_week}", fields[..5].join(" ")))
}

/// Rewrite a crontab day-of-week field as an explicit list of `cron` crate
/// day numbers. Named days (`MON`, `Mon-Fri`) pass through untouched.
fn crontab_day_of_week(field: &str) -> Option<String> {
    if field == "*" || field == "?" {
        return Some(field.to_string());
    }
    let mut days = BTreeSet::new();
    let mut named = Vec::new();
    for part in field.split(',') {
        if part.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(part.to_string());
            continue;
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (part, 1),
        };
        let (lo, hi) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((lo, hi)) => (crontab_day(lo)?, crontab_day(hi)?),
            // `n/step` runs to the end of the week.
            None if part.contains('/') => (crontab_day(range)?, 6),
            None => {
                let day = crontab_day(range)?;
                (day, day)
            }
        };
        if lo > hi {
            return None;
        }
        // Crontab Sunday is 0 or 7; the crate's Sunday is 1.
        days.extend((lo..=hi).step_by(step).map(|d| d % 7 + 1));
    }
    let parts: Vec<String> = days
        .iter()
        .map(u32::to_string)
        .chain(named)
        .collect();
    (!parts.is_empty()).then(|| parts.join(","))
}

fn crontab_day(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|d| *d <= 7)
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Cron { expression, .. } => write!(f, "cron[{expression}]"),
            Trigger::Interval { period } => write!(f, "interval[{}s]", period.num_seconds()),
            Trigger::Date { run_at } => write!(f, "date[{}]", run_at.to_rfc3339()),
        }
    }
}

/// A trigger bound to its registration instant, zone and misfire policy.
#[derive(Debug, Clone)]
pub struct ArmedTrigger {
    trigger: Trigger,
    anchor: DateTime<Utc>,
    tz: Tz,
    past_due: PastDuePolicy,
}

impl ArmedTrigger {
    pub fn new(trigger: Trigger, anchor: DateTime<Utc>, tz: Tz, past_due: PastDuePolicy) -> Self {
        Self {
            trigger,
            anchor,
            tz,
            past_due,
        }
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Next fire strictly after both `now` and the `previous` fire.
    ///
    /// `None` means the trigger is exhausted: a one-shot that already fired,
    /// or one whose date passed under [`PastDuePolicy::Expire`].
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let base = previous.map_or(now, |p| p.max(now));
        match &self.trigger {
            Trigger::Cron { schedule, .. } => schedule
                .after(&base.with_timezone(&self.tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc)),
            Trigger::Interval { period } => {
                let period_ms = period.num_milliseconds().max(1);
                let elapsed_ms = (base - self.anchor).num_milliseconds();
                // Fires sit on the grid anchor + k * period, k >= 1.
                let k = if elapsed_ms < 0 {
                    1
                } else {
                    elapsed_ms / period_ms + 1
                };
                self.anchor
                    .checked_add_signed(Duration::milliseconds(k.saturating_mul(period_ms)))
            }
            Trigger::Date { run_at } => {
                if previous.is_some() {
                    None
                } else if *run_at > now {
                    Some(*run_at)
                } else {
                    match self.past_due {
                        // Sleeping until a past instant returns at once.
                        PastDuePolicy::Fire => Some(*run_at),
                        PastDuePolicy::Expire => None,
                    }
                }
            }
        }
    }
}
