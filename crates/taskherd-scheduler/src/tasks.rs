//! Task definitions: the schedulable unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::args::TaskArguments;
use crate::report::InvocationResult;

/// A persisted, schedulable invocation of a predefined command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Row id; 0 until inserted.
    pub id: i64,
    /// Human-readable name.
    pub name: String,
    /// Name of the predefined command to invoke.
    pub command: String,
    /// Raw argument string, see [`TaskArguments`].
    pub arguments: String,
    pub category: Option<String>,
    /// How this task is used.
    pub note: Option<String>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Initial scheduling. `None` means "run now" when launched.
    pub scheduling: Option<DateTime<Utc>>,
    pub repetition_period: Option<RepetitionPeriod>,
    pub repetition_rate: Option<u32>,
    /// Handle into the external queue. Set iff `status == Scheduled`.
    pub scheduled_job_id: Option<String>,
    /// Projection of the most recent execution report.
    #[serde(flatten)]
    pub cache: CacheFields,
    /// Next fire time as reported by the queue.
    pub next_ride: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Idle,
    /// Waiting in the queue for an immediate run.
    Spooled,
    Scheduled,
    Started,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Spooled => "spooled",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Started => "started",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TaskStatus::Idle),
            "spooled" => Ok(TaskStatus::Spooled),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "started" => Ok(TaskStatus::Started),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Unit of a periodic task's repetition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepetitionPeriod {
    Minute,
    Hour,
    Day,
    Week,
    /// Fixed 30 days, not calendar months.
    Month,
}

impl RepetitionPeriod {
    pub fn unit_seconds(&self) -> u64 {
        match self {
            RepetitionPeriod::Minute => 60,
            RepetitionPeriod::Hour => 60 * 60,
            RepetitionPeriod::Day => 24 * 60 * 60,
            RepetitionPeriod::Week => 7 * 24 * 60 * 60,
            RepetitionPeriod::Month => 30 * 24 * 60 * 60,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepetitionPeriod::Minute => "minute",
            RepetitionPeriod::Hour => "hour",
            RepetitionPeriod::Day => "day",
            RepetitionPeriod::Week => "week",
            RepetitionPeriod::Month => "month",
        }
    }
}

impl fmt::Display for RepetitionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepetitionPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(RepetitionPeriod::Minute),
            "hour" => Ok(RepetitionPeriod::Hour),
            "day" => Ok(RepetitionPeriod::Day),
            "week" => Ok(RepetitionPeriod::Week),
            "month" => Ok(RepetitionPeriod::Month),
            other => Err(format!("unknown repetition period '{other}'")),
        }
    }
}

/// Denormalized summary of a task's most recent execution report.
///
/// Never authoritative: always rebuilt with [`CacheFields::project`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFields {
    pub last_invocation_datetime: Option<DateTime<Utc>>,
    pub last_invocation_result: Option<InvocationResult>,
    pub last_invocation_n_errors: Option<u32>,
    pub last_invocation_n_warnings: Option<u32>,
}

/// What [`CacheFields::project`] needs from the latest report.
#[derive(Debug, Clone, Copy)]
pub struct LatestReport {
    pub invocation_datetime: DateTime<Utc>,
    pub invocation_result: InvocationResult,
    pub n_errors: u32,
    pub n_warnings: u32,
}

impl CacheFields {
    /// Project the latest report onto the cached fields; no report clears them.
    pub fn project(latest: Option<LatestReport>) -> Self {
        match latest {
            Some(r) => Self {
                last_invocation_datetime: Some(r.invocation_datetime),
                last_invocation_result: Some(r.invocation_result),
                last_invocation_n_errors: Some(r.n_errors),
                last_invocation_n_warnings: Some(r.n_warnings),
            },
            None => Self::default(),
        }
    }
}

impl Task {
    /// Create an unscheduled task.
    pub fn new(name: &str, command: &str, arguments: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            command: command.to_string(),
            arguments: arguments.to_string(),
            category: None,
            note: None,
            status: TaskStatus::Idle,
            scheduling: None,
            repetition_period: None,
            repetition_rate: None,
            scheduled_job_id: None,
            cache: CacheFields::default(),
            next_ride: None,
            created_at: Utc::now(),
        }
    }

    /// Set the initial scheduling.
    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.scheduling = Some(when);
        self
    }

    /// Repeat every `rate` × `period` after the initial scheduling.
    pub fn every(mut self, rate: u32, period: RepetitionPeriod) -> Self {
        self.repetition_rate = Some(rate);
        self.repetition_period = Some(period);
        self
    }

    /// Periodic iff both period and a positive rate are set.
    pub fn is_periodic(&self) -> bool {
        self.repetition_period.is_some() && self.repetition_rate.is_some_and(|r| r > 0)
    }

    /// Repetition interval, for periodic tasks.
    pub fn interval_in_seconds(&self) -> Option<u64> {
        if !self.is_periodic() {
            return None;
        }
        let period = self.repetition_period?;
        let rate = self.repetition_rate?;
        Some(period.unit_seconds() * rate as u64)
    }

    /// Parsed arguments.
    pub fn args(&self) -> TaskArguments {
        TaskArguments::parse(&self.arguments)
    }

    /// "<rate> <period>", or "-" for one-shot tasks.
    pub fn repetition(&self) -> String {
        match (self.repetition_rate, self.repetition_period) {
            (Some(rate), Some(period)) if rate > 0 => format!("{rate} {period}"),
            _ => "-".into(),
        }
    }

    /// Clear everything that points into the queue.
    pub(crate) fn reset_schedule(&mut self) {
        self.scheduled_job_id = None;
        self.next_ride = None;
        self.status = TaskStatus::Idle;
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_in_seconds() {
        let task = Task::new("sync", "emit_logs", "").every(2, RepetitionPeriod::Day);
        assert!(task.is_periodic());
        assert_eq!(task.interval_in_seconds(), Some(172_800));
    }

    #[test]
    fn test_month_is_thirty_days() {
        let task = Task::new("bill", "emit_logs", "").every(1, RepetitionPeriod::Month);
        assert_eq!(task.interval_in_seconds(), Some(2_592_000));
    }

    #[test]
    fn test_not_periodic_without_both_fields() {
        let mut task = Task::new("once", "emit_logs", "");
        assert!(!task.is_periodic());
        task.repetition_period = Some(RepetitionPeriod::Hour);
        assert!(!task.is_periodic());
        task.repetition_rate = Some(0);
        assert!(!task.is_periodic());
        assert_eq!(task.interval_in_seconds(), None);
        assert_eq!(task.repetition(), "-");
    }

    #[test]
    fn test_repetition_label() {
        let task = Task::new("t", "c", "").every(3, RepetitionPeriod::Week);
        assert_eq!(task.repetition(), "3 week");
    }

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            TaskStatus::Idle,
            TaskStatus::Spooled,
            TaskStatus::Scheduled,
            TaskStatus::Started,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_project_cache() {
        let now = Utc::now();
        let cache = CacheFields::project(Some(LatestReport {
            invocation_datetime: now,
            invocation_result: InvocationResult::Errors,
            n_errors: 1,
            n_warnings: 0,
        }));
        assert_eq!(cache.last_invocation_result, Some(InvocationResult::Errors));
        assert_eq!(cache.last_invocation_n_errors, Some(1));
        assert_eq!(cache.last_invocation_datetime, Some(now));
        assert_eq!(CacheFields::project(None), CacheFields::default());
    }
}
