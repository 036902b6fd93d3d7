//! Execution reports and their log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification of one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InvocationResult {
    /// Not classified yet: the run is in progress or crashed before finishing.
    #[default]
    None,
    Ok,
    Failed,
    Errors,
    Warnings,
}

impl InvocationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationResult::None => "none",
            InvocationResult::Ok => "ok",
            InvocationResult::Failed => "failed",
            InvocationResult::Errors => "errors",
            InvocationResult::Warnings => "warnings",
        }
    }

    /// ok(0) < warnings(10) < errors(20) < failed(30); unclassified has none.
    pub fn severity(&self) -> Option<u8> {
        match self {
            InvocationResult::None => None,
            InvocationResult::Ok => Some(0),
            InvocationResult::Warnings => Some(10),
            InvocationResult::Errors => Some(20),
            InvocationResult::Failed => Some(30),
        }
    }

    /// Classify a finished run from its failure flag and log counts.
    pub fn classify(failed: bool, n_errors: u32, n_warnings: u32) -> Self {
        if failed {
            InvocationResult::Failed
        } else if n_errors > 0 {
            InvocationResult::Errors
        } else if n_warnings > 0 {
            InvocationResult::Warnings
        } else {
            InvocationResult::Ok
        }
    }
}

impl fmt::Display for InvocationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvocationResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(InvocationResult::None),
            "ok" => Ok(InvocationResult::Ok),
            "failed" => Ok(InvocationResult::Failed),
            "errors" => Ok(InvocationResult::Errors),
            "warnings" => Ok(InvocationResult::Warnings),
            other => Err(format!("unknown invocation result '{other}'")),
        }
    }
}

/// The record of one invocation of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: i64,
    pub task_id: i64,
    pub invocation_result: InvocationResult,
    /// Set when the report is created, before the command runs.
    pub invocation_datetime: DateTime<Utc>,
}

/// Log line severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    /// Lowest level kept in a run log at the given verbosity: 0 errors only,
    /// 1 warnings, 2 info, 3 debug. Anything else keeps warnings.
    pub fn from_verbosity(verbosity: u8) -> LogLevel {
        match verbosity {
            0 => LogLevel::Error,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Warning,
        }
    }

    /// Recognize a leading level marker such as `ERROR:` or `WARN `.
    /// Returns the level and the rest of the line.
    pub fn strip_prefix(line: &str) -> Option<(LogLevel, &str)> {
        const MARKERS: [(&str, LogLevel); 6] = [
            ("DEBUG", LogLevel::Debug),
            ("INFO", LogLevel::Info),
            ("WARNING", LogLevel::Warning),
            ("WARN", LogLevel::Warning),
            ("ERROR", LogLevel::Error),
            ("CRITICAL", LogLevel::Error),
        ];
        let trimmed = line.trim_start();
        for (marker, level) in MARKERS {
            if let Some(rest) = trimmed.strip_prefix(marker) {
                if rest.is_empty() {
                    return Some((level, rest));
                }
                if let Some(rest) = rest.strip_prefix(':') {
                    return Some((level, rest.trim_start()));
                }
                if rest.starts_with(char::is_whitespace) {
                    return Some((level, rest.trim_start()));
                }
            }
        }
        None
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// One append-only log line of an execution report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub report_id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.message
        )
    }
}
