//! Error taxonomy.
//!
//! `Scheduling` and `Queue` surface to the administrative caller;
//! `Execution` and `Notification` stay inside a single run.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskherdError>;

#[derive(Debug, Error)]
pub enum TaskherdError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    /// User-correctable scheduling input, e.g. a start time in the past.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// The queue backend refused or failed a submission.
    #[error("queue error: {0}")]
    Queue(String),

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("execution report {0} not found")]
    ReportNotFound(i64),

    #[error("command '{0}' not found")]
    CommandNotFound(String),

    /// The underlying command failed during a run.
    #[error("execution failure: {0}")]
    Execution(String),

    #[error("notification delivery error: {0}")]
    Notification(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TaskherdError {
    /// Whether the error is the caller's to fix rather than an infrastructure fault.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TaskherdError::Scheduling(_)
                | TaskherdError::TaskNotFound(_)
                | TaskherdError::ReportNotFound(_)
                | TaskherdError::CommandNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        assert!(TaskherdError::Scheduling("past".into()).is_user_error());
        assert!(TaskherdError::TaskNotFound(3).is_user_error());
        assert!(!TaskherdError::Queue("down".into()).is_user_error());
        assert!(!TaskherdError::Database("locked".into()).is_user_error());
    }

    #[test]
    fn test_display() {
        let err = TaskherdError::Scheduling("cannot schedule in the past".into());
        assert_eq!(err.to_string(), "scheduling error: cannot schedule in the past");
        assert_eq!(TaskherdError::TaskNotFound(7).to_string(), "task 7 not found");
    }
}
