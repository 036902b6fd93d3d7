//! Administrative actions on tasks and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskherd_core::error::{Result, TaskherdError};

use crate::commands::{CommandDefinition, CommandRegistry};
use crate::logsink::LogSink;
use crate::persistence::SchedulerDb;
use crate::queue::QueueAdapter;
use crate::report::{ExecutionReport, LogLevel};
use crate::tasks::{RepetitionPeriod, Task, TaskStatus};

/// Input for [`TaskService::create_task`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub scheduling: Option<DateTime<Utc>>,
    #[serde(default)]
    pub repetition_period: Option<RepetitionPeriod>,
    #[serde(default)]
    pub repetition_rate: Option<u32>,
}

/// Per-task outcome of a bulk action.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub id: i64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to a live log poll.
#[derive(Debug, Clone, Serialize)]
pub struct LogPoll {
    pub new_lines: Vec<String>,
    pub task_status: TaskStatus,
    pub total_log_size: usize,
}

/// A report with its log summary.
#[derive(Debug, Clone, Serialize)]
pub struct ReportView {
    #[serde(flatten)]
    pub report: ExecutionReport,
    pub task_name: String,
    pub n_log_lines: usize,
    pub n_log_errors: u32,
    pub n_log_warnings: u32,
    pub tail: Vec<String>,
}

pub struct TaskService {
    db: Arc<SchedulerDb>,
    queue: Arc<QueueAdapter>,
    commands: Arc<CommandRegistry>,
    tail_lines: usize,
}

impl TaskService {
    pub fn new(db: Arc<SchedulerDb>, queue: Arc<QueueAdapter>, commands: Arc<CommandRegistry>) -> Self {
        Self {
            db,
            queue,
            commands,
            tail_lines: 10,
        }
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.db
    }

    pub fn queue(&self) -> &Arc<QueueAdapter> {
        &self.queue
    }

    // ─── Commands ──────────────────────────────────────────────

    pub fn list_commands(&self) -> Result<Vec<CommandDefinition>> {
        self.db.list_commands()
    }

    // ─── Tasks ─────────────────────────────────────────────────

    /// Create an idle task for an active command.
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        if new.name.trim().is_empty() {
            return Err(TaskherdError::Scheduling("task name is required".into()));
        }
        if !self.commands.is_active(&new.command) {
            return Err(TaskherdError::CommandNotFound(new.command));
        }
        if new.repetition_rate.is_some() != new.repetition_period.is_some() {
            return Err(TaskherdError::Scheduling(
                "repetition needs both a period and a rate".into(),
            ));
        }

        let mut task = Task::new(new.name.trim(), &new.command, &new.arguments);
        task.category = new.category;
        task.note = new.note;
        task.scheduling = new.scheduling;
        task.repetition_period = new.repetition_period;
        task.repetition_rate = new.repetition_rate;
        self.db.insert_task(&mut task)?;
        tracing::info!(task_id = task.id, "📋 Task created: {} [{}]", task.name, task.command);
        Ok(task)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.db.list_tasks()
    }

    pub fn get_task(&self, id: i64) -> Result<Task> {
        self.db.require_task(id)
    }

    /// Submit the task to the queue: run it now when it has no scheduling,
    /// otherwise (re)schedule it.
    pub async fn launch(&self, id: i64) -> Result<Task> {
        let mut task = self.db.require_task(id)?;
        if task.scheduling.is_some() {
            self.queue.add(&mut task).await?;
            return Ok(task);
        }

        let prior = task.status;
        task.status = TaskStatus::Spooled;
        self.db.set_status(task.id, TaskStatus::Spooled)?;
        if let Err(e) = self.queue.add(&mut task).await {
            task.status = match prior {
                TaskStatus::Scheduled if task.scheduled_job_id.is_none() => TaskStatus::Idle,
                other => other,
            };
            self.db.set_status(task.id, task.status)?;
            return Err(e);
        }
        Ok(task)
    }

    /// Cancel the task's job and set it idle.
    pub async fn stop(&self, id: i64) -> Result<Task> {
        let mut task = self.db.require_task(id)?;
        self.queue.remove(&mut task).await?;
        Ok(task)
    }

    pub async fn bulk_launch(&self, ids: &[i64]) -> Vec<BulkOutcome> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            outcomes.push(outcome(id, self.launch(id).await));
        }
        outcomes
    }

    pub async fn bulk_stop(&self, ids: &[i64]) -> Vec<BulkOutcome> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            outcomes.push(outcome(id, self.stop(id).await));
        }
        outcomes
    }

    /// Unschedule, then delete the task with its reports.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut task = self.db.require_task(id)?;
        self.queue.remove(&mut task).await?;
        self.db.delete_task(id)?;
        tracing::info!(task_id = id, "🗑️ Task deleted: {}", task.name);
        Ok(())
    }

    // ─── Reports ───────────────────────────────────────────────

    pub fn list_reports(&self, task_id: i64) -> Result<Vec<ExecutionReport>> {
        self.db.require_task(task_id)?;
        self.db.list_reports(task_id)
    }

    pub fn report_view(&self, report_id: i64) -> Result<ReportView> {
        let report = self.db.require_report(report_id)?;
        let task = self.db.require_task(report.task_id)?;
        Ok(ReportView {
            task_name: task.name,
            n_log_lines: self.db.total(report_id)?,
            n_log_errors: self.db.count_by_level(report_id, LogLevel::Error)?,
            n_log_warnings: self.db.count_by_level(report_id, LogLevel::Warning)?,
            tail: self.db.tail(report_id, self.tail_lines)?.lines(),
            report,
        })
    }

    pub fn report_lines(&self, report_id: i64, level: Option<LogLevel>) -> Result<Vec<String>> {
        self.db.require_report(report_id)?;
        self.db.log_lines(report_id, level)
    }

    /// New log lines since `offset`, with the owning task's status.
    pub fn poll_log(&self, report_id: i64, offset: usize) -> Result<LogPoll> {
        let report = self.db.require_report(report_id)?;
        let task = self.db.require_task(report.task_id)?;
        let (entries, total) = self.db.read_from(report_id, offset)?;
        Ok(LogPoll {
            new_lines: entries.iter().map(ToString::to_string).collect(),
            task_status: task.status,
            total_log_size: total,
        })
    }

    pub fn delete_report(&self, report_id: i64) -> Result<()> {
        if !self.db.delete_report(report_id)? {
            return Err(TaskherdError::ReportNotFound(report_id));
        }
        Ok(())
    }

    /// Keep the `keep` most recent reports of a task. Returns how many went.
    pub fn prune(&self, task_id: i64, keep: usize) -> Result<usize> {
        self.db.require_task(task_id)?;
        self.db.prune_reports(task_id, keep)
    }
}

fn outcome(id: i64, result: Result<Task>) -> BulkOutcome {
    match result {
        Ok(_) => BulkOutcome {
            id,
            ok: true,
            error: None,
        },
        Err(e) => BulkOutcome {
            id,
            ok: false,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, QueueBackend};
    use chrono::Duration;

    fn service() -> (Arc<MemoryBackend>, TaskService) {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let queue = Arc::new(QueueAdapter::new(backend.clone(), db.clone()));
        let commands = Arc::new(CommandRegistry::with_builtins());
        commands.sync(&db).unwrap();
        (backend, TaskService::new(db, queue, commands))
    }

    fn new_task(name: &str) -> NewTask {
        NewTask {
            name: name.into(),
            command: "emit_logs".into(),
            arguments: "--info hi".into(),
            category: None,
            note: None,
            scheduling: None,
            repetition_period: None,
            repetition_rate: None,
        }
    }

    #[test]
    fn test_create_task_validates_command() {
        let (_, service) = service();
        let task = service.create_task(new_task("ok")).unwrap();
        assert!(task.id > 0);

        let mut bad = new_task("bad");
        bad.command = "nope".into();
        assert!(matches!(
            service.create_task(bad),
            Err(TaskherdError::CommandNotFound(_))
        ));

        let mut half = new_task("half");
        half.repetition_rate = Some(2);
        assert!(matches!(
            service.create_task(half),
            Err(TaskherdError::Scheduling(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_immediate_spools() {
        let (backend, service) = service();
        let task = service.create_task(new_task("now")).unwrap();
        let launched = service.launch(task.id).await.unwrap();
        assert_eq!(launched.status, TaskStatus::Spooled);
        assert_eq!(service.get_task(task.id).unwrap().status, TaskStatus::Spooled);
        assert_eq!(backend.ready_len(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_restores_status() {
        let (backend, service) = service();
        let task = service.create_task(new_task("now")).unwrap();
        backend.set_unavailable(true);
        let err = service.launch(task.id).await.unwrap_err();
        assert!(matches!(err, TaskherdError::Queue(_)));
        assert_eq!(service.get_task(task.id).unwrap().status, TaskStatus::Idle);
    }

    #[tokio::test]
    async fn test_bulk_launch_and_stop() {
        let (backend, service) = service();
        let mut scheduled = new_task("later");
        scheduled.scheduling = Some(Utc::now() + Duration::hours(1));
        let a = service.create_task(scheduled).unwrap();
        let mut late = new_task("late");
        late.scheduling = Some(Utc::now() - Duration::hours(1));
        let b = service.create_task(late).unwrap();

        let outcomes = service.bulk_launch(&[a.id, b.id, 999]).await;
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert!(outcomes[1].error.as_deref().unwrap().contains("past"));
        assert!(!outcomes[2].ok);
        assert_eq!(backend.list_scheduled().await.unwrap().len(), 1);

        let outcomes = service.bulk_stop(&[a.id, b.id]).await;
        assert!(outcomes.iter().all(|o| o.ok));
        assert!(backend.list_scheduled().await.unwrap().is_empty());
        assert_eq!(service.get_task(a.id).unwrap().status, TaskStatus::Idle);
    }

    #[tokio::test]
    async fn test_delete_cancels_schedule() {
        let (backend, service) = service();
        let mut scheduled = new_task("later");
        scheduled.scheduling = Some(Utc::now() + Duration::hours(1));
        let task = service.create_task(scheduled).unwrap();
        service.launch(task.id).await.unwrap();

        service.delete(task.id).await.unwrap();
        assert!(backend.list_scheduled().await.unwrap().is_empty());
        assert!(matches!(
            service.get_task(task.id),
            Err(TaskherdError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_poll_log_incremental() {
        let (_, service) = service();
        let task = service.create_task(new_task("t")).unwrap();
        let report = service.db().create_report(task.id).unwrap();
        for i in 0..3 {
            service
                .db()
                .write(report.id, LogLevel::Info, &format!("line {i}"), Utc::now())
                .unwrap();
        }

        let first = service.poll_log(report.id, 0).unwrap();
        assert_eq!(first.new_lines.len(), 3);
        assert_eq!(first.total_log_size, 3);
        assert_eq!(first.task_status, TaskStatus::Idle);

        let second = service.poll_log(report.id, first.total_log_size).unwrap();
        assert!(second.new_lines.is_empty());
        assert_eq!(second.total_log_size, 3);
    }

    #[test]
    fn test_report_view_and_delete() {
        let (_, service) = service();
        let task = service.create_task(new_task("t")).unwrap();
        let report = service.db().create_report(task.id).unwrap();
        service
            .db()
            .write(report.id, LogLevel::Error, "boom", Utc::now())
            .unwrap();

        let view = service.report_view(report.id).unwrap();
        assert_eq!(view.task_name, "t");
        assert_eq!(view.n_log_errors, 1);
        assert_eq!(view.n_log_lines, 1);

        service.delete_report(report.id).unwrap();
        assert!(matches!(
            service.delete_report(report.id),
            Err(TaskherdError::ReportNotFound(_))
        ));
    }
}
