//! Executor: runs one task invocation end to end.
//!
//! Each call creates an execution report, runs the task's command with a
//! logger bound to that report, classifies the outcome from the logged
//! levels, refreshes the task and finally notifies. A failing command is
//! recorded in the report and never returned to the caller.

use chrono::Utc;
use std::sync::Arc;
use taskherd_core::error::{Result, TaskherdError};
use tracing::{debug, error, info, warn};

use crate::commands::{CommandContext, CommandRegistry};
use crate::logsink::LogSink;
use crate::notify::NotificationDispatcher;
use crate::persistence::SchedulerDb;
use crate::queue::QueueAdapter;
use crate::report::{ExecutionReport, InvocationResult, LogLevel};
use crate::tasks::{Task, TaskStatus};

/// Verbosity of a run whose task sets none.
pub const DEFAULT_VERBOSITY: u8 = 1;

/// Per-run logger: every line at or above the threshold goes to the log
/// sink under the run's report and is mirrored as a tracing event.
#[derive(Clone)]
pub struct RunLogger {
    sink: Arc<dyn LogSink>,
    task_id: i64,
    report_id: i64,
    threshold: LogLevel,
}

impl RunLogger {
    /// Logger keeping every level.
    pub fn new(sink: Arc<dyn LogSink>, task_id: i64, report_id: i64) -> Self {
        Self {
            sink,
            task_id,
            report_id,
            threshold: LogLevel::Debug,
        }
    }

    /// Drop lines below `threshold`.
    pub fn with_threshold(mut self, threshold: LogLevel) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> LogLevel {
        self.threshold
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level < self.threshold {
            return;
        }
        let (task_id, report_id) = (self.task_id, self.report_id);
        match level {
            LogLevel::Debug => debug!(task_id, report_id, "{message}"),
            LogLevel::Info => info!(task_id, report_id, "{message}"),
            LogLevel::Warning => warn!(task_id, report_id, "{message}"),
            LogLevel::Error => error!(task_id, report_id, "{message}"),
        }
        if let Err(e) = self.sink.write(report_id, level, message, Utc::now()) {
            error!(task_id, report_id, "Failed to store log line: {e}");
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

pub struct Executor {
    db: Arc<SchedulerDb>,
    queue: Arc<QueueAdapter>,
    commands: Arc<CommandRegistry>,
    notifier: Arc<NotificationDispatcher>,
    reports_retained: usize,
}

impl Executor {
    pub fn new(
        db: Arc<SchedulerDb>,
        queue: Arc<QueueAdapter>,
        commands: Arc<CommandRegistry>,
        notifier: Arc<NotificationDispatcher>,
        reports_retained: usize,
    ) -> Self {
        Self {
            db,
            queue,
            commands,
            notifier,
            reports_retained,
        }
    }

    /// Run the task once. `Ok(None)` when the task no longer exists.
    ///
    /// Errors are infrastructure failures only (database, lock poisoning);
    /// the command's own failure is part of the returned report.
    pub async fn execute(&self, task_id: i64) -> Result<Option<ExecutionReport>> {
        let Some(task) = self.db.get_task(task_id)? else {
            error!(task_id, "Task not found, invocation dropped");
            return Ok(None);
        };

        let report = self.db.create_report(task.id)?;
        self.db.prune_reports(task.id, self.reports_retained)?;

        self.db.set_status(task.id, TaskStatus::Started)?;

        let verbosity = task.args().verbosity().unwrap_or(DEFAULT_VERBOSITY);
        let log = RunLogger::new(self.db.clone(), task.id, report.id)
            .with_threshold(LogLevel::from_verbosity(verbosity));
        log.info(&format!("Starting task '{}' ({})", task.name, task.command));
        let failed = match self.run_command(&task, log.clone(), report.id).await {
            Ok(()) => false,
            Err(e) => {
                log.error(&format!("Task '{}' failed: {e}", task.name));
                true
            }
        };
        log.info(&format!("Finished task '{}'", task.name));

        let n_errors = self.db.count_by_level(report.id, LogLevel::Error)?;
        let n_warnings = self.db.count_by_level(report.id, LogLevel::Warning)?;
        let result = InvocationResult::classify(failed, n_errors, n_warnings);

        self.db.finalize_report(report.id, result)?;
        let report = ExecutionReport {
            invocation_result: result,
            ..report
        };

        self.db.recompute_cache(task.id)?;
        self.advance_status(task.id).await?;

        info!(
            task_id = task.id,
            report_id = report.id,
            "🏁 Task '{}' finished: {} ({} errors, {} warnings)",
            task.name,
            result,
            n_errors,
            n_warnings
        );

        self.notifier.emit(&report, &task.name).await;
        Ok(Some(report))
    }

    /// Invoke the command on its own tokio task so that a panic is recorded
    /// as a failure like any other error.
    async fn run_command(&self, task: &Task, log: RunLogger, report_id: i64) -> Result<()> {
        let command = self
            .commands
            .get(&task.command)
            .ok_or_else(|| TaskherdError::CommandNotFound(task.command.clone()))?;
        let args = task.args().complete_args();
        let ctx = CommandContext {
            task_id: task.id,
            report_id,
            log,
        };
        tokio::spawn(async move { command.invoke(&args, &ctx).await })
            .await
            .map_err(|e| TaskherdError::Execution(format!("command aborted: {e}")))?
    }

    /// Settle the status after a run from the task's queue job as it is now:
    /// scheduled while that job is live, idle otherwise.
    async fn advance_status(&self, task_id: i64) -> Result<()> {
        // Reload: the task may have been stopped or rescheduled meanwhile.
        let Some(mut task) = self.db.get_task(task_id)? else {
            return Ok(());
        };

        match self.queue.fetch_next_time(&task).await {
            Ok((Some(_), next)) => {
                task.status = TaskStatus::Scheduled;
                task.next_ride = next;
            }
            Ok((None, _)) => task.reset_schedule(),
            Err(e) => {
                // Only a tracked job is looked up, and it cannot be confirmed gone.
                warn!(task_id, "Could not read next fire time: {e}");
                task.status = TaskStatus::Scheduled;
                task.next_ride = None;
            }
        }
        self.db.save_schedule(&task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, QueueBackend};
    use crate::commands::Command;
    use async_trait::async_trait;
    use crate::notify::{NotificationRegistry, RecordingTransport};
    use crate::tasks::RepetitionPeriod;
    use chrono::{Duration, SubsecRound};
    use std::collections::BTreeMap;
    use taskherd_core::config::{NotificationHandlerConfig, NotifyLevel};

    struct Harness {
        db: Arc<SchedulerDb>,
        backend: Arc<MemoryBackend>,
        queue: Arc<QueueAdapter>,
        transport: Arc<RecordingTransport>,
        executor: Executor,
    }

    fn harness(reports_retained: usize) -> Harness {
        harness_with(reports_retained, |_, _| CommandRegistry::with_builtins())
    }

    fn harness_with(
        reports_retained: usize,
        commands: impl FnOnce(&Arc<SchedulerDb>, &Arc<QueueAdapter>) -> CommandRegistry,
    ) -> Harness {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let queue = Arc::new(QueueAdapter::new(backend.clone(), db.clone()));
        let commands = Arc::new(commands(&db, &queue));
        let mut handlers = BTreeMap::new();
        handlers.insert(
            "ops".to_string(),
            NotificationHandlerConfig::Webhook {
                url: "http://localhost/hook".into(),
                headers: BTreeMap::new(),
                level: NotifyLevel::Warnings,
            },
        );
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Arc::new(NotificationDispatcher::new(
            Arc::new(NotificationRegistry::from_config(&handlers)),
            transport.clone(),
            db.clone(),
        ));
        let executor = Executor::new(
            db.clone(),
            queue.clone(),
            commands,
            notifier,
            reports_retained,
        );
        Harness {
            db,
            backend,
            queue,
            transport,
            executor,
        }
    }

    fn insert(db: &SchedulerDb, task: Task) -> Task {
        let mut task = task;
        db.insert_task(&mut task).unwrap();
        task
    }

    #[tokio::test]
    async fn test_error_and_info_classify_as_errors() {
        let h = harness(5);
        let task = insert(&h.db, Task::new("t", "emit_logs", "--error boom, --info fine"));

        let report = h.executor.execute(task.id).await.unwrap().unwrap();
        assert_eq!(report.invocation_result, InvocationResult::Errors);
        assert_eq!(h.db.count_by_level(report.id, LogLevel::Error).unwrap(), 1);
        assert_eq!(h.db.count_by_level(report.id, LogLevel::Warning).unwrap(), 0);

        let task = h.db.require_task(task.id).unwrap();
        assert_eq!(task.cache.last_invocation_result, Some(InvocationResult::Errors));
        assert_eq!(task.cache.last_invocation_n_errors, Some(1));
        assert_eq!(task.cache.last_invocation_n_warnings, Some(0));
        assert_eq!(task.cache.last_invocation_datetime, Some(report.invocation_datetime));
        assert_eq!(task.status, TaskStatus::Idle);
    }

    #[tokio::test]
    async fn test_clean_run_is_ok() {
        let h = harness(5);
        let task = insert(&h.db, Task::new("t", "emit_logs", "--verbosity 2, --info hello"));
        let report = h.executor.execute(task.id).await.unwrap().unwrap();
        assert_eq!(report.invocation_result, InvocationResult::Ok);

        let lines = h.db.log_lines(report.id, None).unwrap();
        assert!(lines.first().unwrap().contains("Starting task 't'"));
        assert!(lines.last().unwrap().contains("Finished task 't'"));
    }

    #[tokio::test]
    async fn test_failing_command_is_recorded_not_raised() {
        let h = harness(5);
        let task = insert(&h.db, Task::new("t", "emit_logs", "--bogus 1"));
        let report = h.executor.execute(task.id).await.unwrap().unwrap();
        assert_eq!(report.invocation_result, InvocationResult::Failed);
        assert_eq!(
            h.db.require_task(task.id).unwrap().cache.last_invocation_result,
            Some(InvocationResult::Failed)
        );
    }

    #[tokio::test]
    async fn test_unknown_command_fails_the_run() {
        let h = harness(5);
        let task = insert(&h.db, Task::new("t", "does_not_exist", ""));
        let report = h.executor.execute(task.id).await.unwrap().unwrap();
        assert_eq!(report.invocation_result, InvocationResult::Failed);
    }

    #[tokio::test]
    async fn test_missing_task_creates_no_report() {
        let h = harness(5);
        assert!(h.executor.execute(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_prunes_older_reports() {
        let h = harness(2);
        let task = insert(&h.db, Task::new("t", "emit_logs", "--info x"));
        let mut last = None;
        for _ in 0..4 {
            last = h.executor.execute(task.id).await.unwrap();
        }
        let reports = h.db.list_reports(task.id).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].id, last.unwrap().id);
    }

    #[tokio::test]
    async fn test_notifications_follow_threshold() {
        let h = harness(5);
        let ok = insert(&h.db, Task::new("ok", "emit_logs", "--info fine"));
        h.executor.execute(ok.id).await.unwrap();
        assert_eq!(h.transport.count(), 0);

        let bad = insert(&h.db, Task::new("bad", "emit_logs", "--error boom"));
        h.executor.execute(bad.id).await.unwrap();
        assert_eq!(h.transport.count(), 1);
    }

    #[tokio::test]
    async fn test_one_shot_demoted_after_firing() {
        let h = harness(5);
        let at = Utc::now() + Duration::seconds(1);
        let mut task = insert(&h.db, Task::new("once", "emit_logs", "--info x").at(at));
        h.queue.add(&mut task).await.unwrap();
        h.backend.promote_due(at).await.unwrap();
        let job = h.backend.pop_ready().await.unwrap().unwrap();

        h.executor.execute(job.task_id).await.unwrap();
        let task = h.db.require_task(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.scheduled_job_id.is_none());
        assert!(task.next_ride.is_none());
    }

    #[tokio::test]
    async fn test_periodic_stays_scheduled_with_next_ride() {
        let h = harness(5);
        let at = Utc::now() + Duration::seconds(1);
        let mut task = insert(
            &h.db,
            Task::new("hourly", "emit_logs", "--info x")
                .at(at)
                .every(1, RepetitionPeriod::Hour),
        );
        h.queue.add(&mut task).await.unwrap();
        h.backend.promote_due(at).await.unwrap();
        let job = h.backend.pop_ready().await.unwrap().unwrap();

        h.executor.execute(job.task_id).await.unwrap();
        let stored = h.db.require_task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Scheduled);
        assert_eq!(stored.scheduled_job_id, task.scheduled_job_id);
        assert_eq!(stored.next_ride, Some((at + Duration::hours(1)).trunc_subsecs(6)));
    }

    #[tokio::test]
    async fn test_default_verbosity_keeps_warnings_and_above() {
        let h = harness(5);
        let task = insert(&h.db, Task::new("t", "emit_logs", "--info fine, --warning careful"));
        let report = h.executor.execute(task.id).await.unwrap().unwrap();
        assert_eq!(report.invocation_result, InvocationResult::Warnings);

        let lines = h.db.log_lines(report.id, None).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("WARNING - careful"));
    }

    #[tokio::test]
    async fn test_verbosity_zero_hides_warnings() {
        let h = harness(5);
        let task = insert(&h.db, Task::new("t", "emit_logs", "--verbosity 0, --warning careful"));
        let report = h.executor.execute(task.id).await.unwrap().unwrap();
        assert_eq!(report.invocation_result, InvocationResult::Ok);
        assert_eq!(h.db.total(report.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verbosity_three_keeps_debug() {
        let h = harness(5);
        let task = insert(&h.db, Task::new("t", "emit_logs", "--verbosity 3, --debug deep"));
        let report = h.executor.execute(task.id).await.unwrap().unwrap();
        assert_eq!(h.db.count_by_level(report.id, LogLevel::Debug).unwrap(), 1);
        assert_eq!(h.db.count_by_level(report.id, LogLevel::Info).unwrap(), 2);
    }

    /// Puts its own task on an hourly schedule while running.
    struct ScheduleSelf {
        db: Arc<SchedulerDb>,
        queue: Arc<QueueAdapter>,
    }

    #[async_trait]
    impl Command for ScheduleSelf {
        fn name(&self) -> &str {
            "schedule_self"
        }

        fn namespace(&self) -> &str {
            "test"
        }

        async fn invoke(&self, _args: &[String], ctx: &CommandContext) -> Result<()> {
            let mut task = self
                .db
                .require_task(ctx.task_id)?
                .at(Utc::now() + Duration::hours(1))
                .every(1, RepetitionPeriod::Hour);
            self.queue.add(&mut task).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduled_during_run_stays_scheduled() {
        let h = harness_with(5, |db, queue| {
            let mut registry = CommandRegistry::with_builtins();
            registry.register(
                Arc::new(ScheduleSelf {
                    db: db.clone(),
                    queue: queue.clone(),
                }),
                true,
            );
            registry
        });
        let mut task = insert(&h.db, Task::new("t", "schedule_self", ""));
        h.queue.add(&mut task).await.unwrap();
        let job = h.backend.pop_ready().await.unwrap().unwrap();

        let report = h.executor.execute(job.task_id).await.unwrap().unwrap();
        assert_eq!(report.invocation_result, InvocationResult::Ok);

        let stored = h.db.require_task(task.id).unwrap();
        let live = h.backend.list_scheduled().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(stored.status, TaskStatus::Scheduled);
        assert_eq!(stored.scheduled_job_id.as_deref(), Some(live[0].0.id.as_str()));
        assert!(stored.next_ride.is_some());
    }

    #[tokio::test]
    async fn test_stopped_during_run_ends_idle() {
        let h = harness(5);
        let at = Utc::now() + Duration::seconds(1);
        let mut task = insert(
            &h.db,
            Task::new("t", "emit_logs", "--info x")
                .at(at)
                .every(1, RepetitionPeriod::Hour),
        );
        h.queue.add(&mut task).await.unwrap();
        h.backend.promote_due(at).await.unwrap();
        let job = h.backend.pop_ready().await.unwrap().unwrap();
        h.queue.remove(&mut task).await.unwrap();

        h.executor.execute(job.task_id).await.unwrap();
        let stored = h.db.require_task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Idle);
        assert!(stored.scheduled_job_id.is_none());
        assert!(stored.next_ride.is_none());
    }
}
