//! Queue adapter: keeps a task and its job in the queue backend in step.
//!
//! Every submission cancels the task's previous job first, so re-launching a
//! task never leaves two live jobs behind. A job that is already gone counts
//! as cancelled.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use taskherd_core::error::{Result, TaskherdError};
use tracing::{debug, info, warn};

use crate::backend::{JobHandle, QueueBackend};
use crate::persistence::SchedulerDb;
use crate::tasks::{Task, TaskStatus};

pub struct QueueAdapter {
    backend: Arc<dyn QueueBackend>,
    db: Arc<SchedulerDb>,
    cancel_failures: AtomicU64,
}

impl QueueAdapter {
    pub fn new(backend: Arc<dyn QueueBackend>, db: Arc<SchedulerDb>) -> Self {
        Self {
            backend,
            db,
            cancel_failures: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Cancellation errors swallowed while deduplicating or removing jobs.
    pub fn cancel_failures(&self) -> u64 {
        self.cancel_failures.load(Ordering::Relaxed)
    }

    /// Submit the task: immediately when it has no scheduling, otherwise as a
    /// one-shot or recurring job at its scheduled time.
    ///
    /// Fails with [`TaskherdError::Scheduling`] for a start time in the past
    /// and with [`TaskherdError::Queue`] when the backend refuses the job. On
    /// failure the task is unchanged, except that a previous job confirmed
    /// gone is forgotten.
    pub async fn add(&self, task: &mut Task) -> Result<JobHandle> {
        if let Some(at) = task.scheduling.filter(|at| *at < Utc::now()) {
            return Err(TaskherdError::Scheduling(format!(
                "cannot schedule in the past ({})",
                at.to_rfc3339()
            )));
        }

        if self.cancel_previous(task).await {
            self.db.save_schedule(task)?;
        }

        let submitted = match task.scheduling {
            None => self.backend.enqueue(task.id).await,
            Some(at) => match task.interval_in_seconds() {
                Some(interval) => {
                    let retention = interval + interval / 2;
                    self.backend
                        .schedule_recurring(at, task.id, interval, retention)
                        .await
                }
                None => self.backend.schedule_at(at, task.id).await,
            },
        };

        let handle = submitted.map_err(|e| queue_error(task, e))?;

        if task.scheduling.is_none() {
            info!(task_id = task.id, job_id = %handle.id, "📥 Task '{}' queued for immediate run", task.name);
            return Ok(handle);
        }

        task.status = TaskStatus::Scheduled;
        task.scheduled_job_id = Some(handle.id.clone());
        task.next_ride = match self.fetch_next_time(task).await {
            Ok((_, next)) => next,
            Err(e) => {
                warn!(task_id = task.id, "Could not read next fire time: {e}");
                task.scheduling
            }
        };
        self.db.save_schedule(task)?;
        info!(
            task_id = task.id,
            job_id = %handle.id,
            "⏰ Task '{}' scheduled ({}), next ride {}",
            task.name,
            task.repetition(),
            task.next_ride.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
        );
        Ok(handle)
    }

    /// Cancel the task's job, if any, and reset it to idle.
    pub async fn remove(&self, task: &mut Task) -> Result<()> {
        self.cancel_previous(task).await;
        task.reset_schedule();
        self.db.save_schedule(task)?;
        info!(task_id = task.id, "⏹️ Task '{}' unscheduled", task.name);
        Ok(())
    }

    /// The task's live job and its next fire time, or `(None, None)`.
    pub async fn fetch_next_time(
        &self,
        task: &Task,
    ) -> Result<(Option<JobHandle>, Option<DateTime<Utc>>)> {
        let Some(job_id) = task.scheduled_job_id.as_deref() else {
            return Ok((None, None));
        };
        let found = self
            .backend
            .list_scheduled()
            .await?
            .into_iter()
            .find(|(handle, _)| handle.id == job_id);
        Ok(match found {
            Some((handle, at)) => (Some(handle), Some(at)),
            None => (None, None),
        })
    }

    /// Cancel the tracked job. Returns true when the job is confirmed gone
    /// and the task's queue fields were cleared; other statuses are kept.
    async fn cancel_previous(&self, task: &mut Task) -> bool {
        let Some(job_id) = task.scheduled_job_id.clone() else {
            return false;
        };
        match self.backend.cancel(&job_id).await {
            Ok(found) => {
                debug!(task_id = task.id, job_id = %job_id, found, "Previous job cancelled");
                task.scheduled_job_id = None;
                task.next_ride = None;
                if task.status == TaskStatus::Scheduled {
                    task.status = TaskStatus::Idle;
                }
                true
            }
            Err(e) => {
                self.cancel_failures.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = task.id, job_id = %job_id, "Failed to cancel previous job: {e}");
                false
            }
        }
    }
}

fn queue_error(task: &Task, e: TaskherdError) -> TaskherdError {
    match e {
        TaskherdError::Queue(msg) => {
            TaskherdError::Queue(format!("submitting task {}: {msg}", task.id))
        }
        other => TaskherdError::Queue(format!("submitting task {}: {other}", task.id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::tasks::RepetitionPeriod;
    use async_trait::async_trait;
    use chrono::Duration;

    fn setup() -> (Arc<MemoryBackend>, Arc<SchedulerDb>, QueueAdapter) {
        let backend = Arc::new(MemoryBackend::new());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let adapter = QueueAdapter::new(backend.clone(), db.clone());
        (backend, db, adapter)
    }

    fn insert(db: &SchedulerDb, task: Task) -> Task {
        let mut task = task;
        db.insert_task(&mut task).unwrap();
        task
    }

    #[tokio::test]
    async fn test_add_then_remove_resets_task() {
        let (backend, db, adapter) = setup();
        let at = Utc::now() + Duration::hours(1);
        let mut task = insert(&db, Task::new("once", "emit_logs", "").at(at));

        let handle = adapter.add(&mut task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.scheduled_job_id.as_deref(), Some(handle.id.as_str()));
        assert_eq!(task.next_ride, Some(at));

        adapter.remove(&mut task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.scheduled_job_id.is_none());
        assert!(task.next_ride.is_none());
        assert!(backend.list_scheduled().await.unwrap().is_empty());

        let stored = db.require_task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Idle);
        assert!(stored.scheduled_job_id.is_none());
    }

    #[tokio::test]
    async fn test_remove_after_job_fired() {
        let (backend, db, adapter) = setup();
        let at = Utc::now() + Duration::seconds(1);
        let mut task = insert(&db, Task::new("once", "emit_logs", "").at(at));
        adapter.add(&mut task).await.unwrap();
        backend.promote_due(at).await.unwrap();
        backend.pop_ready().await.unwrap();

        adapter.remove(&mut task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.scheduled_job_id.is_none());
        assert!(task.next_ride.is_none());
    }

    #[tokio::test]
    async fn test_past_scheduling_rejected_without_submission() {
        let (backend, db, adapter) = setup();
        let mut task = insert(
            &db,
            Task::new("late", "emit_logs", "").at(Utc::now() - Duration::minutes(5)),
        );
        let before = task.clone();

        let err = adapter.add(&mut task).await.unwrap_err();
        assert!(matches!(err, TaskherdError::Scheduling(_)));
        assert!(err.to_string().contains("cannot schedule in the past"));
        assert_eq!(task.status, before.status);
        assert_eq!(task.scheduled_job_id, before.scheduled_job_id);
        assert!(backend.list_scheduled().await.unwrap().is_empty());
        assert_eq!(backend.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_add_twice_leaves_one_live_job() {
        let (backend, db, adapter) = setup();
        let at = Utc::now() + Duration::hours(2);
        let mut task = insert(
            &db,
            Task::new("sync", "emit_logs", "").at(at).every(1, RepetitionPeriod::Hour),
        );

        let first = adapter.add(&mut task).await.unwrap();
        let second = adapter.add(&mut task).await.unwrap();
        assert_ne!(first.id, second.id);

        let live = backend.list_scheduled().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0.id, second.id);
        assert_eq!(task.scheduled_job_id.as_deref(), Some(second.id.as_str()));
    }

    #[tokio::test]
    async fn test_immediate_run_keeps_schedule_fields() {
        let (backend, db, adapter) = setup();
        let mut task = insert(&db, Task::new("now", "emit_logs", ""));

        let handle = adapter.add(&mut task).await.unwrap();
        assert_eq!(handle.task_id, task.id);
        assert_eq!(backend.ready_len(), 1);
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.scheduled_job_id.is_none());
    }

    #[tokio::test]
    async fn test_submission_failure_is_queue_error() {
        let (backend, db, adapter) = setup();
        let mut task = insert(
            &db,
            Task::new("t", "emit_logs", "").at(Utc::now() + Duration::hours(1)),
        );
        backend.set_unavailable(true);

        let err = adapter.add(&mut task).await.unwrap_err();
        assert!(matches!(err, TaskherdError::Queue(_)));
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.scheduled_job_id.is_none());
    }

    /// Delegates to a memory backend, but every cancellation fails.
    struct BrokenCancel(MemoryBackend);

    #[async_trait]
    impl QueueBackend for BrokenCancel {
        fn name(&self) -> &'static str {
            "broken-cancel"
        }
        async fn enqueue(&self, task_id: i64) -> Result<JobHandle> {
            self.0.enqueue(task_id).await
        }
        async fn schedule_at(&self, at: DateTime<Utc>, task_id: i64) -> Result<JobHandle> {
            self.0.schedule_at(at, task_id).await
        }
        async fn schedule_recurring(
            &self,
            at: DateTime<Utc>,
            task_id: i64,
            interval_secs: u64,
            retention_secs: u64,
        ) -> Result<JobHandle> {
            self.0
                .schedule_recurring(at, task_id, interval_secs, retention_secs)
                .await
        }
        async fn cancel(&self, _job_id: &str) -> Result<bool> {
            Err(TaskherdError::Queue("connection reset".into()))
        }
        async fn list_scheduled(&self) -> Result<Vec<(JobHandle, DateTime<Utc>)>> {
            self.0.list_scheduled().await
        }
        async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
            self.0.promote_due(now).await
        }
        async fn pop_ready(&self) -> Result<Option<JobHandle>> {
            self.0.pop_ready().await
        }
    }

    #[tokio::test]
    async fn test_cancel_failure_is_counted_not_raised() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let adapter = QueueAdapter::new(Arc::new(BrokenCancel(MemoryBackend::new())), db.clone());
        let mut task = insert(
            &db,
            Task::new("t", "emit_logs", "").at(Utc::now() + Duration::hours(1)),
        );

        adapter.add(&mut task).await.unwrap();
        let second = adapter.add(&mut task).await.unwrap();
        assert_eq!(adapter.cancel_failures(), 1);
        assert_eq!(task.scheduled_job_id.as_deref(), Some(second.id.as_str()));

        adapter.remove(&mut task).await.unwrap();
        assert_eq!(adapter.cancel_failures(), 2);
        assert_eq!(task.status, TaskStatus::Idle);
    }
}
