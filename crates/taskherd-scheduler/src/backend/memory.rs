//! In-process queue backend for single-process deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use taskherd_core::error::{Result, TaskherdError};

use super::{JobHandle, QueueBackend, ScheduledJob};

#[derive(Default)]
struct MemoryState {
    ready: VecDeque<JobHandle>,
    scheduled: HashMap<String, ScheduledJob>,
}

/// Ready queue and scheduled table held in memory.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a queue error, as an unreachable backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of jobs waiting on the ready queue.
    pub fn ready_len(&self) -> usize {
        self.state.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TaskherdError::Queue("memory backend unavailable".into()));
        }
        self.state
            .lock()
            .map_err(|e| TaskherdError::Queue(format!("Lock: {e}")))
    }

    fn insert(&self, job: ScheduledJob) -> Result<JobHandle> {
        let handle = job.handle.clone();
        self.state()?.scheduled.insert(handle.id.clone(), job);
        Ok(handle)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, task_id: i64) -> Result<JobHandle> {
        let handle = JobHandle::new(task_id);
        self.state()?.ready.push_back(handle.clone());
        Ok(handle)
    }

    async fn schedule_at(&self, at: DateTime<Utc>, task_id: i64) -> Result<JobHandle> {
        self.insert(ScheduledJob {
            handle: JobHandle::new(task_id),
            fire_at: at,
            interval_secs: None,
            retention_secs: None,
        })
    }

    async fn schedule_recurring(
        &self,
        at: DateTime<Utc>,
        task_id: i64,
        interval_secs: u64,
        retention_secs: u64,
    ) -> Result<JobHandle> {
        self.insert(ScheduledJob {
            handle: JobHandle::new(task_id),
            fire_at: at,
            interval_secs: Some(interval_secs),
            retention_secs: Some(retention_secs),
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        let scheduled = state.scheduled.remove(job_id).is_some();
        let before = state.ready.len();
        state.ready.retain(|h| h.id != job_id);
        Ok(scheduled || state.ready.len() != before)
    }

    async fn list_scheduled(&self) -> Result<Vec<(JobHandle, DateTime<Utc>)>> {
        let state = self.state()?;
        let mut jobs: Vec<_> = state
            .scheduled
            .values()
            .map(|j| (j.handle.clone(), j.fire_at))
            .collect();
        jobs.sort_by_key(|(_, at)| *at);
        Ok(jobs)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state()?;
        let mut due: Vec<String> = state
            .scheduled
            .values()
            .filter(|j| j.fire_at <= now)
            .map(|j| j.handle.id.clone())
            .collect();
        due.sort_by_key(|id| state.scheduled.get(id).map(|j| j.fire_at));

        for id in &due {
            let Some(job) = state.scheduled.remove(id) else {
                continue;
            };
            state.ready.push_back(job.handle.clone());
            if let Some(next) = job.next_after(now) {
                state
                    .scheduled
                    .insert(id.clone(), ScheduledJob { fire_at: next, ..job });
            }
        }
        Ok(due.len())
    }

    async fn pop_ready(&self) -> Result<Option<JobHandle>> {
        Ok(self.state()?.ready.pop_front())
    }
}
