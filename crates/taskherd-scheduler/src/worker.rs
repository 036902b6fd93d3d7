//! Queue worker: pulls jobs from the backend and runs them through the
//! executor.
//!
//! Every tick promotes due scheduled jobs, then drains the ready queue. Each
//! job runs on its own tokio task; a semaphore bounds how many run at once.

use std::sync::Arc;
use std::time::Duration;
use taskherd_core::error::Result;
use tokio::sync::{Semaphore, watch};

use crate::backend::QueueBackend;
use crate::executor::Executor;

pub struct Worker {
    backend: Arc<dyn QueueBackend>,
    executor: Arc<Executor>,
    poll_interval: Duration,
    concurrency: usize,
    permits: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        executor: Arc<Executor>,
        poll_interval_secs: u64,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            backend,
            executor,
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Promote due jobs and start every ready one. Returns how many started.
    pub async fn tick(&self) -> Result<usize> {
        let promoted = self.backend.promote_due(chrono::Utc::now()).await?;
        if promoted > 0 {
            tracing::debug!("⏫ {promoted} scheduled job(s) due");
        }

        let mut started = 0;
        while let Some(job) = self.backend.pop_ready().await? {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let executor = self.executor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match executor.execute(job.task_id).await {
                    Ok(Some(report)) => tracing::debug!(
                        job_id = %job.id,
                        report_id = report.id,
                        "Job done: {}",
                        report.invocation_result
                    ),
                    Ok(None) => {}
                    Err(e) => tracing::error!(
                        task_id = job.task_id,
                        job_id = %job.id,
                        "Executor failed: {e}"
                    ),
                }
            });
            started += 1;
        }
        Ok(started)
    }

    /// Wait until no job is running.
    pub async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.concurrency as u32).await {
            drop(all);
        }
    }

    /// Tick until `shutdown` turns true, then wait for running jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Worker started on {} backend (poll every {}s, {} concurrent)",
            self.backend.name(),
            self.poll_interval.as_secs(),
            self.concurrency
        );
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!("Worker tick failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("🛑 Worker stopping, waiting for running jobs");
        self.drain().await;
    }
}
