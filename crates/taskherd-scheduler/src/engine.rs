//! Engine: wires persistence, queue, commands and notifications together
//! from configuration.

use std::path::Path;
use std::sync::Arc;
use taskherd_core::config::TaskherdConfig;
use taskherd_core::error::Result;

use crate::backend::{self, QueueBackend};
use crate::commands::CommandRegistry;
use crate::dispatch::HttpTransport;
use crate::executor::Executor;
use crate::notify::{NotificationDispatcher, NotificationRegistry, NotifyTransport};
use crate::persistence::SchedulerDb;
use crate::queue::QueueAdapter;
use crate::service::TaskService;
use crate::worker::Worker;

/// Every long-lived component of a taskherd process.
pub struct Engine {
    pub db: Arc<SchedulerDb>,
    pub backend: Arc<dyn QueueBackend>,
    pub queue: Arc<QueueAdapter>,
    pub commands: Arc<CommandRegistry>,
    pub notifier: Arc<NotificationDispatcher>,
    pub executor: Arc<Executor>,
    pub service: Arc<TaskService>,
}

impl Engine {
    /// Open the database at `db_path`, connect the configured queue backend
    /// and sync the command table.
    pub async fn start(config: &TaskherdConfig, db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(SchedulerDb::open(db_path)?);
        let backend = backend::from_config(&config.queue).await?;
        Self::assemble(config, db, backend, Arc::new(HttpTransport::new()?))
    }

    /// Build from already constructed parts.
    pub fn assemble(
        config: &TaskherdConfig,
        db: Arc<SchedulerDb>,
        backend: Arc<dyn QueueBackend>,
        transport: Arc<dyn NotifyTransport>,
    ) -> Result<Self> {
        let commands = Arc::new(CommandRegistry::from_config(&config.commands));
        commands.sync(&db)?;

        let queue = Arc::new(QueueAdapter::new(backend.clone(), db.clone()));
        let notifier = Arc::new(
            NotificationDispatcher::new(
                Arc::new(NotificationRegistry::from_config(&config.notifications)),
                transport,
                db.clone(),
            )
            .with_base_url(config.base_url.clone())
            .with_tail_lines(config.worker.tail_lines),
        );
        let executor = Arc::new(Executor::new(
            db.clone(),
            queue.clone(),
            commands.clone(),
            notifier.clone(),
            config.worker.reports_retained,
        ));
        let service = Arc::new(
            TaskService::new(db.clone(), queue.clone(), commands.clone())
                .with_tail_lines(config.worker.tail_lines),
        );

        tracing::info!(
            "🧩 Engine ready: {} backend, {} command(s), {} notification handler(s)",
            backend.name(),
            commands.len(),
            notifier.registry().len()
        );
        Ok(Self {
            db,
            backend,
            queue,
            commands,
            notifier,
            executor,
            service,
        })
    }

    /// A worker over this engine's backend and executor.
    pub fn worker(&self, config: &TaskherdConfig) -> Worker {
        Worker::new(
            self.backend.clone(),
            self.executor.clone(),
            config.queue.poll_interval_secs,
            config.queue.concurrency,
        )
    }
}
