//! # Taskherd Scheduler
//!
//! Schedules predefined commands, runs them with per-run logging and tells
//! people how the runs went.
//!
//! ## Architecture
//! ```text
//! TaskService (launch / stop / delete)
//!   └── QueueAdapter ── cancel old job, then submit ──► QueueBackend
//!                                                        ├── MemoryBackend
//!                                                        └── RedisBackend
//! Worker (tokio interval)
//!   └── promote due jobs → pop ready → Executor::execute(task_id)
//!         ├── ExecutionReport + LogSink (SQLite)
//!         ├── Command (emit_logs, external programs)
//!         ├── recompute task cache, restore status, next ride
//!         └── NotificationDispatcher → Slack / Email / Webhook
//! ```

pub mod args;
pub mod backend;
pub mod commands;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod logsink;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod report;
pub mod service;
pub mod tasks;
pub mod worker;

pub use args::TaskArguments;
pub use backend::{JobHandle, MemoryBackend, QueueBackend, RedisBackend};
pub use commands::{Command, CommandContext, CommandDefinition, CommandRegistry};
pub use engine::Engine;
pub use executor::{Executor, RunLogger};
pub use logsink::{LogSink, Tail};
pub use notify::{Notification, NotificationDispatcher, NotificationRegistry, NotifyTransport};
pub use persistence::SchedulerDb;
pub use queue::QueueAdapter;
pub use report::{ExecutionReport, InvocationResult, LogEntry, LogLevel};
pub use service::{LogPoll, NewTask, TaskService};
pub use tasks::{CacheFields, RepetitionPeriod, Task, TaskStatus};
pub use worker::Worker;
