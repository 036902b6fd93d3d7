//! Predefined commands that tasks invoke.
//!
//! A command receives the task's flattened arguments and a per-run context
//! whose logger writes into the run's execution report. Returning an error
//! marks the run as failed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use taskherd_core::config::CommandConfig;
use taskherd_core::error::{Result, TaskherdError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::executor::RunLogger;
use crate::persistence::SchedulerDb;
use crate::report::LogLevel;

/// A command as recorded in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub active: bool,
}

/// Per-run context handed to a command.
pub struct CommandContext {
    pub task_id: i64,
    pub report_id: i64,
    pub log: RunLogger,
}

/// A named, invocable unit of work.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    /// Grouping shown next to the name (e.g. "builtin", "local").
    fn namespace(&self) -> &str;

    /// Run with positional arguments. An error fails the run.
    async fn invoke(&self, args: &[String], ctx: &CommandContext) -> Result<()>;
}

struct Registered {
    command: Arc<dyn Command>,
    active: bool,
}

/// Commands available to tasks, keyed by name.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Registered>,
}

/// Outcome of [`CommandRegistry::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub registered: usize,
    pub deactivated: usize,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the built-in commands.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EmitLogsCommand), true);
        registry
    }

    /// Built-ins plus every `[[commands]]` entry.
    pub fn from_config(commands: &[CommandConfig]) -> Self {
        let mut registry = Self::with_builtins();
        for config in commands {
            registry.register(Arc::new(ProcessCommand::from_config(config)), config.active);
        }
        registry
    }

    /// Add a command, replacing any earlier one with the same name.
    pub fn register(&mut self, command: Arc<dyn Command>, active: bool) {
        let name = command.name().to_string();
        if self.commands.contains_key(&name) {
            tracing::warn!("Command '{name}' registered twice, keeping the last one");
        }
        self.commands.insert(name, Registered { command, active });
    }

    /// Active command by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands
            .get(name)
            .filter(|r| r.active)
            .map(|r| r.command.clone())
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.commands.get(name).is_some_and(|r| r.active)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Record every registered command in the database; commands that are
    /// no longer registered are marked inactive.
    pub fn sync(&self, db: &SchedulerDb) -> Result<SyncSummary> {
        let mut keep = Vec::with_capacity(self.commands.len());
        for registered in self.commands.values() {
            let cmd = &registered.command;
            db.upsert_command(cmd.name(), cmd.namespace(), registered.active)?;
            keep.push((cmd.namespace().to_string(), cmd.name().to_string()));
        }
        let deactivated = db.deactivate_commands_except(&keep)?;
        let summary = SyncSummary {
            registered: keep.len(),
            deactivated,
        };
        tracing::info!(
            "🔄 Commands synced: {} registered, {} deactivated",
            summary.registered,
            summary.deactivated
        );
        Ok(summary)
    }
}

// ─── Built-ins ─────────────────────────────────────────────────

/// Logs its `--debug`, `--info`, `--warning` and `--error` values at the
/// matching level. `--test-embedded` adds an info and a warning line.
/// `--verbosity` is accepted and left to the run logger.
pub struct EmitLogsCommand;

#[async_trait]
impl Command for EmitLogsCommand {
    fn name(&self) -> &str {
        "emit_logs"
    }

    fn namespace(&self) -> &str {
        "builtin"
    }

    async fn invoke(&self, args: &[String], ctx: &CommandContext) -> Result<()> {
        let mut emitted = Vec::new();
        let mut embedded = false;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let level = match arg.as_str() {
                "--debug" => LogLevel::Debug,
                "--info" => LogLevel::Info,
                "--warning" => LogLevel::Warning,
                "--error" => LogLevel::Error,
                "--test-embedded" | "--test_embedded" => {
                    embedded = true;
                    continue;
                }
                "--verbosity" | "-v" => {
                    iter.next();
                    continue;
                }
                other => {
                    return Err(TaskherdError::Execution(format!(
                        "emit_logs: unrecognized argument '{other}'"
                    )));
                }
            };
            let Some(message) = iter.next() else {
                return Err(TaskherdError::Execution(format!(
                    "emit_logs: {arg} expects a value"
                )));
            };
            emitted.push((level, message.as_str()));
        }

        // Levels are emitted in a fixed order, whatever the argument order.
        emitted.sort_by_key(|(level, _)| *level);
        for (level, message) in emitted {
            ctx.log.log(level, message);
        }
        if embedded {
            ctx.log.info("Embedded info message");
            ctx.log.warning("Embedded warning message");
        }
        Ok(())
    }
}

// ─── External programs ─────────────────────────────────────────

/// An external program. The task's arguments follow the fixed ones.
///
/// Output lines become log lines: a leading level marker (`ERROR:`,
/// `WARNING `, ...) sets the level, otherwise stdout logs at INFO and stderr
/// at WARNING. A non-zero exit status fails the run.
pub struct ProcessCommand {
    name: String,
    namespace: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<String>,
}

impl ProcessCommand {
    pub fn from_config(config: &CommandConfig) -> Self {
        Self {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

#[async_trait]
impl Command for ProcessCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn invoke(&self, args: &[String], ctx: &CommandContext) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TaskherdError::Execution(format!("failed to start '{}': {e}", self.program))
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tokio::join!(
            pump(stdout, LogLevel::Info, &ctx.log),
            pump(stderr, LogLevel::Warning, &ctx.log),
        );

        let status = child.wait().await.map_err(|e| {
            TaskherdError::Execution(format!("failed to wait for '{}': {e}", self.program))
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(TaskherdError::Execution(format!(
                "'{}' exited with {status}",
                self.program
            )))
        }
    }
}

/// Forward every line of a child stream to the run log.
async fn pump<R: AsyncRead + Unpin>(stream: Option<R>, default: LogLevel, log: &RunLogger) {
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let (level, message) =
                    LogLevel::strip_prefix(&line).unwrap_or((default, line.as_str()));
                log.log(level, message);
            }
            Ok(None) => break,
            Err(e) => {
                log.warning(&format!("output stream closed: {e}"));
                break;
            }
        }
    }
}
