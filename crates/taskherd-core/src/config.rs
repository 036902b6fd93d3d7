//! Taskherd configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskherdError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskherdConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Public base URL of the gateway, used for "full logs" links.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Notification handlers keyed by a free-form handler name.
    #[serde(default)]
    pub notifications: BTreeMap<String, NotificationHandlerConfig>,
    /// External programs exposed as predefined commands.
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

impl Default for TaskherdConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            gateway: GatewayConfig::default(),
            base_url: None,
            notifications: BTreeMap::new(),
            commands: Vec::new(),
        }
    }
}

impl TaskherdConfig {
    /// Load config from the default path (~/.taskherd/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskherdError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TaskherdError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskherdError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that would only fail later, at run time.
    pub fn validate(&self) -> Result<()> {
        if self.queue.backend == QueueBackendKind::Redis && self.queue.redis_url.is_empty() {
            return Err(TaskherdError::Config(
                "queue.redis_url is required for the redis backend".into(),
            ));
        }
        if self.queue.concurrency == 0 {
            return Err(TaskherdError::Config("queue.concurrency must be at least 1".into()));
        }
        for (name, handler) in &self.notifications {
            match handler {
                NotificationHandlerConfig::Email { recipients, from_email, .. } => {
                    if recipients.is_empty() {
                        return Err(TaskherdError::Config(format!(
                            "notification handler '{name}' has no recipients"
                        )));
                    }
                    if from_email.is_empty() {
                        return Err(TaskherdError::Config(format!(
                            "notification handler '{name}' has no from_email"
                        )));
                    }
                }
                NotificationHandlerConfig::Slack { token, channel, .. } => {
                    if token.is_empty() || channel.is_empty() {
                        return Err(TaskherdError::Config(format!(
                            "notification handler '{name}' needs both token and channel"
                        )));
                    }
                }
                NotificationHandlerConfig::Webhook { url, .. } => {
                    if url.is_empty() {
                        return Err(TaskherdError::Config(format!(
                            "notification handler '{name}' has an empty url"
                        )));
                    }
                }
            }
        }
        for command in &self.commands {
            if command.name.is_empty() || command.program.is_empty() {
                return Err(TaskherdError::Config(
                    "every [[commands]] entry needs a name and a program".into(),
                ));
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Taskherd home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskherd")
    }
}

/// SQLite database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.taskherd/taskherd.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Which queue backend implementation to construct at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    #[default]
    Memory,
    Redis,
}

/// Queue backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackendKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Worker tick in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max parallel executor runs per worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_redis_url() -> String { "redis://127.0.0.1:6379/0".into() }
fn default_key_prefix() -> String { "taskherd".into() }
fn default_poll_interval() -> u64 { 1 }
fn default_concurrency() -> usize { 4 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            poll_interval_secs: default_poll_interval(),
            concurrency: default_concurrency(),
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Reports kept per task after each run; 0 keeps everything.
    #[serde(default = "default_reports_retained")]
    pub reports_retained: usize,
    /// Log lines included in notification tails.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

fn default_reports_retained() -> usize { 5 }
fn default_tail_lines() -> usize { 10 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reports_retained: default_reports_retained(),
            tail_lines: default_tail_lines(),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 8700 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Minimum outcome severity a notification handler reacts to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    #[default]
    Ok,
    Warnings,
    Errors,
    #[serde(alias = "failure")]
    Failed,
}

impl NotifyLevel {
    /// Numeric severity: ok(0) < warnings(10) < errors(20) < failed(30).
    pub fn severity(&self) -> u8 {
        match self {
            NotifyLevel::Ok => 0,
            NotifyLevel::Warnings => 10,
            NotifyLevel::Errors => 20,
            NotifyLevel::Failed => 30,
        }
    }
}

/// One configured notification handler, selected by its `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotificationHandlerConfig {
    /// Slack `chat.postMessage`.
    Slack {
        token: String,
        channel: String,
        #[serde(default)]
        level: NotifyLevel,
    },
    /// SMTP email.
    Email {
        from_email: String,
        recipients: Vec<String>,
        #[serde(default = "default_smtp_host")]
        smtp_host: String,
        #[serde(default = "default_smtp_port")]
        smtp_port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        level: NotifyLevel,
    },
    /// Generic HTTP webhook, POSTed as JSON.
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        level: NotifyLevel,
    },
}

fn default_smtp_host() -> String { "localhost".into() }
fn default_smtp_port() -> u16 { 587 }

impl NotificationHandlerConfig {
    pub fn level(&self) -> NotifyLevel {
        match self {
            NotificationHandlerConfig::Slack { level, .. }
            | NotificationHandlerConfig::Email { level, .. }
            | NotificationHandlerConfig::Webhook { level, .. } => *level,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NotificationHandlerConfig::Slack { .. } => "slack",
            NotificationHandlerConfig::Email { .. } => "email",
            NotificationHandlerConfig::Webhook { .. } => "webhook",
        }
    }
}

/// An external program registered as a predefined command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub program: String,
    /// Fixed arguments placed before the task's own arguments.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "bool_true")]
    pub active: bool,
}

fn default_namespace() -> String { "local".into() }
fn bool_true() -> bool { true }
