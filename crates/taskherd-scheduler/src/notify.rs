//! Notification dispatcher: tells configured handlers how a run ended.
//!
//! The set of handlers is fixed at startup ([`NotificationRegistry`]). For
//! each finished report, every handler whose threshold the outcome reaches
//! gets one delivery through a [`NotifyTransport`]. Delivery failures are
//! logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use taskherd_core::config::{NotificationHandlerConfig, NotifyLevel};
use taskherd_core::error::Result;

use crate::logsink::LogSink;
use crate::report::{ExecutionReport, InvocationResult, LogLevel};

/// One configured handler.
#[derive(Debug, Clone)]
pub struct NotificationHandler {
    pub name: String,
    pub config: NotificationHandlerConfig,
}

impl NotificationHandler {
    pub fn threshold(&self) -> NotifyLevel {
        self.config.level()
    }

    /// Whether an outcome is severe enough for this handler.
    pub fn accepts(&self, result: InvocationResult) -> bool {
        result
            .severity()
            .is_some_and(|s| s >= self.threshold().severity())
    }
}

/// Immutable set of handlers, built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct NotificationRegistry {
    handlers: Vec<NotificationHandler>,
}

impl NotificationRegistry {
    pub fn from_config(config: &BTreeMap<String, NotificationHandlerConfig>) -> Self {
        let handlers = config
            .iter()
            .map(|(name, config)| NotificationHandler {
                name: name.clone(),
                config: config.clone(),
            })
            .collect::<Vec<_>>();
        for handler in &handlers {
            tracing::debug!(
                "🔔 Notification handler '{}' ({}, level {:?})",
                handler.name,
                handler.config.kind(),
                handler.threshold()
            );
        }
        Self { handlers }
    }

    pub fn handlers(&self) -> &[NotificationHandler] {
        &self.handlers
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Everything a handler needs to describe a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub task_name: String,
    pub report_id: i64,
    pub result: InvocationResult,
    pub invocation_datetime: DateTime<Utc>,
    pub n_errors: u32,
    pub n_warnings: u32,
    /// Formatted per-severity message.
    pub message: String,
    /// Link to the full log, when a base URL is configured.
    pub logs_url: Option<String>,
    /// Last log lines, led by a "lines hidden" marker when truncated.
    pub tail: String,
}

impl Notification {
    /// The message without its markdown emphasis, for plain-text channels.
    pub fn plain_message(&self) -> String {
        self.message.replace('*', "")
    }
}

/// Delivers a notification through a handler's channel.
#[async_trait]
pub trait NotifyTransport: Send + Sync {
    async fn deliver(&self, handler: &NotificationHandler, notification: &Notification)
    -> Result<()>;
}

/// Per-severity message. `None` for an unclassified result.
pub fn format_message(
    result: InvocationResult,
    task_name: &str,
    invocation_datetime: DateTime<Utc>,
    n_errors: u32,
    n_warnings: u32,
) -> Option<String> {
    let at = invocation_datetime.format("%x %X");
    let message = match result {
        InvocationResult::None => return None,
        InvocationResult::Ok => {
            format!("Task *\"{task_name}\"* invoked at {at} completed successfully.")
        }
        InvocationResult::Warnings | InvocationResult::Errors => format!(
            "Task *\"{task_name}\"* invoked at {at} completed successfully \
             with *{n_errors}* errors and *{n_warnings}* warnings."
        ),
        InvocationResult::Failed => format!("Task *\"{task_name}\"* invoked at {at} *failed*."),
    };
    Some(message)
}

pub struct NotificationDispatcher {
    registry: Arc<NotificationRegistry>,
    transport: Arc<dyn NotifyTransport>,
    sink: Arc<dyn LogSink>,
    base_url: Option<String>,
    tail_lines: usize,
}

impl NotificationDispatcher {
    pub fn new(
        registry: Arc<NotificationRegistry>,
        transport: Arc<dyn NotifyTransport>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            registry,
            transport,
            sink,
            base_url: None,
            tail_lines: 10,
        }
    }

    /// Base URL for "full logs" links.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    pub fn registry(&self) -> &NotificationRegistry {
        &self.registry
    }

    /// Build the notification for a report, or `None` while unclassified.
    pub fn build(&self, report: &ExecutionReport, task_name: &str) -> Result<Option<Notification>> {
        let n_errors = self.sink.count_by_level(report.id, LogLevel::Error)?;
        let n_warnings = self.sink.count_by_level(report.id, LogLevel::Warning)?;
        let Some(message) = format_message(
            report.invocation_result,
            task_name,
            report.invocation_datetime,
            n_errors,
            n_warnings,
        ) else {
            return Ok(None);
        };
        Ok(Some(Notification {
            task_name: task_name.to_string(),
            report_id: report.id,
            result: report.invocation_result,
            invocation_datetime: report.invocation_datetime,
            n_errors,
            n_warnings,
            message,
            logs_url: self
                .base_url
                .as_ref()
                .map(|base| format!("{base}/reports/{}/live", report.id)),
            tail: self.sink.tail(report.id, self.tail_lines)?.render(),
        }))
    }

    /// Deliver to every handler whose threshold the report reaches.
    /// Returns how many deliveries succeeded; never fails.
    pub async fn emit(&self, report: &ExecutionReport, task_name: &str) -> usize {
        if report.invocation_result == InvocationResult::None || self.registry.is_empty() {
            return 0;
        }
        let notification = match self.build(report, task_name) {
            Ok(Some(n)) => n,
            Ok(None) => return 0,
            Err(e) => {
                tracing::warn!(report_id = report.id, "Cannot build notification: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for handler in self.registry.handlers() {
            if !handler.accepts(report.invocation_result) {
                continue;
            }
            match self.transport.deliver(handler, &notification).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    report_id = report.id,
                    "Notification via '{}' failed: {e}",
                    handler.name
                ),
            }
        }
        delivered
    }
}

/// Keeps deliveries in memory instead of sending them.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingTransport {
    delivered: std::sync::Mutex<Vec<(String, Notification)>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub(crate) fn count(&self) -> usize {
        self.delivered.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub(crate) fn deliveries(&self) -> Vec<(String, Notification)> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl NotifyTransport for RecordingTransport {
    async fn deliver(
        &self,
        handler: &NotificationHandler,
        notification: &Notification,
    ) -> Result<()> {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push((handler.name.clone(), notification.clone()));
        }
        Ok(())
    }
}
