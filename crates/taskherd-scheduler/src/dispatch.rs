//! Notification delivery: sends notifications over Slack, SMTP email and
//! generic HTTP webhooks.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use taskherd_core::config::NotificationHandlerConfig;
use taskherd_core::error::{Result, TaskherdError};

use crate::notify::{Notification, NotificationHandler, NotifyTransport};

const SLACK_POST_MESSAGE: &str = "https://slack.com/api/chat.postMessage";

/// Real transport, one shared HTTP client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Client with a 10 second request timeout.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TaskherdError::Notification(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotifyTransport for HttpTransport {
    async fn deliver(
        &self,
        handler: &NotificationHandler,
        notification: &Notification,
    ) -> Result<()> {
        match &handler.config {
            NotificationHandlerConfig::Slack { token, channel, .. } => {
                self.send_slack(token, channel, notification).await
            }
            NotificationHandlerConfig::Email {
                from_email,
                recipients,
                smtp_host,
                smtp_port,
                username,
                password,
                ..
            } => {
                let smtp = SmtpSettings {
                    host: smtp_host,
                    port: *smtp_port,
                    username: username.as_deref(),
                    password: password.as_deref(),
                };
                send_email(&smtp, from_email, recipients, notification).await
            }
            NotificationHandlerConfig::Webhook { url, headers, .. } => {
                self.send_webhook(url, headers, notification).await
            }
        }
    }
}

impl HttpTransport {
    /// Send via Slack `chat.postMessage`.
    async fn send_slack(&self, token: &str, channel: &str, notification: &Notification) -> Result<()> {
        let resp = self
            .client
            .post(SLACK_POST_MESSAGE)
            .bearer_auth(token)
            .json(&serde_json::json!({
                "channel": channel,
                "text": notification.plain_message(),
                "blocks": slack_blocks(notification),
            }))
            .send()
            .await
            .map_err(|e| TaskherdError::Notification(format!("Slack send failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        // Slack answers 200 with {"ok": false} on API errors.
        if status.is_success() && body["ok"].as_bool().unwrap_or(false) {
            tracing::info!("✅ Slack notification sent to {channel}: report {}", notification.report_id);
            Ok(())
        } else {
            let reason = body["error"].as_str().unwrap_or("unknown error");
            Err(TaskherdError::Notification(format!("Slack API error {status}: {reason}")))
        }
    }

    /// POST the notification as JSON.
    async fn send_webhook(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        notification: &Notification,
    ) -> Result<()> {
        let mut req = self.client.post(url).json(notification);
        for (key, value) in headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TaskherdError::Notification(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent to {url}: report {}", notification.report_id);
            Ok(())
        } else {
            Err(TaskherdError::Notification(format!("Webhook error {}", resp.status())))
        }
    }
}

/// Slack Block Kit layout: header context, message, link to the full log,
/// log tail.
pub fn slack_blocks(notification: &Notification) -> serde_json::Value {
    let mut blocks = vec![
        serde_json::json!({
            "type": "context",
            "elements": [{"type": "mrkdwn", "text": "taskherd"}]
        }),
        serde_json::json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": notification.message}
        }),
    ];
    if let Some(url) = &notification.logs_url {
        blocks.push(serde_json::json!({
            "type": "context",
            "elements": [{"type": "mrkdwn", "text": format!("<{url}|Full logs>")}]
        }));
    }
    blocks.push(serde_json::json!({
        "type": "section",
        "text": {"type": "mrkdwn", "text": format!("Logs tail:\n```{}```", notification.tail)}
    }));
    serde_json::Value::Array(blocks)
}

struct SmtpSettings<'a> {
    host: &'a str,
    port: u16,
    username: Option<&'a str>,
    password: Option<&'a str>,
}

/// Plain-text email body: message, link, tail.
pub fn email_body(notification: &Notification) -> String {
    let mut body = notification.plain_message();
    if let Some(url) = &notification.logs_url {
        body.push_str(&format!("\n\nFull logs: {url}"));
    }
    if !notification.tail.is_empty() {
        body.push_str(&format!("\n\nLogs tail:\n{}", notification.tail));
    }
    body
}

/// Send via SMTP (async lettre, STARTTLS).
async fn send_email(
    smtp: &SmtpSettings<'_>,
    from_email: &str,
    recipients: &[String],
    notification: &Notification,
) -> Result<()> {
    use lettre::{
        AsyncSmtpTransport, AsyncTransport, Message, message::Mailbox,
        message::header::ContentType, transport::smtp::authentication::Credentials,
    };

    let from: Mailbox = from_email
        .parse()
        .map_err(|e| TaskherdError::Notification(format!("Invalid from: {e}")))?;

    let mut builder = Message::builder()
        .from(from)
        .subject(notification.plain_message())
        .header(ContentType::TEXT_PLAIN);
    for recipient in recipients {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| TaskherdError::Notification(format!("Invalid to '{recipient}': {e}")))?;
        builder = builder.to(to);
    }

    let email = builder
        .body(email_body(notification))
        .map_err(|e| TaskherdError::Notification(format!("Build email: {e}")))?;

    let mut transport = AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(smtp.host)
        .map_err(|e| TaskherdError::Notification(format!("SMTP relay: {e}")))?
        .port(smtp.port);
    if let (Some(user), Some(pass)) = (smtp.username, smtp.password) {
        transport = transport.credentials(Credentials::new(user.to_string(), pass.to_string()));
    }

    transport
        .build()
        .send(email)
        .await
        .map_err(|e| TaskherdError::Notification(format!("SMTP send: {e}")))?;

    tracing::info!("📤 Email notification sent to {} recipient(s)", recipients.len());
    Ok(())
}
