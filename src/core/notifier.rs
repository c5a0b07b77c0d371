//! Operator notifications.
//!
//! Delivery is best effort: a failed send never affects the mitigation it
//! reports on. `DeliveryPolicy` decides whether such failures are still
//! logged and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use lettre::message::header::ContentType;
use lettre::{AsyncSendmailTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, warn};
use metrics::increment_counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AlertsConfig, DispatchReport, FailureKind};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Errors that can occur while delivering a notification
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint returned HTTP {0}")]
    Status(u16),
    #[error("invalid mail address: {0}")]
    Address(String),
    #[error("mail delivery failed: {0}")]
    Mail(String),
}

impl NotifyError {
    pub fn kind(&self) -> FailureKind {
        match self {
            NotifyError::Address(_) => FailureKind::Configuration,
            NotifyError::Mail(_) => FailureKind::Command,
            NotifyError::Request(_) | NotifyError::Status(_) => FailureKind::TransientProvider,
        }
    }
}

/// Alert level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

/// Alert sent to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Summarize a dispatch for `cidr`
    pub fn from_dispatch(cycle_id: Uuid, cidr: &str, report: &DispatchReport) -> Self {
        let level = if report.failed > 0 {
            AlertLevel::Error
        } else if report.applied > 0 {
            AlertLevel::Warning
        } else {
            AlertLevel::Info
        };

        let mut lines = vec![format!(
            "{} applied, {} failed, {} targets",
            report.applied,
            report.failed,
            report.targets.len()
        )];
        for target in &report.targets {
            let status = match (&target.error, target.applied) {
                (Some(error), _) => format!("failed: {error}"),
                (None, true) => "applied".to_string(),
                (None, false) => "not applied".to_string(),
            };
            lines.push(format!("- {} {}: {}", target.scope, target.action, status));
        }

        Self {
            id: Uuid::new_v4().to_string(),
            level,
            title: format!("[tms] mitigation on {cidr}"),
            message: lines.join("\n"),
            source: format!("cycle {cycle_id}"),
            created_at: Utc::now(),
        }
    }
}

/// Operator channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum AlertChannel {
    /// Local mail submission through sendmail
    Email {
        to: String,
        #[serde(default)]
        from: Option<String>,
    },
    /// Generic JSON webhook
    Webhook { url: String },
    /// Telegram bot message
    Telegram { bot_token: String, chat_id: String },
}

impl AlertChannel {
    pub fn name(&self) -> &'static str {
        match self {
            AlertChannel::Email { .. } => "email",
            AlertChannel::Webhook { .. } => "webhook",
            AlertChannel::Telegram { .. } => "telegram",
        }
    }
}

/// Handling of failed deliveries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryPolicy {
    pub log_failures: bool,
    pub count_failures: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            log_failures: true,
            count_failures: true,
        }
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyOutcome {
    pub channel: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fans alerts out to operator channels
pub struct AlertNotifier {
    client: Client,
    mailer: AsyncSendmailTransport<Tokio1Executor>,
    channels: Vec<AlertChannel>,
    policy: DeliveryPolicy,
    sender: String,
    telegram_api: String,
    suppressed: AtomicU64,
}

impl AlertNotifier {
    pub fn new(config: &AlertsConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            mailer: AsyncSendmailTransport::<Tokio1Executor>::new(),
            channels: config.channels.clone(),
            policy: config.policy.clone(),
            sender: config.sender.clone(),
            telegram_api: TELEGRAM_API.to_string(),
            suppressed: AtomicU64::new(0),
        })
    }

    /// Point Telegram delivery at another Bot API endpoint
    pub fn with_telegram_api(mut self, base_url: &str) -> Self {
        self.telegram_api = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn channels(&self) -> &[AlertChannel] {
        &self.channels
    }

    /// Failures absorbed since startup
    pub fn suppressed_failures(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    async fn deliver(&self, channel: &AlertChannel, alert: &Alert) -> Result<(), NotifyError> {
        match channel {
            AlertChannel::Email { to, from } => {
                let from = from.as_deref().unwrap_or(&self.sender);
                let email = Message::builder()
                    .from(from.parse().map_err(|e| NotifyError::Address(format!("{from}: {e}")))?)
                    .to(to.parse().map_err(|e| NotifyError::Address(format!("{to}: {e}")))?)
                    .subject(alert.title.clone())
                    .header(ContentType::TEXT_PLAIN)
                    .body(alert.message.clone())
                    .map_err(|e| NotifyError::Mail(e.to_string()))?;
                self.mailer
                    .send(email)
                    .await
                    .map_err(|e| NotifyError::Mail(e.to_string()))?;
                Ok(())
            }
            AlertChannel::Webhook { url } => {
                let response = self.client.post(url).json(alert).send().await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(NotifyError::Status(response.status().as_u16()))
                }
            }
            AlertChannel::Telegram { bot_token, chat_id } => {
                let url = format!("{}/bot{}/sendMessage", self.telegram_api, bot_token);
                let text = format!("{}\n{}", alert.title, alert.message);
                let response = self
                    .client
                    .post(url)
                    .json(&json!({ "chat_id": chat_id, "text": text }))
                    .send()
                    .await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(NotifyError::Status(response.status().as_u16()))
                }
            }
        }
    }

    /// Send `alert` to one channel
    pub async fn notify(&self, channel: &AlertChannel, alert: &Alert) -> NotifyOutcome {
        match self.deliver(channel, alert).await {
            Ok(()) => {
                debug!("Alert {} delivered via {}", alert.id, channel.name());
                NotifyOutcome {
                    channel: channel.name().to_string(),
                    delivered: true,
                    error: None,
                }
            }
            Err(e) => {
                if self.policy.log_failures {
                    warn!("Alert {} not delivered via {}: {}", alert.id, channel.name(), e);
                }
                if self.policy.count_failures {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    increment_counter!("notification_failures_total", "channel" => channel.name());
                }
                NotifyOutcome {
                    channel: channel.name().to_string(),
                    delivered: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Send `alert` to every configured channel
    pub async fn notify_all(&self, alert: &Alert) -> Vec<NotifyOutcome> {
        join_all(self.channels.iter().map(|c| self.notify(c, alert))).await
    }
}
