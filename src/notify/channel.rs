// Notification Channels
// The delivery surfaces a routed notification can land on

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use async_trait::async_trait;

/// A delivery surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Chat,
    Email,
    Pager,
    IssueTracker,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Chat => "chat",
            ChannelKind::Email => "email",
            ChannelKind::Pager => "pager",
            ChannelKind::IssueTracker => "issue-tracker",
        }
    }
}

/// Severity assigned by the router's classification rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// What a notification is about; part of the deduplication key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    Run(Uuid),
    Stage(Uuid),
    Rollback(Uuid),
    Promotion(Uuid),
}

/// A classified notification ready for delivery
#[derive(Debug, Clone)]
pub struct Notification {
    pub source: EventSource,
    pub severity: Severity,
    pub summary: String,
    /// Whether the underlying event concerns a production environment
    pub is_production: bool,
    /// How many occurrences of this (source, severity) this delivery stands
    /// for; stamped by the router, 1 for a first occurrence
    pub repeat_count: u32,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(source: EventSource, severity: Severity, summary: impl Into<String>) -> Self {
        Self {
            source,
            severity,
            summary: summary.into(),
            is_production: false,
            repeat_count: 1,
            occurred_at: Utc::now(),
        }
    }

    pub fn production(mut self) -> Self {
        self.is_production = true;
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("channel rejected the notification: {0}")]
    Rejected(String),
    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// External collaborator wrapping one real delivery surface (a chat webhook,
/// an SMTP relay, a paging provider). The router retries transient failures;
/// implementations only report them.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}
