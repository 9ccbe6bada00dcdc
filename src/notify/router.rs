// Notification Router
// Classifies lifecycle events, suppresses repeats and fans out to channels

use crate::execution::{EventReceiver, JobStatus, PipelineEvent, PipelineStatus};
use crate::notify::channel::{
    ChannelKind, DeliveryError, EventSource, Notification, NotificationChannel, Severity,
};

use chrono::{DateTime, Timelike, Utc};
use tokio::time::sleep;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A daily window during which non-urgent notifications are routed to email
/// only. Hours are UTC; a window may wrap past midnight.
#[derive(Debug, Clone, Copy)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl QuietHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Repeats of the same (source, severity) within this window are
    /// suppressed and counted instead of re-delivered
    pub dedup_window: Duration,
    pub quiet_hours: Option<QuietHours>,
    /// Delivery attempts per channel before giving up
    pub max_attempts: u32,
    /// Base delay between delivery attempts, doubled per attempt
    pub retry_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(60 * 60),
            quiet_hours: None,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of routing one notification to one channel
#[derive(Debug)]
pub struct DeliveryAttempt {
    pub channel: ChannelKind,
    pub attempts: u32,
    pub result: Result<(), DeliveryError>,
}

struct DedupEntry {
    first_seen: DateTime<Utc>,
    repeat_count: u32,
}

/// Routes classified notifications to registered channels.
///
/// Classification is first-match: production criticals page, errors open
/// tickets, warnings land in chat and the tracker, everything else is chat
/// only. During quiet hours, info and warning notifications downgrade to
/// email so only urgent severities interrupt anyone.
pub struct NotificationRouter {
    config: RouterConfig,
    channels: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
    dedup: Mutex<HashMap<(EventSource, Severity), DedupEntry>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            config,
            channels: HashMap::new(),
            dedup: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.insert(channel.kind(), channel);
        self
    }

    /// Route one notification to every channel its classification selects.
    ///
    /// Returns one attempt record per selected, registered channel; an empty
    /// vec means the notification was suppressed as a repeat.
    pub async fn route(&self, notification: &Notification) -> Vec<DeliveryAttempt> {
        let Some(repeat_count) = self.record(notification) else {
            tracing::debug!(
                summary = %notification.summary,
                "suppressed repeat notification"
            );
            return Vec::new();
        };

        let mut stamped = notification.clone();
        stamped.repeat_count = repeat_count;

        let mut attempts = Vec::new();
        for kind in self.targets(&stamped, Utc::now().hour()) {
            let Some(channel) = self.channels.get(&kind) else {
                continue;
            };
            attempts.push(self.deliver(channel.as_ref(), &stamped).await);
        }
        attempts
    }

    /// Classify one lifecycle event into a notification, if it warrants one
    pub fn observe(&self, event: &PipelineEvent) -> Option<Notification> {
        match event {
            PipelineEvent::StageHalted {
                stage_id,
                stage_name,
                is_production,
                reason,
                ..
            } => {
                let severity = if *is_production {
                    Severity::Critical
                } else {
                    Severity::Error
                };
                let mut notification = Notification::new(
                    EventSource::Stage(*stage_id),
                    severity,
                    format!("stage '{stage_name}' halted: {reason}"),
                );
                if *is_production {
                    notification = notification.production();
                }
                Some(notification)
            }
            PipelineEvent::RollbackUnavailable {
                stage_id,
                stage_name,
                is_production,
                reason,
            } => {
                let mut notification = Notification::new(
                    EventSource::Stage(*stage_id),
                    Severity::Critical,
                    format!("manual intervention required for '{stage_name}': {reason}"),
                );
                if *is_production {
                    notification = notification.production();
                }
                Some(notification)
            }
            PipelineEvent::RollbackStarted {
                action_id,
                strategy,
                ..
            } => Some(Notification::new(
                EventSource::Rollback(*action_id),
                Severity::Warning,
                format!("rollback started ({})", strategy.as_str()),
            )),
            PipelineEvent::RollbackCompleted {
                action_id,
                strategy,
                succeeded,
                ..
            } => {
                let severity = if *succeeded {
                    Severity::Info
                } else {
                    Severity::Error
                };
                Some(Notification::new(
                    EventSource::Rollback(*action_id),
                    severity,
                    format!(
                        "rollback ({}) {}",
                        strategy.as_str(),
                        if *succeeded { "succeeded" } else { "failed" }
                    ),
                ))
            }
            PipelineEvent::RunCompleted {
                run_id,
                status,
                reason,
                ..
            } => match status {
                PipelineStatus::Failed => Some(Notification::new(
                    EventSource::Run(*run_id),
                    Severity::Error,
                    format!(
                        "pipeline run failed: {}",
                        reason.as_deref().unwrap_or("unknown failure")
                    ),
                )),
                _ => None,
            },
            PipelineEvent::JobCompleted {
                run_id,
                job_id,
                status,
                attempts,
                ..
            } => match status {
                JobStatus::Failed => Some(Notification::new(
                    EventSource::Run(*run_id),
                    Severity::Warning,
                    format!("job '{job_id}' failed after {attempts} attempt(s)"),
                )),
                _ => None,
            },
            PipelineEvent::StageAwaitingApproval {
                stage_id,
                stage_name,
                gate,
                ..
            } => Some(Notification::new(
                EventSource::Stage(*stage_id),
                Severity::Info,
                format!(
                    "stage '{stage_name}' awaiting approval ({} required)",
                    gate.required_approvals()
                ),
            )),
            PipelineEvent::StageAdvanced {
                stage_id,
                stage_name,
                ..
            } => Some(Notification::new(
                EventSource::Stage(*stage_id),
                Severity::Info,
                format!("stage '{stage_name}' advanced"),
            )),
            PipelineEvent::PromotionCompleted {
                promotion_id,
                change_set_id,
            } => Some(Notification::new(
                EventSource::Promotion(*promotion_id),
                Severity::Info,
                format!("change set '{change_set_id}' fully promoted"),
            )),
            // Starts, skips, approvals and run-level bookkeeping stay quiet;
            // the terminal transitions above cover them.
            _ => None,
        }
    }

    /// Observe and route in one step
    pub async fn dispatch(&self, event: &PipelineEvent) -> Vec<DeliveryAttempt> {
        match self.observe(event) {
            Some(notification) => self.route(&notification).await,
            None => Vec::new(),
        }
    }

    /// Consume a lifecycle event stream until its senders drop
    pub fn attach(self: Arc<Self>, mut events: EventReceiver) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.dispatch(&event).await;
            }
        })
    }

    /// How many times a (source, severity) pair has been seen within its
    /// current dedup window, including the delivered first occurrence
    pub fn repeat_count(&self, source: EventSource, severity: Severity) -> u32 {
        self.dedup
            .lock()
            .ok()
            .and_then(|map| map.get(&(source, severity)).map(|e| e.repeat_count))
            .unwrap_or(0)
    }

    /// Record the notification against its dedup key.
    ///
    /// `None` means it is a repeat within the window and must not be
    /// delivered again; `Some(count)` means deliver, carrying the cumulative
    /// occurrence count (so a re-delivery after the window surfaces the
    /// repeats that were collapsed into it).
    fn record(&self, notification: &Notification) -> Option<u32> {
        let Ok(mut dedup) = self.dedup.lock() else {
            return Some(notification.repeat_count);
        };
        let now = Utc::now();
        let key = (notification.source, notification.severity);

        match dedup.get_mut(&key) {
            Some(entry)
                if (now - entry.first_seen).to_std().unwrap_or(Duration::ZERO)
                    < self.config.dedup_window =>
            {
                entry.repeat_count += 1;
                None
            }
            Some(entry) => {
                entry.first_seen = now;
                entry.repeat_count += 1;
                Some(entry.repeat_count)
            }
            None => {
                dedup.insert(
                    key,
                    DedupEntry {
                        first_seen: now,
                        repeat_count: 1,
                    },
                );
                Some(1)
            }
        }
    }

    /// First-match classification table
    fn targets(&self, notification: &Notification, hour: u32) -> Vec<ChannelKind> {
        let quiet = self
            .config
            .quiet_hours
            .map(|window| window.contains(hour))
            .unwrap_or(false);

        match notification.severity {
            Severity::Critical if notification.is_production => {
                vec![ChannelKind::Chat, ChannelKind::Email, ChannelKind::Pager]
            }
            Severity::Critical | Severity::Error => vec![
                ChannelKind::Chat,
                ChannelKind::Email,
                ChannelKind::IssueTracker,
            ],
            Severity::Warning if quiet => vec![ChannelKind::Email],
            Severity::Warning => vec![ChannelKind::Chat, ChannelKind::IssueTracker],
            Severity::Info if quiet => vec![ChannelKind::Email],
            Severity::Info => vec![ChannelKind::Chat],
        }
    }

    /// Deliver with bounded exponential backoff between attempts
    async fn deliver(
        &self,
        channel: &dyn NotificationChannel,
        notification: &Notification,
    ) -> DeliveryAttempt {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match channel.deliver(notification).await {
                Ok(()) => {
                    return DeliveryAttempt {
                        channel: channel.kind(),
                        attempts: attempt,
                        result: Ok(()),
                    }
                }
                Err(error) if attempt < self.config.max_attempts => {
                    tracing::warn!(
                        channel = channel.kind().as_str(),
                        %error,
                        attempt,
                        "delivery failed, retrying"
                    );
                    sleep(self.config.retry_backoff * 2u32.pow(attempt - 1)).await;
                }
                Err(error) => {
                    tracing::error!(
                        channel = channel.kind().as_str(),
                        %error,
                        attempts = attempt,
                        "delivery abandoned"
                    );
                    return DeliveryAttempt {
                        channel: channel.kind(),
                        attempts: attempt,
                        result: Err(error),
                    };
                }
            }
        }
    }
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RunPurpose;
    use crate::rollback::RollbackStrategy;

    use async_trait::async_trait;
    use uuid::Uuid;

    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingChannel {
        kind: ChannelKind,
        delivered: Mutex<Vec<Notification>>,
    }

    impl RecordingChannel {
        fn new(kind: ChannelKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
            self.delivered.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` deliveries, then succeeds
    struct FlakyChannel {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationChannel for FlakyChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Chat
        }

        async fn deliver(&self, _notification: &Notification) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(DeliveryError::Unavailable("webhook 503".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn full_day() -> QuietHours {
        QuietHours {
            start_hour: 0,
            end_hour: 24,
        }
    }

    #[test]
    fn test_quiet_hours_window() {
        let overnight = QuietHours {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(overnight.contains(23));
        assert!(overnight.contains(3));
        assert!(!overnight.contains(12));

        assert!(full_day().contains(0));
        assert!(full_day().contains(23));
    }

    #[test]
    fn test_classification_table() {
        let router = NotificationRouter::new();
        let source = EventSource::Stage(Uuid::new_v4());

        let critical_prod =
            Notification::new(source, Severity::Critical, "prod down").production();
        assert_eq!(
            router.targets(&critical_prod, 12),
            vec![ChannelKind::Chat, ChannelKind::Email, ChannelKind::Pager]
        );

        let error = Notification::new(source, Severity::Error, "stage halted");
        assert_eq!(
            router.targets(&error, 12),
            vec![
                ChannelKind::Chat,
                ChannelKind::Email,
                ChannelKind::IssueTracker
            ]
        );

        let warning = Notification::new(source, Severity::Warning, "job failed");
        assert_eq!(
            router.targets(&warning, 12),
            vec![ChannelKind::Chat, ChannelKind::IssueTracker]
        );

        let info = Notification::new(source, Severity::Info, "stage advanced");
        assert_eq!(router.targets(&info, 12), vec![ChannelKind::Chat]);
    }

    #[test]
    fn test_quiet_hours_downgrade_non_urgent_only() {
        let router = NotificationRouter::with_config(RouterConfig {
            quiet_hours: Some(full_day()),
            ..RouterConfig::default()
        });
        let source = EventSource::Stage(Uuid::new_v4());

        let info = Notification::new(source, Severity::Info, "advanced");
        assert_eq!(router.targets(&info, 3), vec![ChannelKind::Email]);

        let warning = Notification::new(source, Severity::Warning, "flaky");
        assert_eq!(router.targets(&warning, 3), vec![ChannelKind::Email]);

        // urgent severities ignore quiet hours
        let critical =
            Notification::new(source, Severity::Critical, "prod down").production();
        assert_eq!(
            router.targets(&critical, 3),
            vec![ChannelKind::Chat, ChannelKind::Email, ChannelKind::Pager]
        );
    }

    #[tokio::test]
    async fn test_repeat_within_window_is_suppressed_and_counted() {
        let chat = RecordingChannel::new(ChannelKind::Chat);
        let router = NotificationRouter::new().register(chat.clone());
        let source = EventSource::Run(Uuid::new_v4());

        let notification = Notification::new(source, Severity::Info, "stage advanced");
        let first = router.route(&notification).await;
        assert_eq!(first.len(), 1);

        let second = router.route(&notification).await;
        assert!(second.is_empty());

        assert_eq!(chat.count(), 1);
        assert_eq!(router.repeat_count(source, Severity::Info), 2);
        // the delivered payload carries its own occurrence count
        assert_eq!(chat.delivered.lock().unwrap()[0].repeat_count, 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_window_carries_accumulated_count() {
        // zero window: every occurrence is past the window, so each delivers
        // with the cumulative count
        let chat = RecordingChannel::new(ChannelKind::Chat);
        let router = NotificationRouter::with_config(RouterConfig {
            dedup_window: Duration::ZERO,
            ..RouterConfig::default()
        })
        .register(chat.clone());
        let source = EventSource::Run(Uuid::new_v4());
        let notification = Notification::new(source, Severity::Warning, "flaky stage");

        router.route(&notification).await;
        router.route(&notification).await;
        router.route(&notification).await;

        let delivered = chat.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[0].repeat_count, 1);
        assert_eq!(delivered[1].repeat_count, 2);
        assert_eq!(delivered[2].repeat_count, 3);
    }

    #[tokio::test]
    async fn test_distinct_severity_is_not_a_repeat() {
        let chat = RecordingChannel::new(ChannelKind::Chat);
        let tracker = RecordingChannel::new(ChannelKind::IssueTracker);
        let router = NotificationRouter::new()
            .register(chat.clone())
            .register(tracker.clone());
        let source = EventSource::Run(Uuid::new_v4());

        router
            .route(&Notification::new(source, Severity::Info, "advanced"))
            .await;
        let attempts = router
            .route(&Notification::new(source, Severity::Warning, "job failed"))
            .await;

        assert_eq!(attempts.len(), 2);
        assert_eq!(chat.count(), 2);
    }

    #[tokio::test]
    async fn test_delivery_retries_with_backoff() {
        let flaky = Arc::new(FlakyChannel {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let router = NotificationRouter::with_config(RouterConfig {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            ..RouterConfig::default()
        })
        .register(flaky.clone());

        let notification = Notification::new(
            EventSource::Run(Uuid::new_v4()),
            Severity::Info,
            "advanced",
        );
        let attempts = router.route(&notification).await;

        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempts, 3);
        assert!(attempts[0].result.is_ok());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let flaky = Arc::new(FlakyChannel {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let router = NotificationRouter::with_config(RouterConfig {
            max_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            ..RouterConfig::default()
        })
        .register(flaky.clone());

        let notification = Notification::new(
            EventSource::Run(Uuid::new_v4()),
            Severity::Info,
            "advanced",
        );
        let attempts = router.route(&notification).await;

        assert_eq!(attempts[0].attempts, 2);
        assert!(attempts[0].result.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observe_classifies_lifecycle_events() {
        let router = NotificationRouter::new();
        let stage_id = Uuid::new_v4();

        let halted = router
            .observe(&PipelineEvent::StageHalted {
                promotion_id: Uuid::new_v4(),
                stage_id,
                stage_name: "prod".to_string(),
                is_production: true,
                reason: "deploy failed".to_string(),
            })
            .unwrap();
        assert_eq!(halted.severity, Severity::Critical);
        assert!(halted.is_production);

        let halted_dev = router
            .observe(&PipelineEvent::StageHalted {
                promotion_id: Uuid::new_v4(),
                stage_id,
                stage_name: "dev".to_string(),
                is_production: false,
                reason: "deploy failed".to_string(),
            })
            .unwrap();
        assert_eq!(halted_dev.severity, Severity::Error);

        let unavailable = router
            .observe(&PipelineEvent::RollbackUnavailable {
                stage_id,
                stage_name: "prod".to_string(),
                is_production: true,
                reason: "nothing to redeploy".to_string(),
            })
            .unwrap();
        assert_eq!(unavailable.severity, Severity::Critical);

        let rollback = router
            .observe(&PipelineEvent::RollbackStarted {
                action_id: Uuid::new_v4(),
                stage_id,
                strategy: RollbackStrategy::RedeployPrevious,
            })
            .unwrap();
        assert_eq!(rollback.severity, Severity::Warning);

        // job starts never notify
        assert!(router
            .observe(&PipelineEvent::JobStarted {
                run_id: Uuid::new_v4(),
                job_id: "build".to_string(),
                attempt: 1,
            })
            .is_none());

        let failed_run = router
            .observe(&PipelineEvent::RunCompleted {
                run_id: Uuid::new_v4(),
                purpose: RunPurpose::Forward,
                status: PipelineStatus::Failed,
                duration: Duration::from_secs(1),
                reason: Some("build broke".to_string()),
            })
            .unwrap();
        assert_eq!(failed_run.severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_attach_consumes_an_event_stream() {
        let chat = RecordingChannel::new(ChannelKind::Chat);
        let router = Arc::new(NotificationRouter::new().register(chat.clone()));
        let (tx, rx) = crate::execution::event_channel();

        let consumer = router.attach(rx);
        tx.send(PipelineEvent::StageAdvanced {
            promotion_id: Uuid::new_v4(),
            stage_id: Uuid::new_v4(),
            stage_name: "dev".to_string(),
        })
        .unwrap();
        drop(tx);

        consumer.await.unwrap();
        assert_eq!(chat.count(), 1);
    }
}
