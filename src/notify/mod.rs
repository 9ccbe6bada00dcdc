// Notify
// Severity classification, deduplication and channel fan-out for lifecycle events

pub mod channel;
pub mod router;

pub use channel::{
    ChannelKind, DeliveryError, EventSource, Notification, NotificationChannel, Severity,
};
pub use router::{DeliveryAttempt, NotificationRouter, QuietHours, RouterConfig};
