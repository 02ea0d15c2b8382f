//! Per-key fan-out notifications.
//!
//! Device sessions subscribe under the device id, dashboards under
//! `user:<name>`. Publishing never blocks: each subscriber has a small
//! bounded inbox and a full inbox simply misses that notification. Receivers
//! must tolerate lost notifications; every consumer in this crate also
//! re-evaluates state on a timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-subscriber inbox size.
pub const DEFAULT_INBOX_CAPACITY: usize = 8;

/// What a notification carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Something changed, re-read state
    Refresh,
    /// Show this image now, outside of rotation
    Image(Bytes),
    /// Forward this command to the device as-is
    Command(serde_json::Value),
}

/// JSON event forwarded to dashboard observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DashboardEvent {
    Refresh,
    Command { command: serde_json::Value },
}

impl DashboardEvent {
    /// Dashboards never receive raw images.
    pub fn from_notification(notification: &Notification) -> Option<Self> {
        match notification {
            Notification::Refresh => Some(DashboardEvent::Refresh),
            Notification::Command(command) => Some(DashboardEvent::Command {
                command: command.clone(),
            }),
            Notification::Image(_) => None,
        }
    }
}

/// Key under which a user's dashboard sessions subscribe.
pub fn user_key(user: &str) -> String {
    format!("user:{}", user)
}

/// A live subscription. Hand it back to [`Notifier::unsubscribe`] when done.
#[derive(Debug)]
pub struct Subscription {
    key: String,
    id: u64,
    rx: mpsc::Receiver<Notification>,
}

impl Subscription {
    /// Wait for the next notification.
    ///
    /// Returns `None` once the subscription has been removed from the
    /// notifier.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Take a notification if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Notification>,
}

#[derive(Debug)]
struct Registry {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Lock-protected subscriber registry. Cheap to clone.
///
/// A key's entry is created on its first subscription and removed when its
/// last subscriber leaves.
#[derive(Debug, Clone)]
pub struct Notifier {
    registry: Arc<Registry>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a notifier whose subscribers buffer `capacity` notifications.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        // A panic while holding the lock cannot leave the table half-updated
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, key: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.registry.capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        self.table()
            .entry(key.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        tracing::debug!("Subscribed {} (subscriber {})", key, id);

        Subscription {
            key: key.to_string(),
            id,
            rx,
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut table = self.table();
        if let Some(subscribers) = table.get_mut(&subscription.key) {
            subscribers.retain(|s| s.id != subscription.id);
            if subscribers.is_empty() {
                table.remove(&subscription.key);
            }
        }
        tracing::debug!(
            "Unsubscribed {} (subscriber {})",
            subscription.key,
            subscription.id
        );
    }

    /// Deliver to every subscriber of `key` without waiting.
    ///
    /// Returns how many subscribers accepted the notification.
    pub fn notify(&self, key: &str, notification: Notification) -> usize {
        let mut table = self.table();
        let Some(subscribers) = table.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|s| match s.tx.try_send(notification.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Inbox full for {} (subscriber {}), dropping", key, s.id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            table.remove(key);
        }

        delivered
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.table().get(key).map_or(0, Vec::len)
    }

    /// Number of keys with at least one subscriber.
    pub fn key_count(&self) -> usize {
        self.table().len()
    }
}
