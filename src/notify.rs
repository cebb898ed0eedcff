use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Change, EntryState, Notification, NotificationKind};
use crate::observability::NOTIFICATIONS_SENT_TOTAL;

const CHANNEL_CAPACITY: usize = 256;
const FEED_CAPACITY: usize = 4096;

/// Broadcast hub for committed waitlist transitions: one channel per
/// resource plus a feed carrying every resource.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    feed: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            feed: broadcast::channel(FEED_CAPACITY).0,
        }
    }

    /// Subscribe to one resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.feed.subscribe()
    }

    /// Fan out to the resource's channel and the feed. No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        metrics::counter!(NOTIFICATIONS_SENT_TOTAL, "event" => notification.event.as_str())
            .increment(1);
        if let Some(sender) = self.channels.get(&notification.resource_id) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.feed.send(notification.clone());
    }

    /// Drop a resource's channel once its last listener is gone.
    pub fn remove_if_idle(&self, resource_id: &Ulid) {
        self.channels
            .remove_if(resource_id, |_, sender| sender.receiver_count() == 0);
    }
}

/// The notifications a committed change list produces, in commit order.
/// Withdrawals and requeues are the actor's own doing and notify nobody.
pub fn notifications_for(resource_id: Ulid, changes: &[Change]) -> Vec<Notification> {
    changes
        .iter()
        .filter_map(|change| {
            let (entry_id, actor_id, event, expires_at) = match change {
                Change::Notified {
                    entry_id,
                    actor_id,
                    expires_at,
                } => (entry_id, actor_id, NotificationKind::Promoted, Some(*expires_at)),
                Change::Dequeued {
                    entry_id,
                    actor_id,
                    outcome: EntryState::Confirmed,
                } => (entry_id, actor_id, NotificationKind::Confirmed, None),
                Change::Dequeued {
                    entry_id,
                    actor_id,
                    outcome: EntryState::Expired,
                } => (entry_id, actor_id, NotificationKind::Expired, None),
                _ => return None,
            };
            Some(Notification {
                resource_id,
                actor_id: actor_id.clone(),
                entry_id: *entry_id,
                event,
                expires_at,
            })
        })
        .collect()
}

/// `LISTEN` channel name for a resource.
pub fn channel_name(resource_id: Ulid) -> String {
    format!("resource_{resource_id}")
}

pub fn parse_channel(channel: &str) -> Option<Ulid> {
    let id = channel.strip_prefix("resource_")?;
    Ulid::from_string(id).ok()
}
