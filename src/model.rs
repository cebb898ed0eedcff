use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::CapacityLedger;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Opaque caller identity, supplied by the auth layer and trusted as given.
pub type ActorId = String;

pub const HOUR_MS: Ms = 3_600_000;

/// How long a promoted actor has to confirm before the slot moves on.
pub const DEFAULT_PROMOTION_WINDOW_MS: Ms = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Confirmed,
    Released,
}

/// One occupied slot. Released rows are kept for audit, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub actor_id: ActorId,
    pub state: ReservationState,
    pub confirmed_at: Ms,
    pub released_at: Option<Ms>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.state == ReservationState::Confirmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    Waiting,
    Notified,
    Expired,
    Confirmed,
    Withdrawn,
}

impl EntryState {
    /// Terminal entries are audit-only and take no part in position accounting.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryState::Expired | EntryState::Confirmed | EntryState::Withdrawn
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Waiting => "waiting",
            EntryState::Notified => "notified",
            EntryState::Expired => "expired",
            EntryState::Confirmed => "confirmed",
            EntryState::Withdrawn => "withdrawn",
        }
    }
}

/// An actor's place in line for a full resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub actor_id: ActorId,
    /// 1-based. For terminal entries this is the last position held.
    pub position: u32,
    pub state: EntryState,
    pub joined_at: Ms,
    pub notified_at: Option<Ms>,
    pub expires_at: Option<Ms>,
    pub closed_at: Option<Ms>,
}

impl WaitlistEntry {
    pub fn is_pending(&self) -> bool {
        !self.state.is_terminal()
    }

    /// A notification whose window has closed but which nobody has swept yet.
    pub fn is_stale(&self, now: Ms) -> bool {
        self.state == EntryState::Notified && self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Where a notified entry goes when its confirmation loses the race for the last slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequeuePolicy {
    /// Back to position 1, ahead of everyone who joined later.
    Front,
    /// Back to the end of the line.
    Tail,
}

impl RequeuePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" | "head" => Some(RequeuePolicy::Front),
            "tail" | "back" => Some(RequeuePolicy::Tail),
            _ => None,
        }
    }
}

/// A primitive state transition. One transaction is an ordered list of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Reserved {
        reservation_id: Ulid,
        actor_id: ActorId,
    },
    Released {
        actor_id: ActorId,
    },
    Enqueued {
        entry_id: Ulid,
        actor_id: ActorId,
    },
    Notified {
        entry_id: Ulid,
        actor_id: ActorId,
        expires_at: Ms,
    },
    Requeued {
        entry_id: Ulid,
        actor_id: ActorId,
        policy: RequeuePolicy,
    },
    /// Moves a pending entry to a terminal state and closes the gap it leaves.
    Dequeued {
        entry_id: Ulid,
        actor_id: ActorId,
        outcome: EntryState,
    },
}

/// Full image of one resource, written by compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceImage {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub active: bool,
    pub created_at: Ms,
    pub reservations: Vec<Reservation>,
    pub waitlist: Vec<WaitlistEntry>,
}

/// WAL record format. A `Committed` record is one whole transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        created_at: Ms,
    },
    ResourceActivation {
        id: Ulid,
        active: bool,
    },
    Committed {
        resource_id: Ulid,
        at: Ms,
        changes: Vec<Change>,
    },
    ResourceRestored(ResourceImage),
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Waitlisted { position: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    /// Lost the race for the last slot; back in line at `position`.
    Requeued { position: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryOutcome {
    pub expired: Vec<ActorId>,
    pub promoted: Vec<ActorId>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub ledger: CapacityLedger,
}

/// Everything a client view needs about one resource, as of one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub resource: ResourceInfo,
    /// Actors holding a confirmed slot, in confirmation order.
    pub confirmed: Vec<ActorId>,
    /// Pending waitlist entries ordered by position.
    pub waitlist: Vec<WaitlistEntry>,
}

impl ResourceSnapshot {
    pub fn position_of(&self, actor_id: &str) -> Option<u32> {
        self.waitlist
            .iter()
            .find(|e| e.actor_id == actor_id)
            .map(|e| e.position)
    }

    pub fn is_confirmed(&self, actor_id: &str) -> bool {
        self.confirmed.iter().any(|a| a == actor_id)
    }
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Promoted,
    Confirmed,
    Expired,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Promoted => "promoted",
            NotificationKind::Confirmed => "confirmed",
            NotificationKind::Expired => "expired",
        }
    }
}

/// Sent after a transaction commits. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub resource_id: Ulid,
    pub actor_id: ActorId,
    pub entry_id: Ulid,
    pub event: NotificationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Ms>,
}

impl Notification {
    /// Receivers deduplicate on this. An entry can be promoted more than once
    /// (after a requeue), so the expiry distinguishes promotions.
    pub fn dedup_key(&self) -> String {
        match self.expires_at {
            Some(t) => format!("{}:{}:{t}", self.entry_id, self.event.as_str()),
            None => format!("{}:{}", self.entry_id, self.event.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(state: EntryState, expires_at: Option<Ms>) -> WaitlistEntry {
        WaitlistEntry {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            actor_id: "a".into(),
            position: 1,
            state,
            joined_at: 0,
            notified_at: expires_at.map(|t| t - DEFAULT_PROMOTION_WINDOW_MS),
            expires_at,
            closed_at: None,
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!EntryState::Waiting.is_terminal());
        assert!(!EntryState::Notified.is_terminal());
        assert!(EntryState::Expired.is_terminal());
        assert!(EntryState::Confirmed.is_terminal());
        assert!(EntryState::Withdrawn.is_terminal());
    }

    #[test]
    fn stale_only_when_notified_and_past_expiry() {
        assert!(entry(EntryState::Notified, Some(100)).is_stale(100));
        assert!(!entry(EntryState::Notified, Some(100)).is_stale(99));
        assert!(!entry(EntryState::Waiting, None).is_stale(1_000));
        // Already swept
        assert!(!entry(EntryState::Expired, Some(100)).is_stale(200));
    }

    #[test]
    fn requeue_policy_parse() {
        assert_eq!(RequeuePolicy::parse("front"), Some(RequeuePolicy::Front));
        assert_eq!(RequeuePolicy::parse(" TAIL "), Some(RequeuePolicy::Tail));
        assert_eq!(RequeuePolicy::parse("middle"), None);
    }

    #[test]
    fn notification_json_shape() {
        let n = Notification {
            resource_id: Ulid::new(),
            actor_id: "carol".into(),
            entry_id: Ulid::new(),
            event: NotificationKind::Promoted,
            expires_at: Some(42),
        };
        let v: serde_json::Value = serde_json::to_value(&n).unwrap();
        assert_eq!(v["event"], "promoted");
        assert_eq!(v["actor_id"], "carol");
        assert_eq!(v["expires_at"], 42);

        let expired = Notification {
            event: NotificationKind::Expired,
            expires_at: None,
            ..n
        };
        let v: serde_json::Value = serde_json::to_value(&expired).unwrap();
        assert!(v.get("expires_at").is_none());
    }

    #[test]
    fn dedup_key_distinguishes_repeat_promotions() {
        let entry_id = Ulid::new();
        let first = Notification {
            resource_id: Ulid::new(),
            actor_id: "a".into(),
            entry_id,
            event: NotificationKind::Promoted,
            expires_at: Some(1_000),
        };
        let second = Notification {
            expires_at: Some(2_000),
            ..first.clone()
        };
        assert_ne!(first.dedup_key(), second.dedup_key());
        assert_eq!(first.dedup_key(), first.clone().dedup_key());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::Committed {
            resource_id: Ulid::new(),
            at: 1_000,
            changes: vec![
                Change::Released { actor_id: "a".into() },
                Change::Notified {
                    entry_id: Ulid::new(),
                    actor_id: "b".into(),
                    expires_at: 1_000 + DEFAULT_PROMOTION_WINDOW_MS,
                },
            ],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
