use ulid::Ulid;

use crate::model::*;

use super::ledger::CapacityLedger;
use super::reservations::{ReservationStore, StoreCheckpoint};
use super::waitlist::{QueueCheckpoint, WaitlistQueue};

/// The aggregate a resource lock protects: its capacity plus both row sets.
#[derive(Debug)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    /// Inactive resources accept no new joins or waitlist entries.
    pub active: bool,
    pub created_at: Ms,
    pub reservations: ReservationStore,
    pub waitlist: WaitlistQueue,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, capacity: u32, created_at: Ms) -> Self {
        Self {
            id,
            name,
            capacity,
            active: true,
            created_at,
            reservations: ReservationStore::default(),
            waitlist: WaitlistQueue::default(),
        }
    }

    pub fn from_image(image: ResourceImage) -> Self {
        Self {
            id: image.id,
            name: image.name,
            capacity: image.capacity,
            active: image.active,
            created_at: image.created_at,
            reservations: ReservationStore::from_records(image.reservations),
            waitlist: WaitlistQueue::from_entries(image.waitlist),
        }
    }

    pub fn image(&self) -> ResourceImage {
        ResourceImage {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            active: self.active,
            created_at: self.created_at,
            reservations: self.reservations.records().to_vec(),
            waitlist: self.waitlist.entries().to_vec(),
        }
    }

    pub fn ledger(&self) -> CapacityLedger {
        CapacityLedger {
            capacity: self.capacity,
            confirmed: self.reservations.confirmed_count(),
            notified: self.waitlist.count(EntryState::Notified),
            waiting: self.waitlist.count(EntryState::Waiting),
        }
    }

    /// True if the actor has a confirmed slot or a pending waitlist entry.
    pub fn is_enrolled(&self, actor_id: &str) -> bool {
        self.reservations.holds(actor_id) || self.waitlist.get(actor_id).is_some()
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            active: self.active,
            ledger: self.ledger(),
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            resource: self.info(),
            confirmed: self
                .reservations
                .confirmed()
                .map(|r| r.actor_id.clone())
                .collect(),
            waitlist: self.waitlist.ordered().into_iter().cloned().collect(),
        }
    }

    /// Apply one primitive transition. Infallible: callers validate first,
    /// and replay only ever sees changes that were validated when written.
    pub fn apply(&mut self, change: &Change, at: Ms) {
        match change {
            Change::Reserved {
                reservation_id,
                actor_id,
            } => {
                self.reservations.confirm(Reservation {
                    id: *reservation_id,
                    resource_id: self.id,
                    actor_id: actor_id.clone(),
                    state: ReservationState::Confirmed,
                    confirmed_at: at,
                    released_at: None,
                });
            }
            Change::Released { actor_id } => {
                self.reservations.release(actor_id, at);
            }
            Change::Enqueued { entry_id, actor_id } => {
                self.waitlist.push_back(*entry_id, self.id, actor_id, at);
            }
            Change::Notified {
                actor_id,
                expires_at,
                ..
            } => {
                self.waitlist.notify(actor_id, at, *expires_at);
            }
            Change::Requeued {
                actor_id, policy, ..
            } => {
                self.waitlist.requeue(actor_id, *policy);
            }
            Change::Dequeued {
                actor_id, outcome, ..
            } => {
                self.waitlist.close(actor_id, *outcome, at);
            }
        }
    }

    /// Enough to undo any sequence of `apply` calls: the live rows only.
    pub(super) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            reservations: self.reservations.checkpoint(),
            waitlist: self.waitlist.checkpoint(),
        }
    }

    pub(super) fn restore(&mut self, checkpoint: Checkpoint) {
        self.reservations.restore(checkpoint.reservations);
        self.waitlist.restore(checkpoint.waitlist);
    }

    /// Every invariant the aggregate must hold between transactions.
    pub fn check_invariants(&self) -> Result<(), String> {
        let ledger = self.ledger();
        if !ledger.within_capacity() {
            return Err(format!(
                "over-booked: {} confirmed, capacity {}",
                ledger.confirmed, ledger.capacity
            ));
        }
        if !self.waitlist.is_contiguous() {
            return Err("waitlist positions are not contiguous".into());
        }
        if let Some(r) = self
            .reservations
            .confirmed()
            .find(|r| self.waitlist.get(&r.actor_id).is_some())
        {
            return Err(format!("{} is both confirmed and queued", r.actor_id));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(super) struct Checkpoint {
    reservations: StoreCheckpoint,
    waitlist: QueueCheckpoint,
}

/// Apply a non-create event to a resource (caller holds the lock).
pub(super) fn apply_event(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::ResourceActivation { active, .. } => rs.active = *active,
        Event::Committed { at, changes, .. } => {
            for change in changes {
                rs.apply(change, *at);
            }
        }
        // Creation and restore replace the whole aggregate at the map level
        Event::ResourceCreated { .. } | Event::ResourceRestored(_) => {}
    }
}
