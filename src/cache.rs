//! Optimistic client-side view of resources.
//!
//! A caller predicts the effect of a mutation, shows it immediately, and
//! then settles against the server: success replaces the local view with
//! the server's snapshot, failure restores the snapshot captured before the
//! prediction. The prediction is never merged into anything.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prediction {
    Join(ActorId),
    Leave(ActorId),
    JoinWaitlist(ActorId),
    LeaveWaitlist(ActorId),
    Confirm(ActorId),
}

impl Prediction {
    /// Apply the expected outcome to a local copy. Best effort: the server
    /// response overwrites whatever this guessed.
    fn apply(&self, view: &mut ResourceSnapshot, now: Ms) {
        match self {
            Prediction::Join(actor) => {
                if view.resource.ledger.available() > 0 {
                    add_confirmed(view, actor);
                } else {
                    push_entry(view, actor, now);
                }
            }
            Prediction::Leave(actor) => {
                let before = view.confirmed.len();
                view.confirmed.retain(|a| a != actor);
                if view.confirmed.len() < before {
                    view.resource.ledger.confirmed =
                        view.resource.ledger.confirmed.saturating_sub(1);
                }
            }
            Prediction::JoinWaitlist(actor) => push_entry(view, actor, now),
            Prediction::LeaveWaitlist(actor) => {
                remove_entry(view, actor);
            }
            Prediction::Confirm(actor) => {
                if remove_entry(view, actor) {
                    add_confirmed(view, actor);
                }
            }
        }
    }
}

fn add_confirmed(view: &mut ResourceSnapshot, actor: &str) {
    view.confirmed.push(actor.to_string());
    view.resource.ledger.confirmed += 1;
}

fn push_entry(view: &mut ResourceSnapshot, actor: &str, now: Ms) {
    view.waitlist.push(WaitlistEntry {
        id: Ulid::new(),
        resource_id: view.resource.id,
        actor_id: actor.to_string(),
        position: view.waitlist.len() as u32 + 1,
        state: EntryState::Waiting,
        joined_at: now,
        notified_at: None,
        expires_at: None,
        closed_at: None,
    });
    view.resource.ledger.waiting += 1;
}

fn remove_entry(view: &mut ResourceSnapshot, actor: &str) -> bool {
    let Some(idx) = view.waitlist.iter().position(|e| e.actor_id == actor) else {
        return false;
    };
    let removed = view.waitlist.remove(idx);
    let ledger = &mut view.resource.ledger;
    match removed.state {
        EntryState::Notified => ledger.notified = ledger.notified.saturating_sub(1),
        _ => ledger.waiting = ledger.waiting.saturating_sub(1),
    }
    for e in &mut view.waitlist {
        if e.position > removed.position {
            e.position -= 1;
        }
    }
    true
}

#[derive(Debug)]
pub enum CacheError {
    UnknownResource(Ulid),
    /// One prediction per resource at a time.
    MutationInFlight(Ulid),
    /// The ticket does not match the pending mutation.
    StaleTicket(Ulid),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::UnknownResource(id) => write!(f, "resource {id} is not cached"),
            CacheError::MutationInFlight(id) => {
                write!(f, "a mutation on resource {id} is still in flight")
            }
            CacheError::StaleTicket(id) => write!(f, "stale ticket for resource {id}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Handle for one pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    resource_id: Ulid,
    seq: u64,
}

impl Ticket {
    pub fn resource_id(&self) -> Ulid {
        self.resource_id
    }
}

struct Pending {
    seq: u64,
    /// The view exactly as it was before the prediction.
    before: ResourceSnapshot,
}

struct CacheSlot {
    view: ResourceSnapshot,
    pending: Option<Pending>,
}

pub struct ClientCacheReconciler {
    slots: DashMap<Ulid, CacheSlot>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for ClientCacheReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCacheReconciler {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            seq: AtomicU64::new(0),
            clock,
        }
    }

    /// Seed or refresh a view from the server.
    pub fn load(&self, snapshot: ResourceSnapshot) -> Result<(), CacheError> {
        let id = snapshot.resource.id;
        if let Some(mut slot) = self.slots.get_mut(&id) {
            if slot.pending.is_some() {
                return Err(CacheError::MutationInFlight(id));
            }
            slot.view = snapshot;
            return Ok(());
        }
        self.slots.insert(
            id,
            CacheSlot {
                view: snapshot,
                pending: None,
            },
        );
        Ok(())
    }

    /// What the caller should render right now.
    pub fn view(&self, resource_id: Ulid) -> Option<ResourceSnapshot> {
        self.slots.get(&resource_id).map(|s| s.view.clone())
    }

    pub fn is_pending(&self, resource_id: Ulid) -> bool {
        self.slots
            .get(&resource_id)
            .is_some_and(|s| s.pending.is_some())
    }

    /// Capture the current view and apply the prediction on top.
    pub fn begin(&self, resource_id: Ulid, prediction: &Prediction) -> Result<Ticket, CacheError> {
        let mut slot = self
            .slots
            .get_mut(&resource_id)
            .ok_or(CacheError::UnknownResource(resource_id))?;
        if slot.pending.is_some() {
            return Err(CacheError::MutationInFlight(resource_id));
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let before = slot.view.clone();
        prediction.apply(&mut slot.view, self.clock.now());
        slot.pending = Some(Pending { seq, before });
        Ok(Ticket { resource_id, seq })
    }

    /// Server accepted: its snapshot becomes the view.
    pub fn settle_ok(&self, ticket: Ticket, server: ResourceSnapshot) -> Result<(), CacheError> {
        let mut slot = self.pending_slot(ticket)?;
        slot.view = server;
        slot.pending = None;
        Ok(())
    }

    /// Server refused: put back exactly what was there before.
    pub fn settle_err(&self, ticket: Ticket) -> Result<(), CacheError> {
        let mut slot = self.pending_slot(ticket)?;
        if let Some(pending) = slot.pending.take() {
            slot.view = pending.before;
        }
        Ok(())
    }

    fn pending_slot(
        &self,
        ticket: Ticket,
    ) -> Result<dashmap::mapref::one::RefMut<'_, Ulid, CacheSlot>, CacheError> {
        let slot = self
            .slots
            .get_mut(&ticket.resource_id)
            .ok_or(CacheError::UnknownResource(ticket.resource_id))?;
        if slot.pending.as_ref().map(|p| p.seq) != Some(ticket.seq) {
            return Err(CacheError::StaleTicket(ticket.resource_id));
        }
        Ok(slot)
    }

    /// Predict, await the server, settle. Returns the server's result once
    /// the view reflects it.
    pub async fn run<F, E>(
        &self,
        resource_id: Ulid,
        prediction: Prediction,
        server: F,
    ) -> Result<Result<ResourceSnapshot, E>, CacheError>
    where
        F: Future<Output = Result<ResourceSnapshot, E>>,
    {
        let ticket = self.begin(resource_id, &prediction)?;
        let result = server.await;
        match &result {
            Ok(snapshot) => self.settle_ok(ticket, snapshot.clone())?,
            Err(_) => self.settle_err(ticket)?,
        }
        Ok(result)
    }
}
