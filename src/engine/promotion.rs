use ulid::Ulid;

use crate::model::*;
use crate::observability::{EXPIRATIONS_TOTAL, PROMOTIONS_TOTAL};

use super::{Engine, EngineError, Tx};

impl Tx<'_> {
    /// Close every notification whose window has passed. Guarded by
    /// `Notified && expires_at <= at`, so running it twice is a no-op.
    pub fn expire_stale(&mut self) -> Vec<ActorId> {
        let stale: Vec<(Ulid, ActorId)> = self
            .work
            .waitlist
            .stale(self.at)
            .into_iter()
            .map(|e| (e.id, e.actor_id.clone()))
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for (entry_id, actor_id) in stale {
            self.apply(Change::Dequeued {
                entry_id,
                actor_id: actor_id.clone(),
                outcome: EntryState::Expired,
            });
            expired.push(actor_id);
        }
        expired
    }

    /// Offer open slots to the head of the line: one `Waiting` entry per
    /// slot not already offered to someone.
    pub fn promote_next(&mut self, window: Ms) -> Vec<ActorId> {
        let slots = self.work.ledger().promotable();
        if slots == 0 {
            return Vec::new();
        }
        let next: Vec<(Ulid, ActorId)> = self
            .work
            .waitlist
            .next_waiting(slots)
            .into_iter()
            .map(|e| (e.id, e.actor_id.clone()))
            .collect();

        // Saturates: settings built in code bypass the startup cap
        let expires_at = self.at.saturating_add(window);
        let mut promoted = Vec::with_capacity(next.len());
        for (entry_id, actor_id) in next {
            self.apply(Change::Notified {
                entry_id,
                actor_id: actor_id.clone(),
                expires_at,
            });
            promoted.push(actor_id);
        }
        promoted
    }

    /// Sweep then cascade, as run after every release.
    pub fn expire_and_promote(&mut self, window: Ms) -> ExpiryOutcome {
        let expired = self.expire_stale();
        let promoted = self.promote_next(window);
        ExpiryOutcome { expired, promoted }
    }
}

impl Engine {
    /// Notify the next waiting actors for any slot nobody has been offered.
    /// Returns who was promoted.
    pub async fn promote_next(&self, resource_id: Ulid) -> Result<Vec<ActorId>, EngineError> {
        let mut guard = self.lock_resource(resource_id).await?;
        let mut tx = Tx::begin(&mut guard, self.now());
        let promoted = tx.promote_next(self.settings.promotion_window_ms);
        self.commit(tx).await?;
        record_cascade(resource_id, &[], &promoted);
        Ok(promoted)
    }

    /// Expire this resource's stale notifications and promote into the
    /// slots they free.
    pub async fn expire_notifications(
        &self,
        resource_id: Ulid,
    ) -> Result<ExpiryOutcome, EngineError> {
        let mut guard = self.lock_resource(resource_id).await?;
        let mut tx = Tx::begin(&mut guard, self.now());
        let outcome = tx.expire_and_promote(self.settings.promotion_window_ms);
        self.commit(tx).await?;
        record_cascade(resource_id, &outcome.expired, &outcome.promoted);
        Ok(outcome)
    }

    /// Resources the scheduler should visit: a notification is past its
    /// window, or a slot is open with nobody offered it. Reads without
    /// waiting; a resource locked right now is picked up next time.
    pub fn resources_needing_sweep(&self, now: Ms) -> Vec<Ulid> {
        let mut due = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                let ledger = guard.ledger();
                let unoffered = ledger.promotable() > 0 && ledger.waiting > 0;
                if unoffered || !guard.waitlist.stale(now).is_empty() {
                    due.push(guard.id);
                }
            }
        }
        due.sort();
        due
    }
}

pub(super) fn record_cascade(resource_id: Ulid, expired: &[ActorId], promoted: &[ActorId]) {
    if !expired.is_empty() {
        metrics::counter!(EXPIRATIONS_TOTAL).increment(expired.len() as u64);
        tracing::info!("resource {resource_id}: expired offers to {expired:?}");
    }
    if !promoted.is_empty() {
        metrics::counter!(PROMOTIONS_TOTAL).increment(promoted.len() as u64);
        tracing::info!("resource {resource_id}: promoted {promoted:?}");
    }
}
