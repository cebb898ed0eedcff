use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{CONFIRMATIONS_TOTAL, JOINS_TOTAL};

use super::conflict::{check_active, check_not_enrolled, check_queue_room, validate_actor};
use super::promotion::record_cascade;
use super::{Engine, EngineError, ResourceState, Tx, WalCommand};

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(EngineError::InvalidCapacity(capacity));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }

        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let created_at = self.now();
        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            capacity,
            created_at,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, capacity, created_at);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        tracing::info!("created resource {id} with capacity {capacity}");
        Ok(())
    }

    /// Inactive resources refuse new joins and waitlist entries. Existing
    /// holders can still leave and notified actors can still confirm.
    pub async fn set_resource_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let mut guard = self.lock_resource(id).await?;
        if guard.active == active {
            return Ok(());
        }
        let event = Event::ResourceActivation { id, active };
        self.wal_append(&event).await?;
        guard.active = active;
        tracing::info!("resource {id} active={active}");
        Ok(())
    }

    /// Take a slot if one is open, otherwise queue at the tail. A full
    /// resource is not an error.
    ///
    /// An open slot is taken even while a notified actor holds an offer for
    /// it. The offer window guarantees the right to try, not the slot: if
    /// this join fills the last slot, that actor's confirm is requeued.
    pub async fn join(&self, resource_id: Ulid, actor_id: &str) -> Result<JoinOutcome, EngineError> {
        validate_actor(actor_id)?;
        let mut guard = self.lock_resource(resource_id).await?;
        check_active(&guard)?;
        check_not_enrolled(&guard, actor_id)?;

        let mut tx = Tx::begin(&mut guard, self.now());
        let outcome = if tx.work.ledger().available() > 0 {
            tx.apply(Change::Reserved {
                reservation_id: Ulid::new(),
                actor_id: actor_id.to_string(),
            });
            JoinOutcome::Joined
        } else {
            check_queue_room(&*tx.work)?;
            tx.apply(Change::Enqueued {
                entry_id: Ulid::new(),
                actor_id: actor_id.to_string(),
            });
            JoinOutcome::Waitlisted {
                position: tx.work.waitlist.len(),
            }
        };
        self.commit(tx).await?;

        let label = match outcome {
            JoinOutcome::Joined => "joined",
            JoinOutcome::Waitlisted { .. } => "waitlisted",
        };
        metrics::counter!(JOINS_TOTAL, "outcome" => label).increment(1);
        Ok(outcome)
    }

    /// Release the actor's slot, then sweep and promote in the same
    /// transaction. Returns what the cascade did.
    pub async fn leave(
        &self,
        resource_id: Ulid,
        actor_id: &str,
    ) -> Result<ExpiryOutcome, EngineError> {
        validate_actor(actor_id)?;
        let mut guard = self.lock_resource(resource_id).await?;
        if !guard.reservations.holds(actor_id) {
            return Err(EngineError::NotReserved(actor_id.to_string()));
        }

        let mut tx = Tx::begin(&mut guard, self.now());
        tx.apply(Change::Released {
            actor_id: actor_id.to_string(),
        });
        let cascade = tx.expire_and_promote(self.settings.promotion_window_ms);
        self.commit(tx).await?;

        record_cascade(resource_id, &cascade.expired, &cascade.promoted);
        Ok(cascade)
    }

    /// Queue explicitly. Refused while slots are open. Returns the position.
    pub async fn join_waitlist(&self, resource_id: Ulid, actor_id: &str) -> Result<u32, EngineError> {
        validate_actor(actor_id)?;
        let mut guard = self.lock_resource(resource_id).await?;
        check_active(&guard)?;
        check_not_enrolled(&guard, actor_id)?;
        let available = guard.ledger().available();
        if available > 0 {
            return Err(EngineError::SlotsAvailable(available));
        }
        check_queue_room(&guard)?;

        let mut tx = Tx::begin(&mut guard, self.now());
        tx.apply(Change::Enqueued {
            entry_id: Ulid::new(),
            actor_id: actor_id.to_string(),
        });
        let position = tx.work.waitlist.len();
        self.commit(tx).await?;

        metrics::counter!(JOINS_TOTAL, "outcome" => "waitlisted").increment(1);
        Ok(position)
    }

    /// Withdraw from the line. Everyone behind moves up one; a withdrawn
    /// offer is passed on to the next waiting actor.
    pub async fn leave_waitlist(
        &self,
        resource_id: Ulid,
        actor_id: &str,
    ) -> Result<ExpiryOutcome, EngineError> {
        validate_actor(actor_id)?;
        let mut guard = self.lock_resource(resource_id).await?;
        let entry_id = guard
            .waitlist
            .get(actor_id)
            .map(|e| e.id)
            .ok_or_else(|| EngineError::NotOnWaitlist(actor_id.to_string()))?;

        let mut tx = Tx::begin(&mut guard, self.now());
        tx.apply(Change::Dequeued {
            entry_id,
            actor_id: actor_id.to_string(),
            outcome: EntryState::Withdrawn,
        });
        // Only a withdrawn offer (or a stale one) frees anything to promote
        let cascade = tx.expire_and_promote(self.settings.promotion_window_ms);
        self.commit(tx).await?;

        record_cascade(resource_id, &cascade.expired, &cascade.promoted);
        Ok(cascade)
    }

    /// Turn an offer into a confirmed slot. If a concurrent join took the
    /// last slot first, the actor goes back into line per the requeue policy.
    pub async fn confirm_from_waitlist(
        &self,
        resource_id: Ulid,
        actor_id: &str,
    ) -> Result<ConfirmOutcome, EngineError> {
        validate_actor(actor_id)?;
        let mut guard = self.lock_resource(resource_id).await?;
        let now = self.now();

        let entry = guard
            .waitlist
            .get(actor_id)
            .ok_or_else(|| EngineError::NotOnWaitlist(actor_id.to_string()))?;
        if entry.state != EntryState::Notified {
            return Err(EngineError::NotNotified(actor_id.to_string()));
        }
        let entry_id = entry.id;
        if let Some(expired_at) = entry.expires_at
            && expired_at <= now
        {
            return Err(EngineError::NotificationExpired {
                actor_id: actor_id.to_string(),
                expired_at,
            });
        }

        let mut tx = Tx::begin(&mut guard, now);
        let outcome = if tx.work.ledger().available() > 0 {
            tx.apply(Change::Dequeued {
                entry_id,
                actor_id: actor_id.to_string(),
                outcome: EntryState::Confirmed,
            });
            tx.apply(Change::Reserved {
                reservation_id: Ulid::new(),
                actor_id: actor_id.to_string(),
            });
            ConfirmOutcome::Confirmed
        } else {
            let policy = self.settings.requeue;
            tx.apply(Change::Requeued {
                entry_id,
                actor_id: actor_id.to_string(),
                policy,
            });
            let position = tx
                .work
                .waitlist
                .get(actor_id)
                .map(|e| e.position)
                .unwrap_or(1);
            tracing::info!(
                "resource {resource_id}: {actor_id} lost the last slot, requeued at {position}"
            );
            ConfirmOutcome::Requeued { position }
        };
        self.commit(tx).await?;

        let label = match outcome {
            ConfirmOutcome::Confirmed => "confirmed",
            ConfirmOutcome::Requeued { .. } => "requeued",
        };
        metrics::counter!(CONFIRMATIONS_TOTAL, "outcome" => label).increment(1);
        Ok(outcome)
    }

    /// Rewrite the WAL as one image record per resource.
    ///
    /// Holds the catalog lock and every resource's read lock until the new
    /// file is in place: any commit that reached the writer first is already
    /// reflected in the images, and none can slip in between.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(rs) = self.get_resource(id) {
                guards.push(rs.read_owned().await);
            }
        }
        let events: Vec<Event> = guards
            .iter()
            .map(|g| Event::ResourceRestored(g.image()))
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
