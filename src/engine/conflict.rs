use std::time::Duration;

use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::observability::LOCK_CONFLICTS_TOTAL;

use super::{Engine, EngineError, ResourceState};

const BACKOFF_BASE: Duration = Duration::from_millis(5);

impl Engine {
    /// Take the resource's write lock, bounded by the configured timeout and
    /// retry budget. Exhaustion surfaces as `ConcurrentConflict`.
    pub(super) async fn lock_resource(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let attempts = self.settings.lock_retries.max(1);
        let mut backoff = BACKOFF_BASE;

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.settings.lock_timeout, rs.clone().write_owned()).await
            {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    metrics::counter!(LOCK_CONFLICTS_TOTAL).increment(1);
                    tracing::debug!("lock on {id} timed out (attempt {attempt}/{attempts})");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(EngineError::ConcurrentConflict(id))
    }
}

pub(crate) fn validate_actor(actor_id: &str) -> Result<(), EngineError> {
    if actor_id.is_empty() {
        return Err(EngineError::LimitExceeded("actor id is empty"));
    }
    if actor_id.len() > MAX_ACTOR_ID_LEN {
        return Err(EngineError::LimitExceeded("actor id too long"));
    }
    Ok(())
}

/// An actor may hold one confirmed slot or one place in line, never both.
pub(crate) fn check_not_enrolled(rs: &ResourceState, actor_id: &str) -> Result<(), EngineError> {
    if rs.is_enrolled(actor_id) {
        return Err(EngineError::AlreadyReserved(actor_id.to_string()));
    }
    Ok(())
}

pub(crate) fn check_active(rs: &ResourceState) -> Result<(), EngineError> {
    if !rs.active {
        return Err(EngineError::ResourceInactive(rs.id));
    }
    Ok(())
}

pub(crate) fn check_queue_room(rs: &ResourceState) -> Result<(), EngineError> {
    if rs.waitlist.len() >= MAX_WAITLIST_LEN {
        return Err(EngineError::LimitExceeded("waitlist full"));
    }
    Ok(())
}
