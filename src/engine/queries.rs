use ulid::Ulid;

use crate::model::*;

use super::{CapacityLedger, Engine, EngineError, SharedResourceState};

impl Engine {
    fn resource(&self, id: Ulid) -> Result<SharedResourceState, EngineError> {
        self.get_resource(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.resource(id)?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    /// All resources ordered by id.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let handles: Vec<SharedResourceState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for rs in handles {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn ledger(&self, id: Ulid) -> Result<CapacityLedger, EngineError> {
        let rs = self.resource(id)?;
        let guard = rs.read().await;
        Ok(guard.ledger())
    }

    /// Reservation rows in creation order. Released rows are the audit trail
    /// and only included on request.
    pub async fn reservations(
        &self,
        resource_id: Ulid,
        include_released: bool,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        Ok(guard
            .reservations
            .records()
            .iter()
            .filter(|r| include_released || r.is_active())
            .cloned()
            .collect())
    }

    /// Pending entries by position, followed by terminal ones in arrival
    /// order when `include_terminal` is set.
    pub async fn waitlist(
        &self,
        resource_id: Ulid,
        include_terminal: bool,
    ) -> Result<Vec<WaitlistEntry>, EngineError> {
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        let mut out: Vec<WaitlistEntry> =
            guard.waitlist.ordered().into_iter().cloned().collect();
        if include_terminal {
            out.extend(
                guard
                    .waitlist
                    .entries()
                    .iter()
                    .filter(|e| e.state.is_terminal())
                    .cloned(),
            );
        }
        Ok(out)
    }

    pub async fn snapshot(&self, resource_id: Ulid) -> Result<ResourceSnapshot, EngineError> {
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        Ok(guard.snapshot())
    }

    pub async fn waitlist_position(
        &self,
        resource_id: Ulid,
        actor_id: &str,
    ) -> Result<Option<u32>, EngineError> {
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        Ok(guard.waitlist.get(actor_id).map(|e| e.position))
    }
}
