use std::collections::HashMap;

use crate::model::*;

/// Reservation rows for one resource. Rows are only ever state-transitioned;
/// `active` indexes the single confirmed row each actor may hold.
#[derive(Debug, Clone, Default)]
pub struct ReservationStore {
    records: Vec<Reservation>,
    active: HashMap<ActorId, usize>,
}

impl ReservationStore {
    pub fn from_records(records: Vec<Reservation>) -> Self {
        let active = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_active())
            .map(|(i, r)| (r.actor_id.clone(), i))
            .collect();
        Self { records, active }
    }

    pub fn confirmed_count(&self) -> u32 {
        self.active.len() as u32
    }

    pub fn holds(&self, actor_id: &str) -> bool {
        self.active.contains_key(actor_id)
    }

    pub fn active_for(&self, actor_id: &str) -> Option<&Reservation> {
        self.active.get(actor_id).map(|&i| &self.records[i])
    }

    /// Record a new confirmed slot. Returns false if the actor already holds one.
    pub fn confirm(&mut self, reservation: Reservation) -> bool {
        if self.active.contains_key(&reservation.actor_id) {
            return false;
        }
        self.active
            .insert(reservation.actor_id.clone(), self.records.len());
        self.records.push(reservation);
        true
    }

    pub fn release(&mut self, actor_id: &str, at: Ms) -> Option<&Reservation> {
        let idx = self.active.remove(actor_id)?;
        let record = &mut self.records[idx];
        record.state = ReservationState::Released;
        record.released_at = Some(at);
        Some(&*record)
    }

    /// All rows, including released ones, in creation order.
    pub fn records(&self) -> &[Reservation] {
        &self.records
    }

    /// Confirmed rows in confirmation order. Walks the index, not the audit rows.
    pub fn confirmed(&self) -> impl Iterator<Item = &Reservation> {
        let mut idx: Vec<usize> = self.active.values().copied().collect();
        idx.sort_unstable();
        idx.into_iter().map(|i| &self.records[i])
    }

    /// Save the confirmed rows and the row count. Released rows are never
    /// touched again, so this is all `restore` needs.
    pub(super) fn checkpoint(&self) -> StoreCheckpoint {
        StoreCheckpoint {
            len: self.records.len(),
            active: self.active.clone(),
            rows: self
                .active
                .values()
                .map(|&i| (i, self.records[i].clone()))
                .collect(),
        }
    }

    pub(super) fn restore(&mut self, checkpoint: StoreCheckpoint) {
        self.records.truncate(checkpoint.len);
        for (i, row) in checkpoint.rows {
            self.records[i] = row;
        }
        self.active = checkpoint.active;
    }
}

#[derive(Debug)]
pub(super) struct StoreCheckpoint {
    len: usize,
    active: HashMap<ActorId, usize>,
    rows: Vec<(usize, Reservation)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn reservation(actor: &str, at: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::nil(),
            actor_id: actor.into(),
            state: ReservationState::Confirmed,
            confirmed_at: at,
            released_at: None,
        }
    }

    #[test]
    fn confirm_is_unique_per_actor() {
        let mut store = ReservationStore::default();
        assert!(store.confirm(reservation("a", 1)));
        assert!(!store.confirm(reservation("a", 2)));
        assert_eq!(store.confirmed_count(), 1);
    }

    #[test]
    fn release_keeps_audit_row() {
        let mut store = ReservationStore::default();
        store.confirm(reservation("a", 1));
        let released = store.release("a", 5).unwrap();
        assert_eq!(released.state, ReservationState::Released);
        assert_eq!(released.released_at, Some(5));

        assert_eq!(store.confirmed_count(), 0);
        assert_eq!(store.records().len(), 1);
        assert!(store.release("a", 6).is_none());
    }

    #[test]
    fn rejoin_after_release() {
        let mut store = ReservationStore::default();
        store.confirm(reservation("a", 1));
        store.release("a", 2);
        assert!(store.confirm(reservation("a", 3)));
        assert_eq!(store.records().len(), 2);
        assert_eq!(store.active_for("a").unwrap().confirmed_at, 3);
    }

    #[test]
    fn restore_undoes_release_and_confirm() {
        let mut store = ReservationStore::default();
        store.confirm(reservation("a", 1));
        store.confirm(reservation("b", 2));
        store.release("b", 3);
        let checkpoint = store.checkpoint();
        // Released rows stay out of the checkpoint
        assert_eq!(checkpoint.rows.len(), 1);

        store.release("a", 4);
        store.confirm(reservation("c", 5));
        store.confirm(reservation("b", 6));
        store.restore(checkpoint);

        assert!(store.holds("a"));
        assert!(!store.holds("b"));
        assert!(!store.holds("c"));
        assert_eq!(store.records().len(), 2);
        assert_eq!(store.active_for("a").unwrap().released_at, None);
        let order: Vec<_> = store.confirmed().map(|r| r.actor_id.as_str()).collect();
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn confirmed_keeps_confirmation_order() {
        let mut store = ReservationStore::default();
        for (i, a) in ["c", "a", "b"].iter().enumerate() {
            store.confirm(reservation(a, i as Ms));
        }
        store.release("a", 9);
        let order: Vec<_> = store.confirmed().map(|r| r.actor_id.as_str()).collect();
        assert_eq!(order, vec!["c", "b"]);
    }

    #[test]
    fn from_records_rebuilds_index() {
        let mut released = reservation("a", 1);
        released.state = ReservationState::Released;
        released.released_at = Some(2);
        let store = ReservationStore::from_records(vec![released, reservation("b", 3)]);
        assert!(!store.holds("a"));
        assert!(store.holds("b"));
        assert_eq!(store.confirmed().count(), 1);
    }
}
