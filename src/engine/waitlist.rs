use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// Ordered waitlist for one resource.
///
/// Pending entries (`Waiting` or `Notified`) always hold positions exactly
/// `1..=len()`. Every mutation that removes or moves a pending entry shifts
/// the neighbours it displaces in the same call, so there is no state in
/// which the transition has happened but the reindex has not.
///
/// Terminal entries stay in `entries` for audit and keep the last position
/// they held; `pending` indexes only the live ones.
#[derive(Debug, Clone, Default)]
pub struct WaitlistQueue {
    entries: Vec<WaitlistEntry>,
    pending: HashMap<ActorId, usize>,
}

impl WaitlistQueue {
    pub fn from_entries(entries: Vec<WaitlistEntry>) -> Self {
        let pending = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_pending())
            .map(|(i, e)| (e.actor_id.clone(), i))
            .collect();
        Self { entries, pending }
    }

    /// Number of pending entries.
    pub fn len(&self) -> u32 {
        self.pending.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The actor's pending entry, if any.
    pub fn get(&self, actor_id: &str) -> Option<&WaitlistEntry> {
        self.pending.get(actor_id).map(|&i| &self.entries[i])
    }

    /// Every entry ever queued, terminal ones included, in arrival order.
    pub fn entries(&self) -> &[WaitlistEntry] {
        &self.entries
    }

    /// Pending entries sorted by position.
    pub fn ordered(&self) -> Vec<&WaitlistEntry> {
        let mut live: Vec<&WaitlistEntry> =
            self.pending.values().map(|&i| &self.entries[i]).collect();
        live.sort_by_key(|e| e.position);
        live
    }

    pub fn count(&self, state: EntryState) -> u32 {
        self.pending
            .values()
            .filter(|&&i| self.entries[i].state == state)
            .count() as u32
    }

    /// Append at the tail. Returns the new position, or `None` if the actor
    /// already has a pending entry.
    pub fn push_back(
        &mut self,
        id: Ulid,
        resource_id: Ulid,
        actor_id: &str,
        at: Ms,
    ) -> Option<u32> {
        if self.pending.contains_key(actor_id) {
            return None;
        }
        let position = self.len() + 1;
        self.pending.insert(actor_id.to_string(), self.entries.len());
        self.entries.push(WaitlistEntry {
            id,
            resource_id,
            actor_id: actor_id.to_string(),
            position,
            state: EntryState::Waiting,
            joined_at: at,
            notified_at: None,
            expires_at: None,
            closed_at: None,
        });
        Some(position)
    }

    /// `Waiting` → `Notified`. No-op (false) for any other state.
    pub fn notify(&mut self, actor_id: &str, at: Ms, expires_at: Ms) -> bool {
        let Some(&idx) = self.pending.get(actor_id) else {
            return false;
        };
        let entry = &mut self.entries[idx];
        if entry.state != EntryState::Waiting {
            return false;
        }
        entry.state = EntryState::Notified;
        entry.notified_at = Some(at);
        entry.expires_at = Some(expires_at);
        true
    }

    /// Move a pending entry to a terminal state and close the gap behind it.
    pub fn close(&mut self, actor_id: &str, outcome: EntryState, at: Ms) -> Option<&WaitlistEntry> {
        debug_assert!(outcome.is_terminal(), "close() needs a terminal state");
        let idx = self.pending.remove(actor_id)?;
        let entry = &mut self.entries[idx];
        entry.state = outcome;
        entry.closed_at = Some(at);
        let vacated = entry.position;
        self.shift(|p| p > vacated, -1);
        Some(&self.entries[idx])
    }

    /// Put a pending entry back to `Waiting` at the front or the tail.
    /// Returns its new position.
    pub fn requeue(&mut self, actor_id: &str, policy: RequeuePolicy) -> Option<u32> {
        let &idx = self.pending.get(actor_id)?;
        let from = self.entries[idx].position;
        let to = match policy {
            RequeuePolicy::Front => 1,
            RequeuePolicy::Tail => self.len(),
        };
        if to < from {
            self.shift(|p| p >= to && p < from, 1);
        } else if to > from {
            self.shift(|p| p > from && p <= to, -1);
        }
        let entry = &mut self.entries[idx];
        entry.position = to;
        entry.state = EntryState::Waiting;
        entry.notified_at = None;
        entry.expires_at = None;
        Some(to)
    }

    /// Lowest-position `Waiting` entries, at most `n`.
    pub fn next_waiting(&self, n: u32) -> Vec<&WaitlistEntry> {
        self.ordered()
            .into_iter()
            .filter(|e| e.state == EntryState::Waiting)
            .take(n as usize)
            .collect()
    }

    /// `Notified` entries whose window closed at or before `now`.
    pub fn stale(&self, now: Ms) -> Vec<&WaitlistEntry> {
        self.ordered()
            .into_iter()
            .filter(|e| e.is_stale(now))
            .collect()
    }

    pub fn is_contiguous(&self) -> bool {
        self.ordered()
            .iter()
            .enumerate()
            .all(|(i, e)| e.position == i as u32 + 1)
    }

    /// Save the pending rows and the row count. Terminal rows are never
    /// touched again, so this is all `restore` needs.
    pub(super) fn checkpoint(&self) -> QueueCheckpoint {
        QueueCheckpoint {
            len: self.entries.len(),
            pending: self.pending.clone(),
            rows: self
                .pending
                .values()
                .map(|&i| (i, self.entries[i].clone()))
                .collect(),
        }
    }

    pub(super) fn restore(&mut self, checkpoint: QueueCheckpoint) {
        self.entries.truncate(checkpoint.len);
        for (i, row) in checkpoint.rows {
            self.entries[i] = row;
        }
        self.pending = checkpoint.pending;
    }

    fn shift(&mut self, in_range: impl Fn(u32) -> bool, delta: i64) {
        for &idx in self.pending.values() {
            let entry = &mut self.entries[idx];
            if in_range(entry.position) {
                entry.position = (entry.position as i64 + delta) as u32;
            }
        }
    }
}

#[derive(Debug)]
pub(super) struct QueueCheckpoint {
    len: usize,
    pending: HashMap<ActorId, usize>,
    rows: Vec<(usize, WaitlistEntry)>,
}
