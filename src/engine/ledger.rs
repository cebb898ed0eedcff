/// Derived view of a resource's occupancy. Never stored: always computed
/// from the reservation and waitlist rows under the resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityLedger {
    pub capacity: u32,
    /// Confirmed reservations.
    pub confirmed: u32,
    /// Outstanding offers (entries in `Notified`).
    pub notified: u32,
    /// Entries still in `Waiting`.
    pub waiting: u32,
}

impl CapacityLedger {
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.confirmed)
    }

    pub fn is_full(&self) -> bool {
        self.available() == 0
    }

    /// Open slots not already offered to someone.
    pub fn promotable(&self) -> u32 {
        self.available().saturating_sub(self.notified)
    }

    pub fn within_capacity(&self) -> bool {
        self.confirmed <= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(capacity: u32, confirmed: u32, notified: u32) -> CapacityLedger {
        CapacityLedger {
            capacity,
            confirmed,
            notified,
            waiting: 0,
        }
    }

    #[test]
    fn available_counts_open_slots() {
        assert_eq!(ledger(3, 1, 0).available(), 2);
        assert_eq!(ledger(3, 3, 0).available(), 0);
        assert!(ledger(3, 3, 0).is_full());
    }

    #[test]
    fn promotable_subtracts_outstanding_offers() {
        assert_eq!(ledger(3, 1, 1).promotable(), 1);
        assert_eq!(ledger(3, 1, 2).promotable(), 0);
        // A join can take a slot that was already offered
        assert_eq!(ledger(3, 3, 1).promotable(), 0);
    }

    #[test]
    fn within_capacity() {
        assert!(ledger(2, 2, 0).within_capacity());
        assert!(!ledger(2, 3, 0).within_capacity());
    }
}
