//! Hard caps that keep one tenant from exhausting memory or the log.

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_CAPACITY: u32 = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ACTOR_ID_LEN: usize = 128;
/// Pending (waiting + notified) entries per resource.
pub const MAX_WAITLIST_LEN: u32 = 10_000;
/// One year. Longer windows are refused at startup.
pub const MAX_PROMOTION_WINDOW_MS: i64 = 365 * 24 * 3_600_000;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
