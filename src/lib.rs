//! slotline: capacity-bounded reservations with an ordered waitlist,
//! served over the PostgreSQL wire protocol.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod sql;
pub mod tenant;
pub mod wal;
pub mod wire;
