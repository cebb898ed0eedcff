use ulid::Ulid;

use crate::model::{ActorId, Ms};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Actor already holds a slot or a place in line on this resource.
    AlreadyReserved(ActorId),
    NotReserved(ActorId),
    /// Caller tried to queue while slots are open; `join` instead.
    SlotsAvailable(u32),
    NotOnWaitlist(ActorId),
    NotNotified(ActorId),
    NotificationExpired {
        actor_id: ActorId,
        expired_at: Ms,
    },
    ResourceInactive(Ulid),
    /// Lock on the resource could not be taken within the retry budget.
    ConcurrentConflict(Ulid),
    InvalidCapacity(u32),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Only contention is worth retrying; everything else is a precondition failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrentConflict(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AlreadyReserved(actor) => {
                write!(f, "actor {actor} already holds a reservation or waitlist entry")
            }
            EngineError::NotReserved(actor) => write!(f, "actor {actor} holds no reservation"),
            EngineError::SlotsAvailable(n) => {
                write!(f, "{n} slot(s) available: join instead of waitlisting")
            }
            EngineError::NotOnWaitlist(actor) => write!(f, "actor {actor} is not on the waitlist"),
            EngineError::NotNotified(actor) => {
                write!(f, "actor {actor} has not been offered a slot")
            }
            EngineError::NotificationExpired {
                actor_id,
                expired_at,
            } => write!(f, "offer to {actor_id} expired at {expired_at}"),
            EngineError::ResourceInactive(id) => write!(f, "resource {id} is inactive"),
            EngineError::ConcurrentConflict(id) => {
                write!(f, "concurrent conflict on resource {id}, retry")
            }
            EngineError::InvalidCapacity(cap) => write!(f, "invalid capacity: {cap}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
