use planstage_core::id::RecordRef;
use thiserror::Error;

use crate::pool::Ticket;

/// Result type local to planstage-mem.
pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("candidate pool capacity exceeded: {live} live tickets, capacity {capacity}")]
    CapacityExceeded { capacity: usize, live: usize },

    #[error("stale or released ticket {0}")]
    StaleTicket(Ticket),

    #[error("record {0} is no longer reachable")]
    RecordMissing(RecordRef),

    #[error("ticket {0} has neither a location nor a document")]
    NotMaterialized(Ticket),
}
