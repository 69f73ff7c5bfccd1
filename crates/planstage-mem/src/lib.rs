#![forbid(unsafe_code)]
//! planstage-mem: record storage interface and the candidate pool.
//!
//! Every candidate record flowing between stages is represented by a ticket
//! into the [`CandidatePool`]. Stages look records up through the
//! [`RecordStore`] trait; [`MemoryRecordStore`] is the in-memory arena used by
//! tests and embedded callers.

pub mod error;
pub mod pool;
pub mod store;

pub use error::{PoolError, Result};
pub use pool::{CandidatePool, Member, PoolHandle, Ticket};
pub use store::{MemoryRecordStore, RecordStore};
