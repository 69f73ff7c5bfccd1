#![forbid(unsafe_code)]
//! planstage-operators: pull-based execution stages.
//!
//! Design intent:
//! - Stages are synchronous and single-threaded; the executor drives them one
//!   bounded `work()` call at a time and may yield between calls.
//! - Candidates move up the tree as tickets into the shared candidate pool
//!   (`planstage-mem`). A ticket not handed up must be released.
//! - Writers announce destroyed locations through `Stage::invalidate`; stages
//!   never trust a location across a yield otherwise.

pub mod predicate;
pub mod stats;
pub mod traits;

pub mod and_hash;
pub mod queued;
pub mod scan;

pub use and_hash::AndHashStage;
pub use predicate::{CmpOp, FieldPredicate, ResidualPredicate};
pub use queued::{QueuedStage, QueuedStep};
pub use scan::CollectionScan;
pub use stats::{AndHashStats, CommonStats, SpecificStats, StageStats};
pub use traits::{BoxedStage, Stage, StageContext, StageError, StageState};
