//! Stage trait + common interfaces.
//!
//! The executor drives a tree of stages by calling `work()` on the root. Each
//! call does a bounded amount of work and reports what happened. Candidates
//! travel up the tree as pool tickets, never as documents.
//!
//! The protocol is single-threaded and cooperative: between two `work()` calls
//! the executor may yield, letting writers mutate storage. Writers announce
//! every location they are about to destroy through `invalidate`, and a stage
//! must never dereference a location after being told it is gone.

use std::rc::Rc;

use thiserror::Error;

use planstage_core::id::RecordRef;
use planstage_mem::{PoolError, PoolHandle, RecordStore, Ticket};

use crate::stats::StageStats;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("child {child} failed: {source}")]
    Child {
        child: usize,
        #[source]
        source: Box<StageError>,
    },

    #[error("candidate pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("predicate error: {0}")]
    Predicate(String),

    #[error("execution error: {0}")]
    Exec(String),
}

/// Outcome of a single `work()` call.
#[derive(Debug)]
pub enum StageState {
    /// A candidate is handed to the caller, who now owns the ticket.
    Advanced(Ticket),
    /// Progress was made but there is nothing to return yet.
    NeedTime,
    /// No further results; the stage stays exhausted.
    Exhausted,
    /// Unrecoverable failure. The stage holds no tickets afterwards.
    Failed(StageError),
}

impl StageState {
    pub fn is_advanced(&self) -> bool {
        matches!(self, StageState::Advanced(_))
    }
}

/// Shared collaborators every stage needs: the candidate pool and the store
/// used to materialize candidates.
#[derive(Clone)]
pub struct StageContext {
    pub pool: PoolHandle,
    pub store: Rc<dyn RecordStore>,
}

impl StageContext {
    pub fn new(pool: PoolHandle, store: Rc<dyn RecordStore>) -> Self {
        Self { pool, store }
    }

    /// Return `ticket` to the pool.
    pub fn release(&self, ticket: Ticket) -> Result<(), PoolError> {
        self.pool.borrow_mut().release(ticket)
    }
}

/// Trait that all stages must implement.
///
/// Invariants:
/// - A ticket returned through `Advanced` belongs to the caller; a stage keeps
///   no reference to it.
/// - Every ticket a stage allocates or receives and does not hand up must be
///   released, including when the stage is dropped mid-run.
/// - `invalidate` may be called in any state, between any two `work()` calls,
///   and also while yielded.
pub trait Stage {
    /// Human-readable stage name (stable).
    fn name(&self) -> &'static str;

    /// Perform one bounded unit of work.
    fn work(&mut self) -> StageState;

    fn is_exhausted(&self) -> bool;

    /// Release anything that is unsafe to hold while writers run.
    fn prepare_to_yield(&mut self);

    /// Reacquire what `prepare_to_yield` released.
    fn recover_from_yield(&mut self);

    /// `loc` is about to become invalid.
    fn invalidate(&mut self, loc: RecordRef);

    /// Execution counters for this stage and its children.
    fn stats(&self) -> StageStats;
}

pub type BoxedStage = Box<dyn Stage>;
