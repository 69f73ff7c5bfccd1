//! Hash-based AND: intersects the outputs of N >= 2 children.
//!
//! The first child is read to exhaustion into a membership map keyed by
//! record location. Every later child is then probed against that map; after
//! each child's round, entries the child did not produce are dropped. The
//! survivors are emitted one per `work()` call. Input does not need to be
//! sorted, but nothing is returned before every child has been read, and
//! only locations produced by the first child can ever be returned, so the
//! most selective child should come first.
//!
//! A location held by the stage can be invalidated at any time. Its
//! candidate can then no longer be verified through hashing, so the document
//! is captured into the pool, the ticket is flagged for review and handed to
//! the caller, and the location is forgotten.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use planstage_core::id::RecordRef;
use planstage_mem::{PoolError, Ticket};

use crate::predicate::ResidualPredicate;
use crate::stats::{AndHashStats, CommonStats, SpecificStats, StageStats};
use crate::traits::{BoxedStage, Stage, StageContext, StageError, StageState};

/// Position over the final membership map's keys, in map iteration order.
///
/// Keys are snapshotted rather than borrowed so the map can still shrink
/// (emission, invalidation) while the cursor is live.
struct ResultCursor {
    order: Vec<RecordRef>,
    pos: usize,
}

impl ResultCursor {
    fn current(&self) -> Option<RecordRef> {
        self.order.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

enum Phase {
    /// Reading child 0 into the membership map.
    Building,
    /// Probing child `child` (>= 1); `seen` holds map keys it produced.
    Probing {
        child: usize,
        seen: HashSet<RecordRef>,
    },
    Emitting(ResultCursor),
    Done,
}

pub struct AndHashStage {
    ctx: StageContext,
    children: Vec<BoxedStage>,
    predicate: Option<Box<dyn ResidualPredicate>>,
    /// Built from child 0, pruned after every later child.
    members: HashMap<RecordRef, Ticket>,
    /// Invalidated candidates waiting to be handed to the caller.
    flagged: VecDeque<Ticket>,
    phase: Phase,
    common: CommonStats,
    specific: AndHashStats,
}

impl AndHashStage {
    /// Panics if fewer than two children are given.
    pub fn new(ctx: StageContext, children: Vec<BoxedStage>) -> Self {
        assert!(
            children.len() >= 2,
            "hash AND needs at least two children, got {}",
            children.len()
        );
        Self {
            ctx,
            children,
            predicate: None,
            members: HashMap::new(),
            flagged: VecDeque::new(),
            phase: Phase::Building,
            common: CommonStats::default(),
            specific: AndHashStats::default(),
        }
    }

    /// Like [`AndHashStage::new`], for plans assembled at runtime.
    pub fn try_new(ctx: StageContext, children: Vec<BoxedStage>) -> Result<Self, StageError> {
        if children.len() < 2 {
            return Err(StageError::Precondition(format!(
                "hash AND needs at least two children, got {}",
                children.len()
            )));
        }
        Ok(Self::new(ctx, children))
    }

    /// Survivors must also satisfy `predicate`. Flagged candidates bypass it
    /// and are re-checked downstream.
    pub fn with_predicate(mut self, predicate: impl ResidualPredicate + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    fn step(&mut self) -> StageState {
        if let Some(ticket) = self.flagged.pop_front() {
            return StageState::Advanced(ticket);
        }

        match self.phase {
            Phase::Building => self.read_first_child(),
            Phase::Probing { child, .. } => self.probe_child(child),
            Phase::Emitting(_) => self.emit_next(),
            Phase::Done => StageState::Exhausted,
        }
    }

    fn read_first_child(&mut self) -> StageState {
        match self.children[0].work() {
            StageState::Advanced(ticket) => {
                let loc = self.ctx.pool.borrow().location(ticket);
                let loc = match loc {
                    Ok(loc) => loc,
                    Err(e) => return self.fail(e.into()),
                };
                let Some(loc) = loc else {
                    return self.pass_flagged(ticket);
                };

                match self.members.entry(loc) {
                    Entry::Vacant(slot) => {
                        slot.insert(ticket);
                    }
                    Entry::Occupied(_) => {
                        self.specific.duplicates_released += 1;
                        if let Err(e) = self.ctx.release(ticket) {
                            return self.fail(e.into());
                        }
                    }
                }
                StageState::NeedTime
            }
            StageState::Exhausted => {
                self.finish_round(0);
                StageState::NeedTime
            }
            StageState::NeedTime => StageState::NeedTime,
            StageState::Failed(e) => self.fail_child(0, e),
        }
    }

    fn probe_child(&mut self, child: usize) -> StageState {
        match self.children[child].work() {
            StageState::Advanced(ticket) => {
                let loc = self.ctx.pool.borrow().location(ticket);
                let loc = match loc {
                    Ok(loc) => loc,
                    Err(e) => return self.fail(e.into()),
                };
                let Some(loc) = loc else {
                    return self.pass_flagged(ticket);
                };

                if let Phase::Probing { seen, .. } = &mut self.phase {
                    if self.members.contains_key(&loc) && !seen.insert(loc) {
                        self.specific.duplicates_released += 1;
                    }
                }

                // The map keeps child 0's ticket; this one is only evidence.
                if let Err(e) = self.ctx.release(ticket) {
                    return self.fail(e.into());
                }
                StageState::NeedTime
            }
            StageState::Exhausted => {
                if let Err(e) = self.prune_unseen() {
                    return self.fail(e.into());
                }
                self.finish_round(child);
                StageState::NeedTime
            }
            StageState::NeedTime => StageState::NeedTime,
            StageState::Failed(e) => self.fail_child(child, e),
        }
    }

    /// Drop every member the current child did not produce.
    fn prune_unseen(&mut self) -> Result<(), PoolError> {
        let Phase::Probing { seen, .. } = &mut self.phase else {
            return Ok(());
        };

        let mut dropped = Vec::new();
        self.members.retain(|loc, ticket| {
            let keep = seen.contains(loc);
            if !keep {
                dropped.push(*ticket);
            }
            keep
        });
        seen.clear();

        // These tickets are out of the map already, so release all of them
        // before reporting the first failure.
        let mut pool = self.ctx.pool.borrow_mut();
        let mut first_err = None;
        for ticket in dropped {
            if let Err(e) = pool.release(ticket) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Move past `child`, which just reported exhaustion.
    fn finish_round(&mut self, child: usize) {
        self.specific.map_after_child.push(self.members.len());
        let next = child + 1;

        #[cfg(feature = "tracing")]
        tracing::debug!(child, members = self.members.len(), "hash AND round finished");

        // Nothing can survive an empty map; skip the remaining children.
        if next < self.children.len() && !self.members.is_empty() {
            let seen = match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Probing { seen, .. } => seen,
                _ => HashSet::new(),
            };
            self.phase = Phase::Probing { child: next, seen };
        } else {
            let order = self.members.keys().copied().collect();
            self.phase = Phase::Emitting(ResultCursor { order, pos: 0 });
        }
    }

    fn emit_next(&mut self) -> StageState {
        let Phase::Emitting(cursor) = &mut self.phase else {
            return StageState::Exhausted;
        };
        let Some(loc) = cursor.current() else {
            self.phase = Phase::Done;
            return StageState::Exhausted;
        };
        cursor.advance();

        // Gone if it was invalidated after the cursor was built.
        let Some(ticket) = self.members.remove(&loc) else {
            return StageState::NeedTime;
        };

        match self.passes_predicate(ticket) {
            Ok(true) => StageState::Advanced(ticket),
            Ok(false) => {
                self.specific.predicate_rejected += 1;
                match self.ctx.release(ticket) {
                    Ok(()) => StageState::NeedTime,
                    Err(e) => self.fail(e.into()),
                }
            }
            Err(e) => {
                let _ = self.ctx.release(ticket);
                self.fail(e.into())
            }
        }
    }

    fn passes_predicate(&self, ticket: Ticket) -> Result<bool, PoolError> {
        let Some(predicate) = &self.predicate else {
            return Ok(true);
        };
        let mut pool = self.ctx.pool.borrow_mut();
        let doc = pool.fetch(ticket, &*self.ctx.store)?;
        Ok(predicate.matches(doc))
    }

    /// Hand an already-flagged child result straight to the caller.
    fn pass_flagged(&mut self, ticket: Ticket) -> StageState {
        let flagged = self.ctx.pool.borrow_mut().flag_for_review(ticket);
        if let Err(e) = flagged {
            return self.fail(e.into());
        }
        self.specific.flagged_but_passed += 1;
        StageState::Advanced(ticket)
    }

    fn fail_child(&mut self, child: usize, source: StageError) -> StageState {
        self.fail(StageError::Child {
            child,
            source: Box::new(source),
        })
    }

    /// Release everything held and stop for good.
    fn fail(&mut self, err: StageError) -> StageState {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %err, members = self.members.len(), "hash AND failed");

        self.release_held();
        self.phase = Phase::Done;
        StageState::Failed(err)
    }

    /// Best-effort release of every ticket the stage still owns.
    fn release_held(&mut self) {
        let Ok(mut pool) = self.ctx.pool.try_borrow_mut() else {
            return;
        };
        for (_, ticket) in self.members.drain() {
            let _ = pool.release(ticket);
        }
        for ticket in self.flagged.drain(..) {
            let _ = pool.release(ticket);
        }
    }

    /// Capture the member's document, flag it, and queue it for the caller.
    fn flag_invalidated(&mut self, loc: RecordRef, ticket: Ticket) -> Result<(), PoolError> {
        let mut pool = self.ctx.pool.borrow_mut();
        let captured = pool.materialize_full(ticket, &*self.ctx.store)?;
        pool.flag_for_review(ticket)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%loc, %ticket, captured, "hash AND member invalidated");
        #[cfg(not(feature = "tracing"))]
        let _ = (loc, captured);

        self.flagged.push_back(ticket);
        self.specific.flagged_in_progress += 1;
        Ok(())
    }
}

impl Stage for AndHashStage {
    fn name(&self) -> &'static str {
        "and_hash"
    }

    fn work(&mut self) -> StageState {
        let state = self.step();
        self.common.record(&state);
        state
    }

    fn is_exhausted(&self) -> bool {
        matches!(self.phase, Phase::Done) && self.flagged.is_empty()
    }

    fn prepare_to_yield(&mut self) {
        self.common.yields += 1;
        for child in &mut self.children {
            child.prepare_to_yield();
        }
    }

    fn recover_from_yield(&mut self) {
        self.common.unyields += 1;
        for child in &mut self.children {
            child.recover_from_yield();
        }
    }

    fn invalidate(&mut self, loc: RecordRef) {
        self.common.invalidates += 1;
        for child in &mut self.children {
            child.invalidate(loc);
        }

        match &mut self.phase {
            Phase::Probing { seen, .. } => {
                seen.remove(&loc);
            }
            Phase::Emitting(cursor) => {
                if cursor.current() == Some(loc) {
                    cursor.advance();
                }
            }
            Phase::Building | Phase::Done => {}
        }

        if let Some(ticket) = self.members.remove(&loc) {
            if let Err(_e) = self.flag_invalidated(loc, ticket) {
                // The ticket is stale; there is nothing left to surface.
                #[cfg(feature = "tracing")]
                tracing::warn!(%loc, error = %_e, "could not flag invalidated member");
            }
        }
    }

    fn stats(&self) -> StageStats {
        let mut common = self.common.clone();
        common.exhausted = self.is_exhausted();
        StageStats::leaf(
            self.name(),
            common,
            SpecificStats::AndHash(self.specific.clone()),
        )
        .with_children(self.children.iter().map(|c| c.stats()).collect())
    }
}

impl Drop for AndHashStage {
    fn drop(&mut self) {
        self.release_held();
    }
}
