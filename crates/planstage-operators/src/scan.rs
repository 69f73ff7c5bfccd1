//! Collection scan over every live record of a store.
//!
//! The scan snapshots the live locations on its first `work()` call and walks
//! them in slot order, optionally keeping only records that satisfy a
//! [`FieldPredicate`]. Locations invalidated before the scan reaches them are
//! dropped from the snapshot.

use std::collections::VecDeque;

use planstage_core::id::RecordRef;

use crate::predicate::{FieldPredicate, ResidualPredicate};
use crate::stats::{CommonStats, SpecificStats, StageStats};
use crate::traits::{Stage, StageContext, StageState};

pub struct CollectionScan {
    ctx: StageContext,
    filter: Option<FieldPredicate>,
    /// `None` until the first `work()` call.
    pending: Option<VecDeque<RecordRef>>,
    docs_examined: u64,
    common: CommonStats,
    yielded: bool,
}

impl CollectionScan {
    pub fn new(ctx: StageContext) -> Self {
        Self {
            ctx,
            filter: None,
            pending: None,
            docs_examined: 0,
            common: CommonStats::default(),
            yielded: false,
        }
    }

    pub fn with_filter(mut self, filter: FieldPredicate) -> Self {
        self.filter = Some(filter);
        self
    }

    fn step(&mut self) -> StageState {
        let store = &self.ctx.store;
        let pending = self
            .pending
            .get_or_insert_with(|| store.live_refs().into_iter().collect());

        let Some(loc) = pending.pop_front() else {
            return StageState::Exhausted;
        };

        if let Some(filter) = &self.filter {
            self.docs_examined += 1;
            // Invalidations are announced before the write, so a live
            // snapshot entry always resolves; a miss here means the record
            // went away without notice and is simply skipped.
            match self.ctx.store.fetch(loc) {
                Some(doc) if filter.matches(&doc) => {}
                _ => return StageState::NeedTime,
            }
        }

        match self.ctx.pool.borrow_mut().allocate(loc) {
            Ok(ticket) => StageState::Advanced(ticket),
            Err(e) => StageState::Failed(e.into()),
        }
    }
}

impl Stage for CollectionScan {
    fn name(&self) -> &'static str {
        "collection_scan"
    }

    fn work(&mut self) -> StageState {
        debug_assert!(!self.yielded, "work() called while yielded");
        let state = self.step();
        self.common.record(&state);
        state
    }

    fn is_exhausted(&self) -> bool {
        matches!(&self.pending, Some(p) if p.is_empty())
    }

    fn prepare_to_yield(&mut self) {
        self.common.yields += 1;
        self.yielded = true;
    }

    fn recover_from_yield(&mut self) {
        self.common.unyields += 1;
        self.yielded = false;
    }

    fn invalidate(&mut self, loc: RecordRef) {
        self.common.invalidates += 1;
        if let Some(pending) = &mut self.pending {
            pending.retain(|l| *l != loc);
        }
    }

    fn stats(&self) -> StageStats {
        let mut common = self.common.clone();
        common.exhausted = self.is_exhausted();
        StageStats::leaf(
            self.name(),
            common,
            SpecificStats::CollectionScan {
                docs_examined: self.docs_examined,
            },
        )
    }
}
