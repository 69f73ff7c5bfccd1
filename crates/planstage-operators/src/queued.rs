//! Scripted stage that replays a fixed sequence of outcomes.
//!
//! Useful for hand-built plans and for driving other stages through exact
//! interleavings in tests.

use std::collections::VecDeque;

use planstage_core::id::RecordRef;
use planstage_core::types::Document;

use crate::stats::{CommonStats, SpecificStats, StageStats};
use crate::traits::{Stage, StageContext, StageError, StageState};

#[derive(Debug, Clone)]
pub enum QueuedStep {
    /// Emit a candidate attached to a stored record.
    Record(RecordRef),
    /// Emit a flagged candidate with no location.
    Flagged(Document),
    NeedTime,
    Fail(String),
}

pub struct QueuedStage {
    ctx: StageContext,
    steps: VecDeque<QueuedStep>,
    common: CommonStats,
    yielded: bool,
}

impl QueuedStage {
    pub fn new(ctx: StageContext, steps: impl IntoIterator<Item = QueuedStep>) -> Self {
        Self {
            ctx,
            steps: steps.into_iter().collect(),
            common: CommonStats::default(),
            yielded: false,
        }
    }

    /// Emit each location once, in order.
    pub fn records(ctx: StageContext, locs: impl IntoIterator<Item = RecordRef>) -> Self {
        Self::new(ctx, locs.into_iter().map(QueuedStep::Record))
    }

    fn step(&mut self) -> StageState {
        let Some(step) = self.steps.pop_front() else {
            return StageState::Exhausted;
        };

        let mut pool = self.ctx.pool.borrow_mut();
        match step {
            QueuedStep::Record(loc) => match pool.allocate(loc) {
                Ok(ticket) => StageState::Advanced(ticket),
                Err(e) => StageState::Failed(e.into()),
            },
            QueuedStep::Flagged(doc) => {
                let ticket = match pool.allocate_owned(doc) {
                    Ok(t) => t,
                    Err(e) => return StageState::Failed(e.into()),
                };
                match pool.flag_for_review(ticket) {
                    Ok(()) => StageState::Advanced(ticket),
                    Err(e) => StageState::Failed(e.into()),
                }
            }
            QueuedStep::NeedTime => StageState::NeedTime,
            QueuedStep::Fail(msg) => StageState::Failed(StageError::Exec(msg)),
        }
    }
}

impl Stage for QueuedStage {
    fn name(&self) -> &'static str {
        "queued"
    }

    fn work(&mut self) -> StageState {
        debug_assert!(!self.yielded, "work() called while yielded");
        let state = self.step();
        self.common.record(&state);
        state
    }

    fn is_exhausted(&self) -> bool {
        self.steps.is_empty()
    }

    fn prepare_to_yield(&mut self) {
        self.common.yields += 1;
        self.yielded = true;
    }

    fn recover_from_yield(&mut self) {
        self.common.unyields += 1;
        self.yielded = false;
    }

    /// A deleted record is never emitted afterwards.
    fn invalidate(&mut self, loc: RecordRef) {
        self.common.invalidates += 1;
        self.steps
            .retain(|s| !matches!(s, QueuedStep::Record(l) if *l == loc));
    }

    fn stats(&self) -> StageStats {
        let mut common = self.common.clone();
        common.exhausted = self.is_exhausted();
        StageStats::leaf(
            self.name(),
            common,
            SpecificStats::Queued {
                remaining: self.steps.len(),
            },
        )
    }
}
