//! Runtime: drive a stage tree, yield cooperatively, route writes.
//!
//! - `Engine` owns the record store and the candidate pool and hands out the
//!   `StageContext` stages are built with.
//! - `Executor` pulls results from a root stage. Every `yield_every_works`
//!   calls it yields: the tree releases yield-unsafe state, queued writes are
//!   applied (each destroyed location is announced through `invalidate`
//!   before the store forgets it), and the tree recovers.
//! - Results are returned as owned `ExecOutput`s; the executor releases the
//!   underlying tickets.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;

use planstage_core::config::ExecConfig;
use planstage_core::id::{RecordRef, RunId};
use planstage_core::types::Document;

use planstage_mem::{CandidatePool, MemoryRecordStore, PoolError, PoolHandle, Ticket};

use planstage_operators::stats::StageStats;
use planstage_operators::traits::{BoxedStage, Stage, StageContext, StageError, StageState};

use crate::metrics::emit_span;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid config: {0}")]
    Config(#[from] planstage_core::Error),
    #[error("stage failed: {0}")]
    Stage(#[from] StageError),
    #[error("candidate pool: {0}")]
    Pool(#[from] PoolError),
    #[error("work limit of {0} calls reached")]
    WorkLimit(u64),
    #[error("explain: {0}")]
    Explain(#[from] serde_json::Error),
}

/// A write waiting for the next yield point.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Remove the record; its location becomes invalid.
    Delete(RecordRef),
    /// Rewrite the record at a new location; the old one becomes invalid.
    Relocate(RecordRef, Document),
    /// Rewrite the record in place; its location stays valid.
    Update(RecordRef, Document),
}

/// One result handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecOutput {
    /// `None` for flagged results, whose location is gone or never existed.
    pub location: Option<RecordRef>,
    /// `None` only for flagged results whose record was lost before it could
    /// be captured.
    pub document: Option<Document>,
    /// Must be fully re-verified by the caller.
    pub flagged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: RunId,
    pub matched: Vec<ExecOutput>,
    pub flagged: Vec<ExecOutput>,
    pub works: u64,
    pub yields: u64,
    pub peak_candidates: usize,
}

/// Engine owns the record store and the candidate pool.
pub struct Engine {
    cfg: ExecConfig,
    store: Rc<MemoryRecordStore>,
    pool: PoolHandle,
    next_run: Cell<u64>,
}

impl Engine {
    pub fn new(cfg: ExecConfig) -> Result<Self, ExecError> {
        cfg.validate()?;
        let pool = CandidatePool::shared(cfg.pool_capacity);
        Ok(Self {
            cfg,
            store: Rc::new(MemoryRecordStore::new()),
            pool,
            next_run: Cell::new(0),
        })
    }

    /// Engine over an existing store.
    pub fn with_store(cfg: ExecConfig, store: Rc<MemoryRecordStore>) -> Result<Self, ExecError> {
        let mut engine = Self::new(cfg)?;
        engine.store = store;
        Ok(engine)
    }

    pub fn store(&self) -> Rc<MemoryRecordStore> {
        Rc::clone(&self.store)
    }

    pub fn pool(&self) -> PoolHandle {
        Rc::clone(&self.pool)
    }

    pub fn config(&self) -> &ExecConfig {
        &self.cfg
    }

    /// Context to build stages with.
    pub fn context(&self) -> StageContext {
        StageContext::new(Rc::clone(&self.pool), self.store.clone())
    }

    pub fn executor(&self, root: BoxedStage) -> Executor {
        let run = RunId::new(self.next_run.get());
        self.next_run.set(run.get() + 1);
        Executor {
            run,
            cfg: self.cfg.clone(),
            store: Rc::clone(&self.store),
            pool: Rc::clone(&self.pool),
            root,
            pending: VecDeque::new(),
            works: 0,
            yields: 0,
            since_yield: 0,
            finished: false,
        }
    }
}

pub struct Executor {
    run: RunId,
    cfg: ExecConfig,
    store: Rc<MemoryRecordStore>,
    pool: PoolHandle,
    root: BoxedStage,
    pending: VecDeque<Mutation>,
    works: u64,
    yields: u64,
    since_yield: usize,
    finished: bool,
}

impl Executor {
    /// Queue a write; it is applied at the next yield point.
    pub fn queue_write(&mut self, mutation: Mutation) {
        self.pending.push_back(mutation);
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    pub fn run_id(&self) -> RunId {
        self.run
    }

    pub fn works(&self) -> u64 {
        self.works
    }

    pub fn yields(&self) -> u64 {
        self.yields
    }

    /// Pull the next result. `Ok(None)` once the root is exhausted.
    pub fn next(&mut self) -> Result<Option<ExecOutput>, ExecError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            if let Some(max) = self.cfg.max_works {
                if self.works >= max {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(run = %self.run, max, "work limit reached");
                    self.retire_root();
                    self.finished = true;
                    return Err(ExecError::WorkLimit(max));
                }
            }
            if self.cfg.yield_every_works > 0 && self.since_yield >= self.cfg.yield_every_works {
                self.yield_now();
            }

            self.works += 1;
            self.since_yield += 1;
            match self.root.work() {
                StageState::Advanced(ticket) => return self.take_output(ticket).map(Some),
                StageState::NeedTime => continue,
                StageState::Exhausted => {
                    // Writers still waiting get their turn before the run ends.
                    if !self.pending.is_empty() {
                        self.yield_now();
                    }
                    self.finished = true;
                    return Ok(None);
                }
                StageState::Failed(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(run = %self.run, error = %e, works = self.works, "run failed");
                    self.finished = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Drain every result.
    pub fn run_to_completion(&mut self) -> Result<RunSummary, ExecError> {
        let mut matched = Vec::new();
        let mut flagged = Vec::new();
        while let Some(out) = self.next()? {
            if out.flagged {
                flagged.push(out);
            } else {
                matched.push(out);
            }
        }
        let summary = RunSummary {
            run: self.run,
            matched,
            flagged,
            works: self.works,
            yields: self.yields,
            peak_candidates: self.pool.borrow().peak_live(),
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            run = %summary.run,
            matched = summary.matched.len(),
            flagged = summary.flagged.len(),
            works = summary.works,
            yields = summary.yields,
            "run finished"
        );
        emit_span(
            "run_finished",
            &[
                ("run", summary.run.to_string()),
                ("works", summary.works.to_string()),
                ("peak_candidates", summary.peak_candidates.to_string()),
            ],
        );
        Ok(summary)
    }

    /// Yield now: let the tree drop yield-unsafe state, apply every queued
    /// write, then resume.
    pub fn yield_now(&mut self) {
        self.root.prepare_to_yield();

        #[cfg(feature = "tracing")]
        tracing::debug!(writes = self.pending.len(), works = self.works, "yield");

        while let Some(mutation) = self.pending.pop_front() {
            self.apply(mutation);
        }

        self.root.recover_from_yield();
        self.yields += 1;
        self.since_yield = 0;
    }

    /// Drop the root, releasing every ticket it holds, but keep its stats
    /// for `explain`.
    fn retire_root(&mut self) {
        let stats = self.root.stats();
        self.root = Box::new(RetiredRoot(stats));
    }

    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Delete(loc) => {
                if self.store.contains(loc) {
                    self.root.invalidate(loc);
                    self.store.delete(loc);
                }
            }
            Mutation::Relocate(loc, doc) => {
                if self.store.contains(loc) {
                    self.root.invalidate(loc);
                    self.store.relocate(loc, doc);
                }
            }
            Mutation::Update(loc, doc) => {
                self.store.update_in_place(loc, doc);
            }
        }
    }

    /// Convert a returned ticket into an owned result and release it.
    fn take_output(&mut self, ticket: Ticket) -> Result<ExecOutput, ExecError> {
        let mut pool = self.pool.borrow_mut();
        let flagged = pool.is_flagged(ticket)?;
        let location = pool.location(ticket)?;
        let document = if flagged {
            pool.document(ticket)?.cloned()
        } else {
            Some(pool.fetch(ticket, &*self.store)?.clone())
        };
        pool.release(ticket)?;
        Ok(ExecOutput {
            location: if flagged { None } else { location },
            document,
            flagged,
        })
    }

    /// Stats tree of the root stage, as JSON.
    pub fn explain(&self) -> Result<serde_json::Value, ExecError> {
        Ok(serde_json::to_value(self.root.stats())?)
    }
}

/// Stand-in for a root stage that was dropped before it finished.
struct RetiredRoot(StageStats);

impl Stage for RetiredRoot {
    fn name(&self) -> &'static str {
        "retired"
    }

    fn work(&mut self) -> StageState {
        StageState::Exhausted
    }

    fn is_exhausted(&self) -> bool {
        true
    }

    fn prepare_to_yield(&mut self) {}

    fn recover_from_yield(&mut self) {}

    fn invalidate(&mut self, _loc: RecordRef) {}

    fn stats(&self) -> StageStats {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use planstage_operators::{AndHashStage, CollectionScan, FieldPredicate, QueuedStage};

    use super::*;

    fn engine(cfg: ExecConfig) -> (Engine, Vec<RecordRef>) {
        let engine = Engine::new(cfg).unwrap();
        let store = engine.store();
        let locs = (0..10)
            .map(|n| store.insert(Document::new().with("n", n as i64).with("even", n % 2 == 0)))
            .collect();
        (engine, locs)
    }

    fn scan(engine: &Engine, expr: &str) -> BoxedStage {
        Box::new(CollectionScan::new(engine.context()).with_filter(FieldPredicate::parse(expr).unwrap()))
    }

    fn ns(outputs: &[ExecOutput]) -> Vec<i64> {
        let mut out: Vec<i64> = outputs
            .iter()
            .filter_map(|o| match o.document.as_ref()?.get("n") {
                Some(planstage_core::Scalar::I64(n)) => Some(*n),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn runs_and_of_two_scans() {
        let (engine, _) = engine(ExecConfig::default());
        let root = AndHashStage::new(
            engine.context(),
            vec![scan(&engine, "n >= 4"), scan(&engine, "even == true")],
        );
        let mut exec = engine.executor(Box::new(root));
        let summary = exec.run_to_completion().unwrap();

        assert_eq!(ns(&summary.matched), vec![4, 6, 8]);
        assert_eq!(summary.run, RunId::new(0));
        assert!(summary.flagged.is_empty());
        assert!(summary.matched.iter().all(|o| o.location.is_some()));
        assert_eq!(engine.pool().borrow().live_count(), 0);
        assert!(exec.next().unwrap().is_none());
    }

    #[test]
    fn yields_apply_queued_deletes_through_invalidation() {
        let cfg = ExecConfig {
            yield_every_works: 4,
            ..ExecConfig::default()
        };
        let (engine, locs) = engine(cfg);
        let root = AndHashStage::new(
            engine.context(),
            vec![
                Box::new(QueuedStage::records(engine.context(), locs[..6].to_vec())) as BoxedStage,
                scan(&engine, "n >= 2"),
            ],
        );
        let mut exec = engine.executor(Box::new(root));
        // Deleting n=1 lands while child 0 is still being read; the member
        // is captured and surfaced as flagged.
        exec.queue_write(Mutation::Delete(locs[1]));

        let summary = exec.run_to_completion().unwrap();
        assert_eq!(ns(&summary.matched), vec![2, 3, 4, 5]);
        assert_eq!(ns(&summary.flagged), vec![1]);
        assert!(summary.flagged[0].location.is_none());
        assert!(summary.yields >= 1);
        assert!(!engine.store().contains(locs[1]));
        assert_eq!(engine.pool().borrow().live_count(), 0);
    }

    #[test]
    fn writes_to_stale_locations_are_ignored() {
        let cfg = ExecConfig {
            yield_every_works: 1,
            ..ExecConfig::default()
        };
        let (engine, locs) = engine(cfg);
        engine.store().delete(locs[0]);
        let root = AndHashStage::new(
            engine.context(),
            vec![
                Box::new(QueuedStage::records(engine.context(), locs[1..3].to_vec())) as BoxedStage,
                Box::new(QueuedStage::records(engine.context(), locs[1..3].to_vec())),
            ],
        );
        let mut exec = engine.executor(Box::new(root));
        exec.queue_write(Mutation::Delete(locs[0]));
        exec.queue_write(Mutation::Update(locs[2], Document::new().with("n", 20i64)));

        let summary = exec.run_to_completion().unwrap();
        assert_eq!(ns(&summary.matched), vec![1, 20]);
        assert!(summary.flagged.is_empty());
    }

    #[test]
    fn each_executor_gets_a_fresh_run_id() {
        let (engine, locs) = engine(ExecConfig::default());
        let first = engine.executor(Box::new(QueuedStage::records(engine.context(), locs.clone())));
        let second = engine.executor(Box::new(QueuedStage::records(engine.context(), locs)));
        assert_eq!(first.run_id(), RunId::new(0));
        assert_eq!(second.run_id(), RunId::new(1));
    }

    #[test]
    fn work_limit_aborts_the_run() {
        let cfg = ExecConfig {
            max_works: Some(3),
            ..ExecConfig::default()
        };
        let (engine, _) = engine(cfg);
        let root = AndHashStage::new(
            engine.context(),
            vec![scan(&engine, "n >= 0"), scan(&engine, "n >= 0")],
        );
        let mut exec = engine.executor(Box::new(root));
        let err = exec.run_to_completion().unwrap_err();
        assert!(matches!(err, ExecError::WorkLimit(3)));

        // The run is over: members held by the root are released and later
        // calls report the end instead of repeating the error.
        assert_eq!(engine.pool().borrow().live_count(), 0);
        assert!(exec.next().unwrap().is_none());
        assert_eq!(exec.works(), 3);
        assert_eq!(exec.explain().unwrap()["stage"], "and_hash");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = ExecConfig {
            pool_capacity: 0,
            ..ExecConfig::default()
        };
        assert!(matches!(Engine::new(cfg), Err(ExecError::Config(_))));
    }

    #[test]
    fn pool_capacity_failure_surfaces_as_stage_error() {
        let cfg = ExecConfig {
            pool_capacity: 3,
            ..ExecConfig::default()
        };
        let (engine, _) = engine(cfg);
        let root = AndHashStage::new(
            engine.context(),
            vec![scan(&engine, "n >= 0"), scan(&engine, "n >= 0")],
        );
        let mut exec = engine.executor(Box::new(root));
        let err = exec.run_to_completion().unwrap_err();
        match err {
            ExecError::Stage(StageError::Child { child: 0, source }) => {
                assert!(matches!(*source, StageError::Pool(PoolError::CapacityExceeded { .. })));
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(engine.pool().borrow().live_count(), 0);
    }

    #[test]
    fn explain_includes_children() {
        let (engine, _) = engine(ExecConfig::default());
        let root = AndHashStage::new(
            engine.context(),
            vec![scan(&engine, "n >= 8"), scan(&engine, "n < 9")],
        );
        let mut exec = engine.executor(Box::new(root));
        exec.run_to_completion().unwrap();

        let explain = exec.explain().unwrap();
        assert_eq!(explain["stage"], "and_hash");
        assert_eq!(explain["specific"]["kind"], "and_hash");
        assert_eq!(explain["specific"]["map_after_child"], serde_json::json!([2, 1]));
        assert_eq!(explain["children"].as_array().unwrap().len(), 2);
        assert_eq!(explain["common"]["advanced"], 1);
    }
}
