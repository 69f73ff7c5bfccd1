//! Execution counters exposed by every stage.
//!
//! Stats are plain serde data so the executor can render an explain tree
//! without knowing the concrete stage types.

use serde::{Deserialize, Serialize};

use crate::traits::StageState;

/// Counters every stage keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonStats {
    pub works: u64,
    pub advanced: u64,
    pub need_time: u64,
    pub yields: u64,
    pub unyields: u64,
    pub invalidates: u64,
    pub exhausted: bool,
}

impl CommonStats {
    /// Count one `work()` call and its outcome.
    pub fn record(&mut self, state: &StageState) {
        self.works += 1;
        match state {
            StageState::Advanced(_) => self.advanced += 1,
            StageState::NeedTime => self.need_time += 1,
            StageState::Exhausted => self.exhausted = true,
            StageState::Failed(_) => {}
        }
    }
}

/// Counters specific to the hash AND stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AndHashStats {
    /// Candidates flagged because their location was invalidated while held.
    pub flagged_in_progress: u64,
    /// Already-flagged candidates from children passed straight through.
    pub flagged_but_passed: u64,
    /// Membership map size after each finished child round.
    pub map_after_child: Vec<usize>,
    /// Tickets released as redundant (repeated locations within a child).
    pub duplicates_released: u64,
    /// Survivors released because the residual predicate rejected them.
    pub predicate_rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpecificStats {
    None,
    AndHash(AndHashStats),
    CollectionScan { docs_examined: u64 },
    Queued { remaining: usize },
}

/// Stats for one stage plus its subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: String,
    pub common: CommonStats,
    pub specific: SpecificStats,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<StageStats>,
}

impl StageStats {
    pub fn leaf(stage: &str, common: CommonStats, specific: SpecificStats) -> Self {
        Self {
            stage: stage.to_string(),
            common,
            specific,
            children: vec![],
        }
    }

    pub fn with_children(mut self, children: Vec<StageStats>) -> Self {
        self.children = children;
        self
    }
}
