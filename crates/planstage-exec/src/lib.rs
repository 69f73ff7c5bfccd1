#![forbid(unsafe_code)]
//! planstage-exec: drives a stage tree to completion.
//!
//! The executor calls `work()` on the root stage, yields every
//! `yield_every_works` calls, and applies queued writes only while yielded,
//! announcing every destroyed location to the tree first.

pub mod metrics;
pub mod runtime;

pub use runtime::{Engine, ExecError, ExecOutput, Executor, Mutation, RunSummary};
