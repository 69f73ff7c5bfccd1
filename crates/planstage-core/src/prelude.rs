//! Convenient re-exports for downstream crates.

pub use crate::config::ExecConfig;
pub use crate::error::{Error, Result};
pub use crate::id::{RecordRef, RunId};
pub use crate::types::{Document, Scalar};
