#![forbid(unsafe_code)]
//! planstage-core: ids, documents, configuration and errors shared by every
//! other planstage crate.
//!
//! No storage, pooling or execution logic lives here.

pub mod config;
pub mod error;
pub mod id;
pub mod prelude;
pub mod types;

pub use config::ExecConfig;
pub use error::{Error, Result};
pub use id::{RecordRef, RunId};
pub use types::{Document, Scalar};
