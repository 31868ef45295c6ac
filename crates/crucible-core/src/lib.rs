//! crucible-core — shared task types, config, errors, and fingerprinting.
//! All other Crucible crates depend on this one.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod task;

pub use error::TaskError;
pub use fingerprint::Fingerprint;
pub use task::{TaskRequest, TaskResult, TaskStatus};
