//! crucible-engine — subprocess execution with named-pipe IPC and
//! single-flight deduplication.
//!
//! `TaskDispatcher` is the entry point: it fingerprints each request,
//! claims the fingerprint in the shared `ResultCache`, and either runs a
//! `TaskProcess` to completion or blocks on the owner that already did.

pub mod cache;
pub mod dispatch;
pub mod listener;
pub mod pipe;
pub mod process;

pub use cache::{CacheEntry, CacheError, MemoryCache, ResultCache};
pub use dispatch::TaskDispatcher;
pub use listener::ListenerRegistry;
pub use process::TaskProcess;
