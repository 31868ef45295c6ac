//! Dedup cache — fingerprint → in-flight claim or published result.
//!
//! The cache is the only resource multiple dispatchers mutate
//! concurrently, so every mutation is a single atomic operation against
//! the store: `put_if_absent` is the claim, `put` is the publish (claim
//! owners only), `remove_if_owner` is the release. Never read-modify-write
//! from the caller side — that breaks the single-flight guarantee across
//! service instances.
//!
//! Any external key-value store offering compare-and-set and TTL expiry
//! can implement `ResultCache`. `MemoryCache` is the in-process
//! implementation with exactly those semantics, used by tests and
//! single-instance deployments.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crucible_core::TaskResult;

/// Value stored under a fingerprint key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheEntry {
    /// An execution is in flight; waiters should block on this key.
    InFlight { owner: String },
    /// Terminal result, immutable once written.
    Done { result: TaskResult },
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// The distributed key-value collaborator. Requires only atomic
/// compare-and-set and TTL expiry from the backing store.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Atomically claim `key` if no live entry exists. Returns true when
    /// the claim was won. This is the single-flight gate.
    async fn put_if_absent(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Current entry under `key`, if unexpired.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Overwrite `key`. Only the claim owner calls this, to publish the
    /// terminal result.
    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError>;

    /// Release a claim without publishing: remove `key` only while it is
    /// still this owner's in-flight entry.
    async fn remove_if_owner(&self, key: &str, owner: &str) -> Result<(), CacheError>;
}

// ── In-memory backend ─────────────────────────────────────────────────────────

struct Stored {
    entry: CacheEntry,
    expires_at: Instant,
}

/// DashMap-backed `ResultCache` with lazy expiry. Per-key atomicity comes
/// from the map's entry API.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Stored>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry count (expired entries not yet reaped are excluded).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn put_if_absent(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let stored = Stored {
            entry,
            expires_at: Instant::now() + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= Instant::now() {
                    occupied.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = Instant::now();
        if let Some(stored) = self.entries.get(key) {
            if stored.expires_at > now {
                return Ok(Some(stored.entry.clone()));
            }
        }
        // Absent or expired; reap lazily. The guard above is dropped, so
        // this cannot deadlock on the shard.
        self.entries.remove_if(key, |_, s| s.expires_at <= now);
        Ok(None)
    }

    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Stored {
                entry,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn remove_if_owner(&self, key: &str, owner: &str) -> Result<(), CacheError> {
        self.entries.remove_if(key, |_, s| {
            matches!(&s.entry, CacheEntry::InFlight { owner: o } if o == owner)
        });
        Ok(())
    }
}
