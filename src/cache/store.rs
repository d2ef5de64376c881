//! The cache store abstraction.

use async_trait::async_trait;
use thiserror::Error;

use super::entry::CacheEntry;
use super::key::CacheKey;

/// Errors surfaced by a cache store.
///
/// Callers treat read errors as misses and write errors as dropped writes;
/// no store error is ever allowed to fail a client request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode entry metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Asynchronous keyed storage for cache entries.
///
/// The proxy receives a store by injection and never assumes anything about
/// the backing medium. Implementations must make `put` atomic per key: a
/// concurrent `get` observes either the old entry or the new one, never a
/// torn mix.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Looks up an entry. `Ok(None)` is a miss; implementations degrade
    /// undecodable entries to misses rather than erroring.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Stores or replaces the entry for `key`.
    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Removes the entry for `key`, if any.
    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError>;
}
