//! Shared cache abstraction.
//!
//! The gateway keeps cross-replica state (session bindings, key preference
//! scores, failure counters, cached model lists, the conversation debug
//! ring) in a Redis-shaped key/value surface. The trait below covers only
//! the operations the core actually performs; `MemoryCache` is the
//! in-process implementation used by default and in tests.
//!
//! Callers are expected to degrade on `CacheError`: treat reads as empty
//! and skip writes rather than failing the request.

pub mod keys;
mod memory;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryCache;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Increment an integer counter, creating it with `ttl` on first use.
    /// Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<i64>;

    async fn zscore(&self, key: &str, member: &str) -> CacheResult<Option<f64>>;

    /// Insert a sorted-set member with `score` only when absent (ZADD NX).
    async fn zadd_if_absent(&self, key: &str, member: &str, score: f64) -> CacheResult<()>;

    /// Increment a member's score and clamp the result into `[min, max]`.
    /// Returns the clamped score.
    async fn zincr_clamped(
        &self,
        key: &str,
        member: &str,
        delta: f64,
        min: f64,
        max: f64,
    ) -> CacheResult<f64>;

    /// Append to a list, trimming to the newest `cap` entries.
    async fn list_push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Option<Duration>,
    ) -> CacheResult<()>;

    async fn list_range(&self, key: &str) -> CacheResult<Vec<String>>;
}
