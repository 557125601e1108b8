//! Backing stores for per-key admission history.
//!
//! A store keeps, for every key, a score-ordered set of admission markers
//! whose score is the admission timestamp. Each trait method must run as one
//! indivisible operation with respect to every other call on the same store.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{secs_as_i64, Strategy};

/// Trait for stores able to run the two atomic window operations.
///
/// This trait abstracts over the Redis store and the in-process store so the
/// rate limiter can work with either.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Check every strategy for every key and record admissions.
    ///
    /// For each key, strategies are checked in order; a key is admitted only
    /// if fewer than `limit` markers score at or after `now - window` for all
    /// of them, in which case a new marker scored `now` is inserted. Returns
    /// one flag per key in input order.
    async fn evaluate(&self, keys: &[String], strategies: &[Strategy], now: i64)
        -> Result<Vec<bool>>;

    /// Expire keys after `expiration` seconds and drop markers scored
    /// strictly below `now - expiration - 1`.
    async fn cleanup(&self, keys: &[String], expiration: u64, now: i64) -> Result<()>;
}

/// Build a marker member unique across calls and across keys of one call.
pub(crate) fn marker_member(now: i64, nonce: &str, index: usize) -> String {
    format!("{}:{}:{}", now, nonce, index)
}

/// Highest score removed by cleanup is strictly below this bound.
pub(crate) fn trim_bound(now: i64, expiration: u64) -> i64 {
    now.saturating_sub(secs_as_i64(expiration)).saturating_sub(1)
}

/// Timestamp at which a key touched at `now` expires.
pub(crate) fn expiry_deadline(now: i64, expiration: u64) -> i64 {
    now.saturating_add(secs_as_i64(expiration))
}
