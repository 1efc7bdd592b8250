//! Window storage abstraction over the shared store's sorted-set primitives.

use async_trait::async_trait;

use crate::error::Result;

mod memory;
mod redis;

pub use self::memory::MemoryWindowStore;
pub use self::redis::RedisWindowStore;

/// Sorted-set storage for sliding-window entries, one set per rate limit key.
///
/// This trait is the only seam between the limiter/sweeper and the shared
/// store. Members carry a millisecond timestamp as their score; every
/// operation is individually atomic at the store layer, but sequences of
/// operations are not, and callers must not assume otherwise.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Remove all members with a score strictly below `cutoff_ms`.
    ///
    /// Returns the number of members removed.
    async fn trim_older_than(&self, key: &str, cutoff_ms: i64) -> Result<u64>;

    /// Insert one window entry.
    async fn add_member(&self, key: &str, score_ms: i64, member: &str) -> Result<()>;

    /// Number of members currently stored for `key`.
    async fn count(&self, key: &str) -> Result<u64>;

    /// The lowest score currently stored, or `None` for an absent/empty key.
    async fn oldest_score(&self, key: &str) -> Result<Option<i64>>;

    /// Remove the key entirely.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetch one page of key names matching `pattern` (a `prefix*` glob).
    ///
    /// A cursor of 0 starts the scan; a returned cursor of 0 ends it. The
    /// pagination contract matches Redis SCAN: keys may be revisited or
    /// transiently missed within a full scan.
    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        page_size: usize,
    ) -> Result<(u64, Vec<String>)>;

    /// Trim every key against `cutoff_ms` and return `(removed, count)` per
    /// key, in one store round trip.
    async fn trim_and_count(&self, keys: &[String], cutoff_ms: i64) -> Result<Vec<(u64, u64)>>;
}
