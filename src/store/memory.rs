//! Process-local window store.
//!
//! Implements the same contract as the Redis-backed store against an
//! in-process map. Suitable for tests and for single-instance deployments
//! where a shared store buys nothing.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

use super::WindowStore;

/// Upper bound on tracked scan positions. An abandoned scan never releases
/// its cursor, so the oldest position is evicted once the map is full; the
/// evicted scan simply ends on its next call, which every caller already
/// tolerates from a stale cursor.
const MAX_SCAN_POSITIONS: usize = 64;

/// In-memory [`WindowStore`] backed by a concurrent map of ordered sets.
///
/// Entries are `(score, member)` pairs ordered by score, so range removal is
/// a single `split_off`. Never fails.
#[derive(Default)]
pub struct MemoryWindowStore {
    sets: DashMap<String, BTreeSet<(i64, String)>>,
    /// In-flight scan positions, keyed by the opaque cursor handed out to
    /// the caller. Tracking the last key returned instead of an offset keeps
    /// a scan stable while the caller deletes the keys it was just given.
    scan_positions: DashMap<u64, String>,
    next_scan_cursor: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, for tests and introspection.
    pub fn key_count(&self) -> usize {
        self.sets.len()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn trim_older_than(&self, key: &str, cutoff_ms: i64) -> Result<u64> {
        let removed = match self.sets.get_mut(key) {
            Some(mut entry) => {
                let before = entry.len();
                // split_off keeps everything >= (cutoff, "") in the new set
                let kept = entry.split_off(&(cutoff_ms, String::new()));
                *entry = kept;
                (before - entry.len()) as u64
            }
            None => 0,
        };
        Ok(removed)
    }

    async fn add_member(&self, key: &str, score_ms: i64, member: &str) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert((score_ms, member.to_string()));
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<u64> {
        Ok(self.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn oldest_score(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .sets
            .get(key)
            .and_then(|s| s.iter().next().map(|(score, _)| *score)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.sets.remove(key);
        Ok(())
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        page_size: usize,
    ) -> Result<(u64, Vec<String>)> {
        // Only the `prefix*` glob form is used by the sweeper.
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);

        let start_after = if cursor == 0 {
            None
        } else {
            match self.scan_positions.remove(&cursor) {
                Some((_, key)) => Some(key),
                // Stale or foreign cursor: the scan it belonged to is over.
                None => return Ok((0, Vec::new())),
            }
        };

        let mut matching: Vec<String> = self
            .sets
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        matching.sort();

        let begin = match &start_after {
            Some(last) => matching.partition_point(|k| k.as_str() <= last.as_str()),
            None => 0,
        };
        let page: Vec<String> = matching[begin..].iter().take(page_size).cloned().collect();

        if begin + page.len() >= matching.len() {
            return Ok((0, page));
        }
        while self.scan_positions.len() >= MAX_SCAN_POSITIONS {
            match self.scan_positions.iter().map(|e| *e.key()).min() {
                Some(oldest) => self.scan_positions.remove(&oldest),
                None => break,
            };
        }
        let next_cursor = self.next_scan_cursor.fetch_add(1, Ordering::Relaxed) + 1;
        self.scan_positions
            .insert(next_cursor, page.last().cloned().unwrap_or_default());
        Ok((next_cursor, page))
    }

    async fn trim_and_count(&self, keys: &[String], cutoff_ms: i64) -> Result<Vec<(u64, u64)>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let removed = self.trim_older_than(key, cutoff_ms).await?;
            let count = self.count(key).await?;
            results.push((removed, count));
        }
        Ok(results)
    }
}
