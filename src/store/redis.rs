//! Redis-backed window store.
//!
//! Maps the [`WindowStore`] contract onto Redis sorted sets: one ZSET per
//! rate limit key, member scores are millisecond timestamps. Every operation
//! is bounded by a timeout; a timeout or connection failure surfaces as
//! `StoreUnavailable`, never as an admitted request.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

use super::WindowStore;

/// [`WindowStore`] implementation over a shared Redis instance.
///
/// Holds a [`ConnectionManager`], which multiplexes and reconnects
/// internally, so the store is cheap to share across request workers.
pub struct RedisWindowStore {
    conn: ConnectionManager,
    /// TTL applied to every key on write, so abandoned keys expire even if
    /// the sweeper never runs.
    entry_ttl_ms: i64,
    check_timeout: Duration,
    sweep_timeout: Duration,
}

impl RedisWindowStore {
    /// Create a store over an already established connection.
    pub fn new(conn: ConnectionManager, config: &TurnstileConfig) -> Self {
        Self {
            conn,
            entry_ttl_ms: config.limiter.window_ms() * 2,
            check_timeout: Duration::from_millis(config.store.check_timeout_ms),
            sweep_timeout: Duration::from_millis(config.store.sweep_timeout_ms),
        }
    }

    /// Connect to the store named in the configuration.
    pub async fn connect(config: &TurnstileConfig) -> Result<Self> {
        let client = redis::Client::open(config.store.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        debug!(url = %config.store.url, "Connected to shared store");
        Ok(Self::new(conn, config))
    }

    async fn run<T>(
        &self,
        timeout: Duration,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(TurnstileError::from),
            Err(_) => Err(TurnstileError::StoreUnavailable(format!(
                "store operation timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// ZREMRANGEBYSCORE max bound excluding the cutoff itself.
fn exclusive_cutoff(cutoff_ms: i64) -> String {
    format!("({}", cutoff_ms)
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn trim_older_than(&self, key: &str, cutoff_ms: i64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(key).arg("-inf").arg(exclusive_cutoff(cutoff_ms));
        self.run(self.check_timeout, async move {
            cmd.query_async::<u64>(&mut conn).await
        })
        .await
    }

    async fn add_member(&self, key: &str, score_ms: i64, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("ZADD").arg(key).arg(score_ms).arg(member).ignore();
        pipe.cmd("PEXPIRE").arg(key).arg(self.entry_ttl_ms).ignore();
        self.run(self.check_timeout, async move {
            pipe.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn count(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(key);
        self.run(self.check_timeout, async move {
            cmd.query_async::<u64>(&mut conn).await
        })
        .await
    }

    async fn oldest_score(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(key).arg(0).arg(0).arg("WITHSCORES");
        let entries: Vec<(String, f64)> = self
            .run(self.check_timeout, async move {
                cmd.query_async::<Vec<(String, f64)>>(&mut conn).await
            })
            .await?;
        Ok(entries.first().map(|(_, score)| *score as i64))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run(self.sweep_timeout, async move {
            cmd.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        page_size: usize,
    ) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(page_size);
        self.run(self.sweep_timeout, async move {
            cmd.query_async::<(u64, Vec<String>)>(&mut conn).await
        })
        .await
    }

    async fn trim_and_count(&self, keys: &[String], cutoff_ms: i64) -> Result<Vec<(u64, u64)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(exclusive_cutoff(cutoff_ms));
            pipe.cmd("ZCARD").arg(key);
        }

        let flat: Vec<u64> = self
            .run(self.sweep_timeout, async move {
                pipe.query_async::<Vec<u64>>(&mut conn).await
            })
            .await?;

        Ok(flat.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_cutoff_format() {
        assert_eq!(exclusive_cutoff(1_700_000_000_000), "(1700000000000");
        assert_eq!(exclusive_cutoff(0), "(0");
    }

    #[test]
    fn test_entry_ttl_is_twice_the_window() {
        let mut config = TurnstileConfig::default();
        config.limiter.window_seconds = 60;
        // Constructing without a live connection is not possible, so check
        // the derivation the constructor uses.
        assert_eq!(config.limiter.window_ms() * 2, 120_000);
    }
}
