//! Background reclamation of stale rate limit keys.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LimiterConfig;
use crate::error::Result;
use crate::store::WindowStore;

/// What one sweep cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub keys_scanned: usize,
    pub entries_trimmed: u64,
    pub keys_deleted: usize,
}

/// Periodic task that trims expired window entries and deletes empty keys.
///
/// Purely a memory-reclamation optimization: every check call performs its
/// own trim, so the sweeper can be skipped, crash, or run redundantly from
/// any number of instances without affecting a single admission decision.
pub struct Sweeper<S: WindowStore> {
    store: Arc<S>,
    config: LimiterConfig,
}

impl<S: WindowStore + 'static> Sweeper<S> {
    pub fn new(store: Arc<S>, config: LimiterConfig) -> Self {
        Self { store, config }
    }

    /// Spawn the sweep loop and hand back its lifecycle handle.
    ///
    /// The loop runs one cycle per `sweep_interval_seconds` until the handle
    /// is shut down. A failed cycle is logged and retried on the next tick;
    /// it never propagates anywhere else.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = Duration::from_secs(self.config.sweep_interval_seconds);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(stats) => debug!(
                                keys_scanned = stats.keys_scanned,
                                entries_trimmed = stats.entries_trimmed,
                                keys_deleted = stats.keys_deleted,
                                "Sweep cycle complete"
                            ),
                            Err(e) => warn!(
                                error = %e,
                                "Sweep cycle failed, retrying on next interval"
                            ),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Sweeper shutting down");
                        break;
                    }
                }
            }
        });

        SweeperHandle { shutdown_tx, task }
    }

    /// Run one full scan of the key space.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        self.sweep_once_at(Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn sweep_once_at(&self, now_ms: i64) -> Result<SweepStats> {
        let cutoff = now_ms - self.config.window_ms();
        let pattern = format!("{}*", self.config.key_prefix);
        let mut stats = SweepStats::default();
        let mut cursor = 0;

        loop {
            let (next_cursor, keys) = self
                .store
                .scan_keys(&pattern, cursor, self.config.sweep_page_size)
                .await?;

            if !keys.is_empty() {
                // One round trip per page: trim every key, then delete the
                // ones the trim left empty.
                let results = self.store.trim_and_count(&keys, cutoff).await?;
                for (key, (removed, count)) in keys.iter().zip(results) {
                    stats.entries_trimmed += removed;
                    if count == 0 {
                        self.store.delete(key).await?;
                        stats.keys_deleted += 1;
                    }
                }
                stats.keys_scanned += keys.len();
            }

            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        Ok(stats)
    }
}

/// Lifecycle handle for a running [`Sweeper`] task.
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweep loop to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}
