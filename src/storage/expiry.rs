//! Background Expiry Sweeper
//!
//! Lazy expiry (checking on access) reclaims a key only if something reads
//! it again; a key that expires and is never touched would stay in memory
//! forever. The sweeper is the complementary "active expiry": a background
//! task that periodically runs [`StorageEngine::sweep_expired`] over all
//! shards, reclaiming dead strings and dead streams alike and reporting
//! the split.
//!
//! The cadence is two-speed. A pass that reclaims a meaningful fraction of
//! the keyspace means a TTL-heavy workload is churning, so the next pass
//! comes quickly; a quiet pass drops back to the idle cadence. Stream
//! entries under an expired stream key are released wholesale with the
//! entry, so a busy pass after bulk stream expiry is cheap to repeat.

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Cadence while little or nothing is expiring (default: 500ms)
    pub idle_interval: Duration,

    /// Cadence after a pass that hit `busy_fraction` (default: 25ms)
    pub busy_interval: Duration,

    /// Fraction of live keys reclaimed in one pass that switches the
    /// sweeper to the busy cadence
    pub busy_fraction: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(500),
            busy_interval: Duration::from_millis(25),
            busy_fraction: 0.05,
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task is stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    task: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Starts the expiry sweeper as a background task.
    ///
    /// Returns a handle that stops the sweeper when dropped.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let task = tokio::spawn(sweep_loop(engine, config));
        info!("Background expiry sweeper started");
        Self { task }
    }

    /// Stops the expiry sweeper.
    ///
    /// This is called automatically when the handle is dropped. The task
    /// only suspends between passes, so no shard lock is ever abandoned.
    pub fn stop(&self) {
        self.task.abort();
        info!("Background expiry sweeper stopped");
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sweeps on the idle cadence, switching to the busy cadence whenever a
/// pass reclaims at least `busy_fraction` of the live keyspace.
async fn sweep_loop(engine: Arc<StorageEngine>, config: ExpiryConfig) {
    let mut interval = config.idle_interval;

    loop {
        tokio::time::sleep(interval).await;

        let live_before = engine.len();
        let outcome = engine.sweep_expired();

        let busy = live_before > 0
            && outcome.total() as f64 / live_before as f64 >= config.busy_fraction;
        interval = if busy {
            config.busy_interval
        } else {
            config.idle_interval
        };

        if outcome.total() > 0 {
            debug!(
                strings = outcome.strings,
                streams = outcome.streams,
                remaining = engine.len(),
                busy = busy,
                "Reclaimed expired entries"
            );
        }
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}
