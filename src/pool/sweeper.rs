//! Background Idle Sweeper
//!
//! Periodically walks every idle list and evicts connections that have sat
//! unused past the inactivity timeout.
//!
//! ## Design
//!
//! The sweeper runs as a Tokio task and:
//! 1. Sleeps for the sweep interval
//! 2. Wakes up and asks the pool to evict expired idle connections
//! 3. Logs how many were evicted
//!
//! The task holds only a weak reference to the pool, so a pool that is
//! dropped without `dispose()` still goes away; the sweeper notices on its
//! next tick and exits.

use crate::pool::manager::PoolInner;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// A handle to the running idle sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct IdleSweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl IdleSweeper {
    /// Starts the sweeper for `pool`, ticking every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(pool: Weak<PoolInner>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(pool, interval, shutdown_rx));

        debug!(interval_ms = interval.as_millis() as u64, "Idle sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the sweeper. Called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    pool: Weak<PoolInner>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Idle sweeper received shutdown signal");
                    return;
                }
            }
        }

        let Some(inner) = pool.upgrade() else {
            trace!("Pool dropped, idle sweeper exiting");
            return;
        };

        let evicted = PoolInner::evict_expired(&inner);
        if evicted > 0 {
            debug!(
                evicted = evicted,
                idle_remaining = inner.total_idle(),
                "Evicted idle connections"
            );
        }
    }
}
