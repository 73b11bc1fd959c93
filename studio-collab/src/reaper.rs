//! Periodic reclamation of rooms that have no connections left.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::SessionRegistry;

/// Default sweep interval: 5 minutes.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(300);

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);

/// Background task sweeping idle rooms out of a registry.
///
/// Runs until [`IdleReaper::shutdown`] is called or the handle is dropped.
pub struct IdleReaper {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl IdleReaper {
    /// Start sweeping `registry` every `interval`. The first sweep happens
    /// one full interval after spawning.
    pub fn spawn(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        let interval = interval.max(MIN_REAP_INTERVAL);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.reset(); // skip immediate first tick
            info!("Idle reaper started (interval {:?})", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = registry.reap_idle_rooms().await;
                        if reaped.is_empty() {
                            debug!("Idle sweep: nothing to reclaim");
                        } else {
                            info!("Idle sweep reclaimed {} room(s)", reaped.len());
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Idle reaper stopped");
        });

        Self { shutdown_tx, handle }
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl SessionRegistry {
    /// Spawn an [`IdleReaper`] for this registry.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> IdleReaper {
        IdleReaper::spawn(self.clone(), interval)
    }
}
