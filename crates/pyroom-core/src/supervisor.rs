use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::SessionManager;

/// Background loop that reclaims idle sessions on a fixed interval.
pub struct IdleSweeper {
    manager: Arc<SessionManager>,
    interval: Duration,
}

impl IdleSweeper {
    pub fn new(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Spawn the loop. It runs until the returned handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            idle_threshold_secs = self.manager.config().idle_threshold.as_secs(),
            "Starting idle session sweeper"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;

                let outcome = self.manager.sweep_idle().await;
                match outcome.reclaimed.len() {
                    0 => debug!("Idle sweep found nothing to reclaim"),
                    count => info!("Cleaned up {} inactive sessions", count),
                }
            }
        })
    }
}
