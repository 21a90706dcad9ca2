// src/core/events/purger.rs

//! A background task to periodically clean up progress-event channels for
//! users that no longer have a live lab or file server and no live
//! subscriber.

use super::ProgressEventBus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// The interval at which the purger task runs. 5 minutes is a reasonable default.
const PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Supplies the set of usernames that currently have a lab or file server in
/// any non-terminal state. The purger never removes a channel for a user in
/// this set, even if it has no live subscriber right now, since a client may
/// reconnect to watch a long-running spawn.
pub trait ActiveUserProvider: Send + Sync {
    fn active_users(&self) -> HashSet<String>;
}

/// The background task struct for the progress-event channel purger.
pub struct EventPurgerTask {
    bus: Arc<ProgressEventBus>,
    active_users: Arc<dyn ActiveUserProvider>,
}

impl EventPurgerTask {
    pub fn new(bus: Arc<ProgressEventBus>, active_users: Arc<dyn ActiveUserProvider>) -> Self {
        Self { bus, active_users }
    }

    /// The main run loop for the purger task. Periodically calls
    /// `purge_idle` on the event bus, exempting any user currently tracked
    /// by the lab or file-server managers.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Progress-event channel purger task started.");
        let mut interval = tokio::time::interval(PURGE_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let active = self.active_users.active_users();
                    self.bus.purge_idle(&active).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Progress-event channel purger task shutting down.");
                    return;
                }
            }
        }
    }
}
