//! Presence broadcaster.
//!
//! Waits for registry mutations and pushes the full roster to every
//! registered connection.  Broadcasts are best-effort: no acknowledgement,
//! no retry.  Intermediate rosters may be coalesced when mutations arrive
//! faster than the fan-out; the next broadcast supersedes them anyway.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::{ConnectionRegistry, PushError, Roster};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
}

#[derive(Clone)]
pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Push the current roster to every registered connection.
    ///
    /// Connections whose socket task is gone are unregistered, which in turn
    /// schedules another broadcast.
    pub fn broadcast(&self) -> BroadcastReport {
        let (roster, handles) = self.registry.roster_with_handles();
        let event = roster.to_event();
        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();

        for handle in &handles {
            match handle.push(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(PushError::Backpressure) => {
                    report.dropped += 1;
                    warn!(
                        user = %handle.user_id(),
                        conn = %handle.conn_id(),
                        "Dropping roster update for slow connection"
                    );
                }
                Err(PushError::Closed) => closed.push(handle.clone()),
            }
        }

        for handle in closed {
            if self.registry.unregister(handle.user_id(), handle.conn_id()) {
                report.evicted += 1;
            }
        }

        debug!(
            version = roster.version,
            online = roster.online.len(),
            delivered = report.delivered,
            dropped = report.dropped,
            evicted = report.evicted,
            "Broadcast presence roster"
        );

        report
    }

    /// Broadcast after every registry mutation.  Runs for the life of the process.
    pub async fn run(self) {
        let mut rx: watch::Receiver<Roster> = self.registry.subscribe();
        // Anything registered before we subscribed still needs a roster.
        rx.mark_changed();
        while rx.changed().await.is_ok() {
            self.broadcast();
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
