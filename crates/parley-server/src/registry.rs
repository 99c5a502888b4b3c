//! Connection registry.
//!
//! Process-wide table mapping a user to the live connection that receives
//! pushes for it.  One canonical handle per user: a newer registration
//! replaces the older one (last writer wins), and an unregister only removes
//! the entry when the departing handle is still the stored one, so a late
//! disconnect cannot evict a reconnect that raced it.
//!
//! Every mutation publishes a fresh [`Roster`] on a watch channel while the
//! table lock is held, so observers never see a partial or out-of-order
//! roster.  All operations are total.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::protocol::{PresenceRoster, ServerEvent};
use parley_shared::types::UserId;

/// Why a push over a live connection did not go through.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PushError {
    /// The connection's outbound queue is full (slow reader).
    #[error("outbound queue full")]
    Backpressure,

    /// The connection's socket task is gone.
    #[error("connection closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Live handle
// ---------------------------------------------------------------------------

struct HandleInner {
    conn_id: Uuid,
    user_id: UserId,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    outbound: mpsc::Sender<ServerEvent>,
    evicted: Notify,
}

/// Opaque, cheaply cloneable handle to one live connection.
#[derive(Clone)]
pub struct LiveHandle {
    inner: Arc<HandleInner>,
}

impl LiveHandle {
    pub fn new(user_id: UserId, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                conn_id: Uuid::new_v4(),
                user_id,
                connected_at: Utc::now(),
                last_seen: Mutex::new(Instant::now()),
                outbound,
                evicted: Notify::new(),
            }),
        }
    }

    /// Handle plus the receiving end the socket task drains.
    pub fn channel(user_id: UserId, buffer: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(user_id, tx), rx)
    }

    pub fn conn_id(&self) -> Uuid {
        self.inner.conn_id
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Queue an event without waiting.
    pub fn push(&self, event: ServerEvent) -> Result<(), PushError> {
        self.inner.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.inner.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.inner.last_seen.lock())
    }

    /// Ask the socket task owning this connection to close.
    pub fn evict(&self) {
        self.inner.evicted.notify_one();
    }

    /// Resolves once [`evict`](Self::evict) has been called.
    pub async fn evicted(&self) {
        self.inner.evicted.notified().await;
    }

    pub fn is_same(&self, other: &LiveHandle) -> bool {
        self.inner.conn_id == other.inner.conn_id
    }
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("conn_id", &self.inner.conn_id)
            .field("user_id", &self.inner.user_id)
            .field("connected_at", &self.inner.connected_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// Point-in-time online set, derived from the registry contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    /// Bumped on every registry mutation.
    pub version: u64,
    pub online: BTreeSet<UserId>,
}

impl Roster {
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::PresenceRosterChanged(PresenceRoster {
            online: self.online.iter().copied().collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryInner {
    handles: HashMap<UserId, LiveHandle>,
    version: u64,
}

pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    roster_tx: watch::Sender<Roster>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (roster_tx, _) = watch::channel(Roster::default());
        Self {
            inner: RwLock::new(RegistryInner::default()),
            roster_tx,
        }
    }

    /// Record `handle` as the user's canonical connection.
    ///
    /// Returns the handle it replaced, if any.  The replaced connection is
    /// signalled to close.
    pub fn register(&self, handle: LiveHandle) -> Option<LiveHandle> {
        let user_id = handle.user_id();
        let conn_id = handle.conn_id();

        let mut inner = self.inner.write();
        let previous = inner.handles.insert(user_id, handle);
        self.publish(&mut inner);
        drop(inner);

        match &previous {
            Some(old) => {
                info!(
                    user = %user_id,
                    conn = %conn_id,
                    replaced = %old.conn_id(),
                    "Live connection replaced"
                );
                old.evict();
            }
            None => info!(user = %user_id, conn = %conn_id, "Live connection registered"),
        }

        previous
    }

    /// Remove the user's entry if and only if it is still `conn_id`.
    pub fn unregister(&self, user_id: UserId, conn_id: Uuid) -> bool {
        let mut inner = self.inner.write();
        let matches = inner
            .handles
            .get(&user_id)
            .is_some_and(|h| h.conn_id() == conn_id);

        if !matches {
            drop(inner);
            debug!(user = %user_id, conn = %conn_id, "Ignoring unregister for superseded connection");
            return false;
        }

        inner.handles.remove(&user_id);
        self.publish(&mut inner);
        drop(inner);

        info!(user = %user_id, conn = %conn_id, "Live connection unregistered");
        true
    }

    /// Current canonical handle for `user_id`.  A miss means "offline".
    pub fn lookup(&self, user_id: UserId) -> Option<LiveHandle> {
        self.inner.read().handles.get(&user_id).cloned()
    }

    /// Consistent online set.
    pub fn snapshot(&self) -> BTreeSet<UserId> {
        self.inner.read().handles.keys().copied().collect()
    }

    /// Latest published roster.
    pub fn roster(&self) -> Roster {
        self.roster_tx.borrow().clone()
    }

    /// Roster plus the handles it was derived from, read under one lock.
    pub fn roster_with_handles(&self) -> (Roster, Vec<LiveHandle>) {
        let inner = self.inner.read();
        let roster = Roster {
            version: inner.version,
            online: inner.handles.keys().copied().collect(),
        };
        (roster, inner.handles.values().cloned().collect())
    }

    /// Receiver notified after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<Roster> {
        self.roster_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.read().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().handles.is_empty()
    }

    /// Unregister every handle silent for longer than `max_idle` and signal
    /// its socket task.  Returns the evicted handles.
    pub fn evict_stale(&self, now: Instant, max_idle: Duration) -> Vec<LiveHandle> {
        let mut inner = self.inner.write();
        let stale: Vec<UserId> = inner
            .handles
            .iter()
            .filter(|(_, h)| h.idle_for(now) > max_idle)
            .map(|(user, _)| *user)
            .collect();

        if stale.is_empty() {
            return Vec::new();
        }

        let evicted: Vec<LiveHandle> = stale
            .iter()
            .filter_map(|user| inner.handles.remove(user))
            .collect();
        self.publish(&mut inner);
        drop(inner);

        for handle in &evicted {
            info!(
                user = %handle.user_id(),
                conn = %handle.conn_id(),
                idle_secs = handle.idle_for(now).as_secs(),
                "Evicting silent connection"
            );
            handle.evict();
        }

        evicted
    }

    /// Drop every connection.  Used on process shutdown.
    pub fn shutdown(&self) -> usize {
        let mut inner = self.inner.write();
        let drained: Vec<LiveHandle> = inner.handles.drain().map(|(_, h)| h).collect();
        self.publish(&mut inner);
        drop(inner);

        for handle in &drained {
            handle.evict();
        }
        drained.len()
    }

    fn publish(&self, inner: &mut RegistryInner) {
        inner.version += 1;
        let roster = Roster {
            version: inner.version,
            online: inner.handles.keys().copied().collect(),
        };
        self.roster_tx.send_replace(roster);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
