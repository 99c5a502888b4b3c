//! Message delivery pipeline.
//!
//! One `send` runs `Validating -> MediaUploading (optional) -> Persisting ->
//! Pushing (optional) -> Completed`, or fails from any stage.  The durable
//! write is the commit point: once it succeeds the send succeeds, whatever
//! happens to the live push afterwards.
//!
//! No registry lock is held across store or object-store round trips.  Sends
//! for the same (sender, recipient) pair are serialised from timestamp
//! assignment through push, so persisted order and pushed order agree.
//! Media upload happens before that point: two overlapping sends may commit
//! in either order, and only a send issued after the previous one returned
//! is guaranteed to sort after it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use parley_shared::constants::MAX_TEXT_LEN;
use parley_shared::media::MediaPayload;
use parley_shared::protocol::ServerEvent;
use parley_shared::types::{MessageId, UserId};
use parley_shared::Message;
use parley_store::{MessageFilter, MessagePatch, MessageStore, StoreError};

use crate::media_store::{MediaError, ObjectStore};
use crate::registry::{ConnectionRegistry, PushError};

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Caller-fixable; nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Object store failed; nothing was persisted.
    #[error("Media upload error: {0}")]
    MediaUpload(#[from] MediaError),

    /// Durable store unavailable; nothing committed, nothing pushed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    Validating,
    MediaUploading,
    Persisting,
    Pushing,
    Completed,
}

impl std::fmt::Display for SendStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::MediaUploading => "media-uploading",
            Self::Persisting => "persisting",
            Self::Pushing => "pushing",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// What happened to the live push after the commit point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    RecipientOffline,
    Failed(PushError),
}

/// A committed send.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub push: PushOutcome,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub sender: UserId,
    pub recipient: UserId,
    pub text: Option<String>,
    pub media: Option<MediaPayload>,
}

/// Run a store operation on the blocking pool.
pub(crate) async fn run_blocking<T, F>(store: &Arc<dyn MessageStore>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn MessageStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Ordering helpers
// ---------------------------------------------------------------------------

/// Wall clock that never repeats or goes backwards within the process.
/// Microsecond resolution, matching the store.
#[derive(Default)]
struct MonotonicClock {
    last_us: Mutex<i64>,
}

impl MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let mut last = self.last_us.lock();
        let next = Utc::now().timestamp_micros().max(*last + 1);
        *last = next;
        DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now)
    }
}

/// Sweep dead entries once the table grows past this size.
const PAIR_LOCK_SWEEP_THRESHOLD: usize = 1024;

#[derive(Default)]
struct PairLocks {
    locks: Mutex<HashMap<(UserId, UserId), Weak<AsyncMutex<()>>>>,
}

impl PairLocks {
    async fn acquire(&self, sender: UserId, recipient: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > PAIR_LOCK_SWEEP_THRESHOLD {
                locks.retain(|_, weak| weak.strong_count() > 0);
            }
            match locks.get(&(sender, recipient)).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert((sender, recipient), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct DeliveryPipeline {
    store: Arc<dyn MessageStore>,
    media: Arc<dyn ObjectStore>,
    registry: Arc<ConnectionRegistry>,
    clock: MonotonicClock,
    pair_locks: PairLocks,
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<dyn MessageStore>,
        media: Arc<dyn ObjectStore>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            store,
            media,
            registry,
            clock: MonotonicClock::default(),
            pair_locks: PairLocks::default(),
        }
    }

    /// Validate, upload, persist, push.  See the module docs.
    pub async fn send(&self, request: SendRequest) -> Result<Delivery, DeliveryError> {
        let sender = request.sender;
        let recipient = request.recipient;
        let mut stage = SendStage::Validating;

        match self.run_send(request, &mut stage).await {
            Ok(delivery) => {
                info!(
                    id = %delivery.message.id,
                    sender = %sender,
                    recipient = %recipient,
                    push = ?delivery.push,
                    "Message sent"
                );
                Ok(delivery)
            }
            Err(e) => {
                warn!(
                    sender = %sender,
                    recipient = %recipient,
                    stage = %stage,
                    error = %e,
                    "Send failed"
                );
                Err(e)
            }
        }
    }

    async fn run_send(
        &self,
        request: SendRequest,
        stage: &mut SendStage,
    ) -> Result<Delivery, DeliveryError> {
        let SendRequest {
            sender,
            recipient,
            text,
            media,
        } = request;

        let text = text.filter(|t| !t.trim().is_empty());
        if text.is_none() && media.is_none() {
            return Err(DeliveryError::Validation(
                "message needs text or media".into(),
            ));
        }
        if let Some(len) = text.as_ref().map(|t| t.chars().count()) {
            if len > MAX_TEXT_LEN {
                return Err(DeliveryError::Validation(format!(
                    "text is {len} characters (max {MAX_TEXT_LEN})"
                )));
            }
        }
        if !run_blocking(&self.store, move |s| s.user_exists(recipient)).await? {
            return Err(DeliveryError::Validation(format!(
                "unknown recipient {recipient}"
            )));
        }

        let media_url = match media {
            Some(payload) => {
                *stage = SendStage::MediaUploading;
                debug!(sender = %sender, size = payload.len(), "Uploading media");
                Some(self.media.upload(payload).await?)
            }
            None => None,
        };

        *stage = SendStage::Persisting;
        let _pair = self.pair_locks.acquire(sender, recipient).await;
        let message = Message {
            id: MessageId::new(),
            sender_id: sender,
            recipient_id: recipient,
            text,
            media_url,
            created_at: self.clock.now(),
            seen: false,
        };

        let uploaded = message.media_url.clone();
        let message = match run_blocking(&self.store, move |s| s.insert(message)).await {
            Ok(message) => message,
            Err(e) => {
                if let Some(url) = uploaded {
                    warn!(url = %url, "Uploaded media left unreferenced");
                }
                return Err(e.into());
            }
        };

        *stage = SendStage::Pushing;
        let push = self.push(&message);

        *stage = SendStage::Completed;
        Ok(Delivery { message, push })
    }

    /// Best-effort live push.  Failures are logged, never returned.
    fn push(&self, message: &Message) -> PushOutcome {
        let Some(handle) = self.registry.lookup(message.recipient_id) else {
            debug!(id = %message.id, recipient = %message.recipient_id, "Recipient offline");
            return PushOutcome::RecipientOffline;
        };

        match handle.push(ServerEvent::MessageDelivered(message.clone())) {
            Ok(()) => PushOutcome::Pushed,
            Err(e) => {
                warn!(
                    id = %message.id,
                    recipient = %message.recipient_id,
                    conn = %handle.conn_id(),
                    error = %e,
                    "Push delivery failed; message stays in history"
                );
                if e == PushError::Closed {
                    self.registry
                        .unregister(message.recipient_id, handle.conn_id());
                }
                PushOutcome::Failed(e)
            }
        }
    }

    /// Conversation between `viewer` and `peer`, in persisted order.
    pub async fn history(&self, viewer: UserId, peer: UserId) -> Result<Vec<Message>, DeliveryError> {
        let filter = MessageFilter::Conversation(viewer, peer);
        Ok(run_blocking(&self.store, move |s| s.query(&filter)).await?)
    }

    /// Flip every unseen `peer -> viewer` message to seen in one update.
    /// Returns how many changed; repeating it is a no-op.
    pub async fn mark_seen(&self, peer: UserId, viewer: UserId) -> Result<usize, DeliveryError> {
        let filter = MessageFilter::UnseenFrom {
            sender: peer,
            recipient: viewer,
        };
        let changed = run_blocking(&self.store, move |s| {
            s.update_many(&filter, MessagePatch::MarkSeen)
        })
        .await?;
        if changed > 0 {
            debug!(peer = %peer, viewer = %viewer, changed, "Marked conversation seen");
        }
        Ok(changed)
    }

    /// Mark one message seen, provided `viewer` is its recipient.
    pub async fn mark_message_seen(
        &self,
        id: MessageId,
        viewer: UserId,
    ) -> Result<bool, DeliveryError> {
        let filter = MessageFilter::Single {
            id,
            recipient: viewer,
        };
        let changed = run_blocking(&self.store, move |s| {
            s.update_many(&filter, MessagePatch::MarkSeen)
        })
        .await?;
        Ok(changed > 0)
    }
}
