//! Async driver tying the REST client and live connection to a
//! [`ChatSession`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_shared::media::MediaPayload;
use parley_shared::protocol::{SendMessageRequest, ServerEvent};
use parley_shared::types::UserId;
use parley_shared::Message;

use crate::api::ApiClient;
use crate::error::Result;
use crate::live::LiveConnection;
use crate::session::ChatSession;

#[derive(Clone)]
pub struct ChatClient {
    api: Arc<ApiClient>,
    session: Arc<Mutex<ChatSession>>,
}

impl ChatClient {
    pub fn new(api: ApiClient, me: UserId) -> Self {
        Self {
            api: Arc::new(api.with_user(me)),
            session: Arc::new(Mutex::new(ChatSession::new(me))),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Run `f` against the session state.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut ChatSession) -> R) -> R {
        f(&mut self.session.lock())
    }

    pub async fn load_contacts(&self) -> Result<()> {
        let contacts = self.api.contacts().await?;
        self.session.lock().load_contacts(contacts);
        Ok(())
    }

    /// Select `peer` and load its history.
    pub async fn open_conversation(&self, peer: UserId) {
        let ticket = self.session.lock().select_peer(peer);
        let result = self.api.history(peer).await;
        self.session.lock().apply_history(ticket, result);
    }

    /// Re-fetch the open conversation.
    pub async fn refresh(&self) {
        let Some(ticket) = self.session.lock().refresh() else {
            return;
        };
        let result = self.api.history(ticket.peer).await;
        self.session.lock().apply_history(ticket, result);
    }

    /// Send to `peer`.  On success the stored message is appended from the
    /// response; on failure a notice is queued and the view is untouched.
    pub async fn send(
        &self,
        peer: UserId,
        text: Option<String>,
        image: Option<MediaPayload>,
    ) -> Result<Message> {
        let request = SendMessageRequest {
            text,
            image: image.map(|m| m.to_data_url()),
        };
        match self.api.send(peer, &request).await {
            Ok(message) => {
                self.session.lock().apply_sent(message.clone());
                Ok(message)
            }
            Err(e) => {
                self.session.lock().send_failed(peer, e.to_string());
                Err(e)
            }
        }
    }

    pub async fn handle_event(&self, event: ServerEvent) {
        debug!(event = event.name(), "Live event");
        let ack = self.session.lock().apply_event(event);
        if let Some(id) = ack {
            if let Err(e) = self.api.mark_seen(id).await {
                warn!(id = %id, error = %e, "Failed to mark message seen");
            }
        }
    }

    /// Feed every event from `live` into the session until it closes.
    pub fn spawn_live(&self, mut live: LiveConnection) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(event) = live.recv().await {
                client.handle_event(event).await;
            }
        })
    }
}
