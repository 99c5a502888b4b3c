//! Client-side reconciliation state.
//!
//! [`ChatSession`] is plain data: the async driver feeds it REST results and
//! live events and acts on what it returns.  At most one conversation is
//! open.  Selecting a different peer drops the previous view and its buffers.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use tracing::debug;

use parley_shared::protocol::{ContactsResponse, ServerEvent};
use parley_shared::types::{MessageId, UserId};
use parley_shared::{Message, User};

use crate::conversation::ConversationView;
use crate::error::ClientError;

/// Identifies one history fetch.  Results for a superseded ticket are
/// discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryTicket {
    pub peer: UserId,
    generation: u64,
}

/// Transient notification for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SendFailed { peer: UserId, reason: String },
    HistoryFailed { peer: UserId, reason: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SendFailed { peer, reason } => {
                write!(f, "message to {} not sent: {reason}", peer.short())
            }
            Notice::HistoryFailed { peer, reason } => {
                write!(f, "could not load history with {}: {reason}", peer.short())
            }
        }
    }
}

struct ActiveConversation {
    view: ConversationView,
    generation: u64,
    loading: bool,
    /// Messages appended while a fetch was outstanding.
    pending: Vec<Message>,
}

pub struct ChatSession {
    me: UserId,
    contacts: Vec<User>,
    online: BTreeSet<UserId>,
    unseen: HashMap<UserId, u64>,
    active: Option<ActiveConversation>,
    next_generation: u64,
    notices: VecDeque<Notice>,
}

impl ChatSession {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            contacts: Vec::new(),
            online: BTreeSet::new(),
            unseen: HashMap::new(),
            active: None,
            next_generation: 0,
            notices: VecDeque::new(),
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn load_contacts(&mut self, contacts: ContactsResponse) {
        self.contacts = contacts.users;
        self.unseen = contacts.unseen_messages;
        if let Some(peer) = self.active_peer() {
            self.unseen.remove(&peer);
        }
    }

    pub fn contacts(&self) -> &[User] {
        &self.contacts
    }

    pub fn online(&self) -> &BTreeSet<UserId> {
        &self.online
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.online.contains(&user)
    }

    pub fn unseen_from(&self, peer: UserId) -> u64 {
        self.unseen.get(&peer).copied().unwrap_or(0)
    }

    pub fn active_peer(&self) -> Option<UserId> {
        self.active.as_ref().map(|a| a.view.peer())
    }

    pub fn view(&self) -> Option<&ConversationView> {
        self.active.as_ref().map(|a| &a.view)
    }

    pub fn is_loading(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.loading)
    }

    /// Open the conversation with `peer` and start a history fetch.
    ///
    /// Reselecting the open peer keeps the current view on screen until the
    /// snapshot replaces it.
    pub fn select_peer(&mut self, peer: UserId) -> HistoryTicket {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.unseen.remove(&peer);

        match self.active.as_mut() {
            Some(active) if active.view.peer() == peer => {
                active.generation = generation;
                active.loading = true;
                active.pending.clear();
            }
            _ => {
                self.active = Some(ActiveConversation {
                    view: ConversationView::new(self.me, peer),
                    generation,
                    loading: true,
                    pending: Vec::new(),
                });
            }
        }

        HistoryTicket { peer, generation }
    }

    /// Re-fetch the open conversation, if any.
    pub fn refresh(&mut self) -> Option<HistoryTicket> {
        let peer = self.active_peer()?;
        Some(self.select_peer(peer))
    }

    /// Apply a history fetch.  Returns `false` when the ticket is stale.
    pub fn apply_history(
        &mut self,
        ticket: HistoryTicket,
        result: Result<Vec<Message>, ClientError>,
    ) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.view.peer() != ticket.peer || active.generation != ticket.generation {
            debug!(peer = %ticket.peer, "Discarding stale history");
            return false;
        }

        active.loading = false;
        let pending = std::mem::take(&mut active.pending);
        match result {
            Ok(history) => {
                active.view.replace(history);
                // Anything that arrived during the fetch and is missing from
                // the snapshot goes back on the tail.
                for message in pending {
                    active.view.push(message);
                }
            }
            Err(e) => {
                self.notices.push_back(Notice::HistoryFailed {
                    peer: ticket.peer,
                    reason: e.to_string(),
                });
            }
        }
        true
    }

    /// Apply a live event.  Returns the id of a message to acknowledge as
    /// seen, when an incoming message landed in the open conversation.
    pub fn apply_event(&mut self, event: ServerEvent) -> Option<MessageId> {
        match event {
            ServerEvent::PresenceRosterChanged(roster) => {
                self.online = roster.online.into_iter().collect();
                None
            }
            ServerEvent::MessageDelivered(message) => self.apply_incoming(message),
        }
    }

    fn apply_incoming(&mut self, message: Message) -> Option<MessageId> {
        let me = self.me;
        if let Some(active) = self.active.as_mut().filter(|a| a.view.involves(&message)) {
            let ack = (message.recipient_id == me && !message.seen).then_some(message.id);
            if active.loading {
                active.pending.push(message.clone());
            }
            active.view.push(message);
            return ack;
        }

        if message.recipient_id == me {
            *self.unseen.entry(message.sender_id).or_default() += 1;
        }
        None
    }

    /// Record our own message from the send response.
    pub fn apply_sent(&mut self, message: Message) -> bool {
        match self.active.as_mut().filter(|a| a.view.involves(&message)) {
            Some(active) => {
                if active.loading {
                    active.pending.push(message.clone());
                }
                active.view.push(message)
            }
            None => false,
        }
    }

    pub fn send_failed(&mut self, peer: UserId, reason: impl Into<String>) {
        self.notices.push_back(Notice::SendFailed {
            peer,
            reason: reason.into(),
        });
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }
}
