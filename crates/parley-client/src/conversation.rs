//! Ordered, de-duplicated view of one conversation.

use std::collections::HashSet;

use parley_shared::types::{MessageId, UserId};
use parley_shared::Message;

/// Messages between the local user and one peer, keyed by id.
///
/// Live appends go to the tail.  A history snapshot replaces the whole
/// sequence; nothing is spliced.
#[derive(Debug, Clone)]
pub struct ConversationView {
    me: UserId,
    peer: UserId,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl ConversationView {
    pub fn new(me: UserId, peer: UserId) -> Self {
        Self {
            me,
            peer,
            messages: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn peer(&self) -> UserId {
        self.peer
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    /// Whether `message` belongs here, in either direction.
    pub fn involves(&self, message: &Message) -> bool {
        message.is_between(self.me, self.peer)
    }

    /// Append at the tail.  Returns `false` for foreign or already-present
    /// messages.
    pub fn push(&mut self, message: Message) -> bool {
        if !self.involves(&message) || !self.ids.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Replace the sequence with a snapshot.  Foreign records are dropped,
    /// duplicates collapse to one, the rest is put in display order.
    pub fn replace(&mut self, history: Vec<Message>) {
        let mut ids = HashSet::with_capacity(history.len());
        let mut messages: Vec<Message> = history
            .into_iter()
            .filter(|m| self.involves(m) && ids.insert(m.id))
            .collect();
        messages.sort_by(Message::display_cmp);

        self.ids = ids;
        self.messages = messages;
    }
}
