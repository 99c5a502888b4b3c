//! The durable-store boundary consumed by the delivery pipeline.
//!
//! [`MessageStore`] is deliberately small: single, non-transactional
//! operations (`insert`, `query`, `update_many`) plus the user lookups the
//! pipeline needs for validation.  Implementations must be callable from
//! several threads at once; the pipeline runs them on the blocking pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use parley_shared::models::{Message, User};
use parley_shared::types::{MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Selects a set of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFilter {
    /// Every message between two users, in either direction.
    Conversation(UserId, UserId),
    /// Messages from `sender` to `recipient` not yet seen.
    UnseenFrom { sender: UserId, recipient: UserId },
    /// One message, provided `recipient` is its recipient.
    Single { id: MessageId, recipient: UserId },
}

impl MessageFilter {
    /// SQL `WHERE` fragment and its positional arguments.
    pub(crate) fn where_clause(&self) -> (&'static str, Vec<String>) {
        match self {
            Self::Conversation(a, b) => (
                "(sender_id = ?1 AND recipient_id = ?2) OR (sender_id = ?2 AND recipient_id = ?1)",
                vec![a.to_string(), b.to_string()],
            ),
            Self::UnseenFrom { sender, recipient } => (
                "sender_id = ?1 AND recipient_id = ?2 AND seen = 0",
                vec![sender.to_string(), recipient.to_string()],
            ),
            Self::Single { id, recipient } => (
                "id = ?1 AND recipient_id = ?2",
                vec![id.to_string(), recipient.to_string()],
            ),
        }
    }
}

/// The only mutation a persisted message admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePatch {
    MarkSeen,
}

pub trait MessageStore: Send + Sync {
    fn insert_user(&self, user: &User) -> Result<()>;

    fn user_exists(&self, id: UserId) -> Result<bool>;

    fn list_users(&self) -> Result<Vec<User>>;

    /// Durable commit point for a message.  Returns the stored record.
    fn insert(&self, message: Message) -> Result<Message>;

    fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    /// Returns how many messages changed state.
    fn update_many(&self, filter: &MessageFilter, patch: MessagePatch) -> Result<usize>;

    fn unseen_counts(&self, recipient: UserId) -> Result<HashMap<UserId, u64>>;
}

/// [`MessageStore`] over a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("database lock poisoned: {e}")))
    }
}

impl MessageStore for SqliteStore {
    fn insert_user(&self, user: &User) -> Result<()> {
        self.db()?.insert_user(user)
    }

    fn user_exists(&self, id: UserId) -> Result<bool> {
        self.db()?.user_exists(id)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        self.db()?.list_users()
    }

    fn insert(&self, message: Message) -> Result<Message> {
        self.db()?.insert_message(&message)?;
        Ok(message)
    }

    fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        self.db()?.query_messages(filter)
    }

    fn update_many(&self, filter: &MessageFilter, patch: MessagePatch) -> Result<usize> {
        self.db()?.update_messages(filter, patch)
    }

    fn unseen_counts(&self, recipient: UserId) -> Result<HashMap<UserId, u64>> {
        self.db()?.unseen_counts(recipient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn register(store: &SqliteStore, name: &str) -> UserId {
        let user = User {
            id: UserId::new(),
            full_name: name.into(),
            created_at: Utc::now(),
        };
        store.insert_user(&user).unwrap();
        user.id
    }

    #[test]
    fn insert_returns_stored_record() {
        let store = SqliteStore::in_memory().unwrap();
        let a = register(&store, "a");
        let b = register(&store, "b");

        let msg = Message {
            id: MessageId::new(),
            sender_id: a,
            recipient_id: b,
            text: Some("hi".into()),
            media_url: None,
            created_at: chrono::DateTime::from_timestamp_micros(42).unwrap(),
            seen: false,
        };
        let stored = store.insert(msg.clone()).unwrap();
        assert_eq!(stored, msg);
        assert_eq!(store.query(&MessageFilter::Conversation(b, a)).unwrap(), vec![msg]);
    }

    #[test]
    fn duplicate_id_is_an_error() {
        let store = SqliteStore::in_memory().unwrap();
        let a = register(&store, "a");
        let b = register(&store, "b");
        let msg = Message {
            id: MessageId::new(),
            sender_id: a,
            recipient_id: b,
            text: Some("once".into()),
            media_url: None,
            created_at: Utc::now(),
            seen: false,
        };
        store.insert(msg.clone()).unwrap();
        assert!(matches!(store.insert(msg), Err(StoreError::Sqlite(_))));
    }

    #[test]
    fn unknown_sender_violates_foreign_key() {
        let store = SqliteStore::in_memory().unwrap();
        let b = register(&store, "b");
        let msg = Message {
            id: MessageId::new(),
            sender_id: UserId::new(),
            recipient_id: b,
            text: Some("ghost".into()),
            media_url: None,
            created_at: Utc::now(),
            seen: false,
        };
        assert!(store.insert(msg).is_err());
    }
}
