use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter};
use uuid::Uuid;

use parley_shared::types::{MessageId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::message_store::{MessageFilter, MessagePatch};
use parley_shared::models::Message;

const MESSAGE_COLUMNS: &str =
    "id, sender_id, recipient_id, text, media_url, created_at_us, seen";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, sender_id, recipient_id, text, media_url, created_at_us, seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.sender_id.to_string(),
                message.recipient_id.to_string(),
                message.text,
                message.media_url,
                message.created_at.timestamp_micros(),
                message.seen as i32,
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn get_message_by_id(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => crate::error::StoreError::NotFound,
                other => crate::error::StoreError::Sqlite(other),
            })
    }

    /// Messages matching `filter`, in persisted order (`created_at`, then id).
    pub fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let (clause, args) = filter.where_clause();
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE {clause}
             ORDER BY created_at_us ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Apply `patch` to every message matching `filter`.
    ///
    /// Returns the number of rows that actually changed, so repeating a
    /// `MarkSeen` with nothing left unseen returns zero.
    pub fn update_messages(&self, filter: &MessageFilter, patch: MessagePatch) -> Result<usize> {
        let (clause, args) = filter.where_clause();
        let sql = match patch {
            MessagePatch::MarkSeen => {
                format!("UPDATE messages SET seen = 1 WHERE ({clause}) AND seen = 0")
            }
        };
        let affected = self.conn().execute(&sql, params_from_iter(args.iter()))?;
        Ok(affected)
    }

    /// Unseen message counts addressed to `recipient`, keyed by sender.
    pub fn unseen_counts(&self, recipient: UserId) -> Result<HashMap<UserId, u64>> {
        let mut stmt = self.conn().prepare(
            "SELECT sender_id, COUNT(*)
             FROM messages
             WHERE recipient_id = ?1 AND seen = 0
             GROUP BY sender_id",
        )?;

        let rows = stmt.query_map(params![recipient.to_string()], |row| {
            let sender: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((sender, count))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (sender, count) = row?;
            counts.insert(UserId(Uuid::parse_str(&sender)?), count as u64);
        }
        Ok(counts)
    }
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let sender_str: String = row.get(1)?;
    let recipient_str: String = row.get(2)?;
    let text: Option<String> = row.get(3)?;
    let media_url: Option<String> = row.get(4)?;
    let created_us: i64 = row.get(5)?;
    let seen: i32 = row.get(6)?;

    let created_at = DateTime::<Utc>::from_timestamp_micros(created_us)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, created_us))?;

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        sender_id: UserId(parse_uuid(1, &sender_str)?),
        recipient_id: UserId(parse_uuid(2, &recipient_str)?),
        text,
        media_url,
        created_at,
        seen: seen != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::models::User;

    fn seed_users(db: &Database, n: usize) -> Vec<UserId> {
        (0..n)
            .map(|i| {
                let user = User {
                    id: UserId::new(),
                    full_name: format!("user-{i}"),
                    created_at: Utc::now(),
                };
                db.insert_user(&user).unwrap();
                user.id
            })
            .collect()
    }

    fn message(sender: UserId, recipient: UserId, at_us: i64, text: &str) -> Message {
        Message {
            id: MessageId::new(),
            sender_id: sender,
            recipient_id: recipient,
            text: Some(text.to_string()),
            media_url: None,
            created_at: DateTime::<Utc>::from_timestamp_micros(at_us).unwrap(),
            seen: false,
        }
    }

    #[test]
    fn insert_and_fetch_preserves_fields() {
        let db = Database::open_in_memory().unwrap();
        let ids = seed_users(&db, 2);
        let mut msg = message(ids[0], ids[1], 1_700_000_000_123_456, "hello");
        msg.media_url = Some("http://localhost/media/x.png".into());

        db.insert_message(&msg).unwrap();
        assert_eq!(db.get_message_by_id(msg.id).unwrap(), msg);
    }

    #[test]
    fn conversation_is_bidirectional_and_ordered() {
        let db = Database::open_in_memory().unwrap();
        let ids = seed_users(&db, 3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        db.insert_message(&message(b, a, 30, "third")).unwrap();
        db.insert_message(&message(a, b, 10, "first")).unwrap();
        db.insert_message(&message(a, c, 20, "elsewhere")).unwrap();
        db.insert_message(&message(b, a, 20, "second")).unwrap();

        let texts: Vec<_> = db
            .query_messages(&MessageFilter::Conversation(a, b))
            .unwrap()
            .into_iter()
            .map(|m| m.text.unwrap())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn mark_seen_only_touches_one_direction() {
        let db = Database::open_in_memory().unwrap();
        let ids = seed_users(&db, 2);
        let (a, b) = (ids[0], ids[1]);

        db.insert_message(&message(a, b, 1, "to b")).unwrap();
        db.insert_message(&message(a, b, 2, "to b again")).unwrap();
        db.insert_message(&message(b, a, 3, "to a")).unwrap();

        let filter = MessageFilter::UnseenFrom {
            sender: a,
            recipient: b,
        };
        assert_eq!(db.update_messages(&filter, MessagePatch::MarkSeen).unwrap(), 2);
        assert_eq!(db.update_messages(&filter, MessagePatch::MarkSeen).unwrap(), 0);

        let unseen_for_a = db.unseen_counts(a).unwrap();
        assert_eq!(unseen_for_a.get(&b), Some(&1));
        assert!(db.unseen_counts(b).unwrap().is_empty());
    }

    #[test]
    fn single_seen_requires_recipient() {
        let db = Database::open_in_memory().unwrap();
        let ids = seed_users(&db, 2);
        let (a, b) = (ids[0], ids[1]);
        let msg = message(a, b, 1, "hi");
        db.insert_message(&msg).unwrap();

        let as_sender = MessageFilter::Single {
            id: msg.id,
            recipient: a,
        };
        assert_eq!(db.update_messages(&as_sender, MessagePatch::MarkSeen).unwrap(), 0);

        let as_recipient = MessageFilter::Single {
            id: msg.id,
            recipient: b,
        };
        assert_eq!(db.update_messages(&as_recipient, MessagePatch::MarkSeen).unwrap(), 1);
        assert!(db.get_message_by_id(msg.id).unwrap().seen);
    }

    #[test]
    fn empty_message_rejected_by_schema() {
        let db = Database::open_in_memory().unwrap();
        let ids = seed_users(&db, 2);
        let mut msg = message(ids[0], ids[1], 1, "x");
        msg.text = None;
        assert!(db.insert_message(&msg).is_err());
    }
}
