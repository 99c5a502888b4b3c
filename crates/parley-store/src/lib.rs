//! # parley-store
//!
//! Durable message store for parley, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` with typed CRUD helpers, and the [`MessageStore`]
//! trait that the delivery pipeline consumes: `insert`, `query(filter)` and
//! `update_many(filter, patch)`.  [`SqliteStore`] implements the trait on top
//! of a mutex-guarded [`Database`].

pub mod database;
pub mod message_store;
pub mod messages;
pub mod migrations;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use message_store::{MessageFilter, MessagePatch, MessageStore, SqliteStore};
pub use parley_shared::models::{Message, User};
