//! # parley-client
//!
//! Client side of parley.  [`ChatSession`] reconciles REST history with the
//! live event stream into one ordered, de-duplicated [`ConversationView`];
//! [`ChatClient`] drives it over the REST API and a live connection.

pub mod api;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod live;
pub mod session;

pub use api::ApiClient;
pub use client::ChatClient;
pub use config::ClientConfig;
pub use conversation::ConversationView;
pub use error::{ClientError, Result};
pub use session::{ChatSession, HistoryTicket, Notice};
