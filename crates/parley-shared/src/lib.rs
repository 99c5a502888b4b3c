//! # parley-shared
//!
//! Types shared by the parley server and client: identifiers, the persisted
//! message model, the live-event wire protocol, REST payloads and the media
//! data-URL codec.

pub mod constants;
pub mod error;
pub mod media;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use models::{Message, User};
pub use types::{MessageId, UserId};
