//! # parley-server
//!
//! Chat server for parley.
//!
//! - **Connection registry** of who is online, one live connection per user
//! - **Presence broadcaster** pushing the full roster after every change
//! - **Delivery pipeline** that validates, uploads media, persists and then
//!   pushes each message to its recipient
//! - **REST API** (axum) for users, history, sending and seen-marking
//! - **Live endpoint** carrying server events over a WebSocket

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod live;
pub mod media_store;
pub mod presence;
pub mod registry;

pub use api::{build_router, serve, AppState};
pub use config::ServerConfig;
pub use delivery::{Delivery, DeliveryError, DeliveryPipeline, PushOutcome, SendRequest};
pub use error::ServerError;
pub use registry::{ConnectionRegistry, LiveHandle, PushError};
