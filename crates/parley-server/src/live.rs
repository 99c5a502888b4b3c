//! Live connection endpoint.
//!
//! `GET /ws?userId=<id>` upgrades to a WebSocket.  The socket task registers
//! a [`LiveHandle`], forwards queued [`ServerEvent`]s as JSON text frames,
//! and refreshes liveness on every inbound frame.  It unregisters its own
//! handle on the way out, whichever way the connection ends.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use parley_shared::protocol::ClientEvent;
use parley_shared::types::UserId;

use crate::api::{known_user, AppState};
use crate::error::ServerError;
use crate::registry::LiveHandle;

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<LiveQuery>,
) -> Result<Response, ServerError> {
    let user_id = known_user(&state, query.user_id.as_deref()).await?;
    debug!(user = %user_id, "Live connection upgrade requested");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user_id, state)))
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut outbound) = LiveHandle::channel(user_id, state.config.event_buffer);
    let conn_id = handle.conn_id();

    // Last writer wins.  The registry signals the replaced socket, which then
    // unregisters nothing because its conn id no longer matches.
    state.registry.register(handle.clone());
    info!(user = %user_id, conn = %conn_id, "Live connection opened");

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { break };
                match event.to_json() {
                    Ok(json) => {
                        if sink.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, event = event.name(), "Failed to encode live event"),
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle.touch();
                        match ClientEvent::from_json(text.as_str()) {
                            Ok(ClientEvent::Heartbeat) => {}
                            Err(e) => debug!(conn = %conn_id, error = %e, "Ignoring unknown client frame"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => handle.touch(),
                    Some(Err(e)) => {
                        warn!(conn = %conn_id, error = %e, "Live connection error");
                        break;
                    }
                }
            }
            _ = handle.evicted() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    state.registry.unregister(user_id, conn_id);
    info!(user = %user_id, conn = %conn_id, "Live connection closed");
}
