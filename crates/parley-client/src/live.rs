//! Live connection to the server.
//!
//! One background task owns the socket: it decodes server events into a
//! bounded channel and sends a heartbeat frame on a fixed interval.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use parley_shared::constants::{EVENT_BUFFER, HEARTBEAT_INTERVAL_SECS};
use parley_shared::protocol::{ClientEvent, ServerEvent};

use crate::error::Result;

pub struct LiveConnection {
    events: mpsc::Receiver<ServerEvent>,
    task: JoinHandle<()>,
}

impl LiveConnection {
    /// Next server event, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn connect(url: &str) -> Result<LiveConnection> {
    connect_with_heartbeat(url, Duration::from_secs(HEARTBEAT_INTERVAL_SECS)).await
}

pub async fn connect_with_heartbeat(url: &str, heartbeat: Duration) -> Result<LiveConnection> {
    let (ws, _) = connect_async(url).await?;
    info!("Live connection established");

    let heartbeat_frame = ClientEvent::Heartbeat.to_json()?;
    let (tx, events) = mpsc::channel(EVENT_BUFFER);
    let (mut sink, mut stream) = ws.split();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sink.send(WsMessage::Text(heartbeat_frame.clone().into())).await {
                        warn!(error = %e, "Heartbeat failed");
                        break;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_json(text.as_str()) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!(error = %e, "Ignoring unknown server frame"),
                        },
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Live connection error");
                            break;
                        }
                    }
                }
            }
        }
        info!("Live connection closed");
    });

    Ok(LiveConnection { events, task })
}
