use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionId};
use crate::errors::{Result, StreamError};
use crate::relay::StreamRelay;

/// Browser viewer: the write half of an upgraded WebSocket.
pub struct WsConnection {
    id: ConnectionId,
    sender: Mutex<SplitSink<WebSocket, Message>>,
    closed: Notify,
}

impl WsConnection {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: ConnectionId::new(),
            sender: Mutex::new(sender),
            closed: Notify::new(),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| StreamError::send(e.to_string()))
    }

    async fn close(&self, reason: &str) {
        // Wake the socket's read loop even if the close frame never gets out
        self.closed.notify_one();
        let mut sender = self.sender.lock().await;
        let frame = CloseFrame {
            code: close_code::ERROR,
            reason: reason.to_string().into(),
        };
        if let Err(e) = sender.send(Message::Close(Some(frame))).await {
            debug!("WebSocket {} already closed: {}", self.id, e);
        }
    }
}

/// Keeps one viewer subscribed to `locator` for as long as its socket lives.
pub async fn handle_socket(socket: WebSocket, relay: StreamRelay, camera: String, locator: String) {
    let (sender, mut receiver) = socket.split();
    let connection = Arc::new(WsConnection::new(sender));
    let connection_id = connection.id();

    info!("WebSocket client {} connected to camera '{}'", connection_id, camera);
    relay.subscribe(&locator, connection.clone());

    // Viewers only listen; incoming traffic just tells us the socket is alive
    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            _ = connection.closed.notified() => {
                debug!("Relay closed WebSocket client {}", connection_id);
                break;
            }
        };
        let Some(msg) = msg else {
            break;
        };
        match msg {
            Ok(Message::Text(text)) => {
                debug!("Received text message from {}: {}", connection_id, text);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
        }
    }

    relay.unsubscribe(&locator, connection_id);
    info!("WebSocket client {} disconnected from camera '{}'", connection_id, camera);
}
