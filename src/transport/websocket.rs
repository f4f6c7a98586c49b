//! WebSocket relay client
//!
//! Connects to the message relay and pumps text frames between the socket
//! and a [`SessionHandle`].

use crate::config::RelayConfig;
use crate::error::{MeshError, PlatformError};
use crate::platform::RelaySender;
use crate::runtime::SessionHandle;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Relay client
pub struct WebSocketRelay {
    /// Relay URL (ws:// or wss://)
    url: String,
    /// Pause between reconnect attempts
    reconnect_delay: Duration,
}

impl WebSocketRelay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            url: config.url.clone(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect once and pump frames until the socket closes
    pub async fn run(&self, session: &SessionHandle) -> Result<(), MeshError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| MeshError::Relay(format!("Failed to connect to {}: {}", self.url, e)))?;

        info!("Connected to relay {}", self.url);

        let (write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer_handle = tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let callbacks = session.connect(ChannelRelay {
            tx: outbound_tx.clone(),
        })?;
        callbacks.on_open();

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => callbacks.on_message(text.to_string()),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => callbacks.on_message(text),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame from relay"),
                },
                Ok(Message::Ping(ping)) => {
                    let _ = outbound_tx.send(Message::Pong(ping));
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Frame(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!("Relay socket error: {}", e);
                    callbacks.on_error(e.to_string());
                    break;
                }
            }
        }

        callbacks.on_close();
        info!("Relay {} closed", self.url);

        // The session keeps a sender clone, so the writer never drains on its own
        writer_handle.abort();
        Ok(())
    }

    /// Keep the relay connected until the session stops
    pub async fn run_forever(&self, session: &SessionHandle) {
        loop {
            match self.run(session).await {
                Ok(()) => {}
                Err(MeshError::SessionClosed) => return,
                Err(e) => warn!("{}", e),
            }
            debug!("Reconnecting to relay in {:?}", self.reconnect_delay);
            time::sleep(self.reconnect_delay).await;
        }
    }
}

/// Outbound side handed to the session
struct ChannelRelay {
    tx: mpsc::UnboundedSender<Message>,
}

impl RelaySender for ChannelRelay {
    fn send(&mut self, text: String) -> Result<(), PlatformError> {
        self.tx
            .send(Message::Text(text))
            .map_err(|_| PlatformError::new("relay socket closed"))
    }
}
