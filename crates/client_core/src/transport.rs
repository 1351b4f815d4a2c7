use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerFrame};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ChatError, ChatResult};

/// What the transport delivers upward, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(ServerFrame),
    /// The connection ended; `None` for an orderly close.
    Closed(Option<String>),
}

/// One established connection: a frame sink, an event source, and the
/// background tasks that drive the socket.
pub struct ChannelLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl ChannelLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientFrame>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }
}

/// Opens the bidirectional connection used by a conversation channel.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> ChatResult<ChannelLink>;
}

pub struct MissingChannelConnector;

#[async_trait]
impl ChannelConnector for MissingChannelConnector {
    async fn connect(&self) -> ChatResult<ChannelLink> {
        Err(ChatError::Transport("live channel is unavailable".into()))
    }
}

/// JSON frames over a WebSocket.
pub struct WebSocketConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self) -> ChatResult<ChannelLink> {
        let connect = connect_async(self.url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                ChatError::Transport(format!(
                    "timed out after {:?} connecting to {}",
                    self.connect_timeout, self.url
                ))
            })?
            .map_err(|err| {
                ChatError::Transport(format!("failed to connect websocket {}: {err}", self.url))
            })?;
        info!(url = %self.url, "transport: websocket connected");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(
                            event = frame.event_name(),
                            "transport: failed to encode frame: {err}"
                        );
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("transport: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(TransportEvent::Frame(frame)).is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!("transport: invalid server event: {err}"),
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty());
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        reason = Some(format!("websocket receive failed: {err}"));
                        break;
                    }
                }
            }
            debug!(?reason, "transport: websocket reader finished");
            let _ = inbound_tx.send(TransportEvent::Closed(reason));
        });

        Ok(ChannelLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![writer, reader],
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
