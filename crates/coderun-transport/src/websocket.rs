//! WebSocket client transport.

use async_trait::async_trait;
use coderun_core::{
    ConnectionConfig, OutboundFrame, Transport, TransportError, TransportEvent, TransportLink,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Transport that opens a WebSocket to the execution backend.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// Create a transport for the given `ws://` or `wss://` URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Create a transport from connection config.
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.url.clone())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Forward queued frames to the socket
        let writer_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let (msg, closing) = match frame {
                    OutboundFrame::Text(text) => (Message::text(text), false),
                    OutboundFrame::Close => (Message::Close(None), true),
                };
                if let Err(e) = sink.send(msg).await {
                    tracing::error!("WebSocket send failed: {e}");
                    let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Read until the socket closes
        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events_tx
                            .send(TransportEvent::Message(text.as_str().to_owned()))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if events_tx.send(TransportEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.as_str().to_owned());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {e}");
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            };
            let _ = events_tx.send(TransportEvent::Closed { reason });
        });

        Ok(TransportLink::new(outbound_tx, events_rx))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
