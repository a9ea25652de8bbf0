//! In-memory transport pair.
//!
//! `MemoryTransport` is the client side handed to a `ConnectionManager`;
//! `MemoryBackend` plays the remote end. Every successful `open()` yields a
//! fresh `MemoryPeer` on the backend side.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use async_trait::async_trait;
use coderun_core::{OutboundFrame, Transport, TransportError, TransportEvent, TransportLink};
use tokio::sync::mpsc;

use crate::protocol::{RunRequest, ServerFrame};

struct Shared {
    accepting: AtomicBool,
    open_attempts: AtomicU32,
}

/// Client half of the in-memory transport.
pub struct MemoryTransport {
    shared: Arc<Shared>,
    peer_tx: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryTransport {
    /// Create a connected transport/backend pair.
    #[must_use]
    pub fn new() -> (Self, MemoryBackend) {
        let shared = Arc::new(Shared {
            accepting: AtomicBool::new(true),
            open_attempts: AtomicU32::new(0),
        });
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let transport = Self {
            shared: Arc::clone(&shared),
            peer_tx,
        };
        let backend = MemoryBackend { shared, peer_rx };

        (transport, backend)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        self.shared.open_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();

        // Relay client frames to the peer; an orderly close ends the link
        // without needing the peer to participate.
        let relay_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = client_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if to_peer_tx.send(text).is_err() {
                            break;
                        }
                    }
                    OutboundFrame::Close => {
                        let _ = relay_events.send(TransportEvent::Closed {
                            reason: Some("closed by client".to_string()),
                        });
                        break;
                    }
                }
            }
        });

        let peer = MemoryPeer {
            client_rx: to_peer_rx,
            server_tx: events_tx,
        };
        self.peer_tx
            .send(peer)
            .map_err(|_| TransportError::Connect("backend dropped".to_string()))?;

        Ok(TransportLink::new(client_tx, events_rx))
    }

    fn endpoint(&self) -> String {
        "memory://backend".to_string()
    }
}

/// Remote side of the in-memory transport.
pub struct MemoryBackend {
    shared: Arc<Shared>,
    peer_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryBackend {
    /// Accept or refuse future `open()` calls.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Number of `open()` calls seen so far, refused ones included.
    #[must_use]
    pub fn open_attempts(&self) -> u32 {
        self.shared.open_attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next opened link.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peer_rx.recv().await
    }
}

/// Backend end of one open link.
///
/// Dropping the peer closes the link as seen by the client.
pub struct MemoryPeer {
    client_rx: mpsc::UnboundedReceiver<String>,
    server_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Next text message from the client.
    pub async fn recv(&mut self) -> Option<String> {
        self.client_rx.recv().await
    }

    /// Next message from the client, decoded as a run request.
    pub async fn recv_request(&mut self) -> Option<RunRequest> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Send a raw text message to the client.
    ///
    /// Returns false if the client side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.server_tx
            .send(TransportEvent::Message(text.into()))
            .is_ok()
    }

    /// Send an encoded frame to the client.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send_text(json),
            Err(e) => {
                tracing::error!("Failed to serialize frame: {e}");
                false
            }
        }
    }

    /// Report a transport error to the client without closing.
    pub fn send_error(&self, message: impl Into<String>) -> bool {
        self.server_tx
            .send(TransportEvent::Error(message.into()))
            .is_ok()
    }

    /// Drop the link as if the network failed.
    pub fn disconnect(self) {
        drop(self);
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        let _ = self.server_tx.send(TransportEvent::Closed {
            reason: Some("connection reset by peer".to_string()),
        });
    }
}
