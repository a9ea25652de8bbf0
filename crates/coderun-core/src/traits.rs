//! Traits at the transport and channel seams.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{ChannelError, ConnectionState, StateChange, TransportError};

/// Event reported by an open transport link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Text message from the backend.
    Message(String),
    /// Non-fatal transport error. The link may still close afterwards.
    Error(String),
    /// The link closed. No further events follow.
    Closed { reason: Option<String> },
}

/// Frame queued for the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Text message.
    Text(String),
    /// Request an orderly close.
    Close,
}

/// Cloneable sending half of a transport link.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl LinkSender {
    /// Queue a text message.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` if the link is gone.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(OutboundFrame::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    /// Request an orderly close. A link already gone is not an error.
    pub fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }
}

/// One open connection produced by [`Transport::open`].
///
/// Holding the link means the transport reported open. Events are delivered
/// in the order the transport received them.
#[derive(Debug)]
pub struct TransportLink {
    sender: LinkSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Assemble a link from its outbound queue and inbound event channel.
    #[must_use]
    pub const fn new(
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            sender: LinkSender { tx: outbound },
            events,
        }
    }

    /// Sending half.
    #[must_use]
    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Next event. A dropped event channel reads as `Closed`.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { reason: None })
    }
}

/// A way of reaching the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new link. Success is the "open" event.
    async fn open(&self) -> Result<TransportLink, TransportError>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

/// What the session layer needs from a connection: its state and a way to
/// hand it messages.
pub trait RunChannel: Send + Sync {
    /// Current state and its transition serial, read atomically.
    fn current(&self) -> StateChange;

    /// Current connection state.
    fn state(&self) -> ConnectionState {
        self.current().state
    }

    /// Fire-and-forget send.
    ///
    /// # Errors
    /// Returns `ChannelError::NotConnected` unless the state is `Open`.
    fn send(&self, message: String) -> Result<(), ChannelError>;
}
