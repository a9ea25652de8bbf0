//! Transport layer for the coderun channel.
//!
//! Provides:
//! - Wire protocol (JSON run requests and output frames)
//! - `ConnectionManager` - Owns the live link and reconnects it
//! - In-memory transport pair
//! - WebSocket client transport (feature: websocket)

pub mod connection;
pub mod memory;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connection::{ConnectionEvent, ConnectionManager};
pub use memory::{MemoryBackend, MemoryPeer, MemoryTransport};
pub use protocol::{RunRequest, ServerFrame};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
