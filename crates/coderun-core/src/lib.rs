//! Core types for the coderun execution-session channel.
//!
//! This crate provides the building blocks shared by the transport and
//! session layers:
//! - `ConnectionState` - Lifecycle of the backend connection
//! - `RunId`, `RunStatus`, `OutputFragment` - Run bookkeeping types
//! - `ConnectionConfig` - Endpoint and reconnection settings
//! - `Transport` and `RunChannel` traits

pub mod config;
pub mod error;
pub mod run;
pub mod state;
pub mod traits;

pub use config::{ConnectionConfig, ReconnectPolicy};
pub use error::{ChannelError, ConfigError, ProtocolError, TransportError};
pub use run::{AbortReason, OutputFragment, RunId, RunStatus};
pub use state::{ConnectionState, StateChange};
pub use traits::{LinkSender, OutboundFrame, RunChannel, Transport, TransportEvent, TransportLink};
