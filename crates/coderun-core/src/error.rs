//! Error types.

use thiserror::Error;

use crate::ConnectionState;

/// Error returned when handing a message to the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Not connected (connection is {state})")]
    NotConnected { state: ConnectionState },
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Transport-level error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Transport closed")]
    Closed,
}

/// Malformed or unexpected inbound message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}
