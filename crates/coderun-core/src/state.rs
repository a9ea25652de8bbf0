//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the backend connection.
///
/// Owned by the connection manager. Only `Open` permits sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection attempted yet.
    #[default]
    Disconnected,
    /// A transport is being opened.
    Connecting,
    /// Transport is open.
    Open,
    /// Explicit close requested, waiting for the transport to wind down.
    Closing,
    /// Transport closed.
    Closed,
    /// The last open attempt failed.
    Failed,
}

impl ConnectionState {
    /// Whether sends are permitted in this state.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether `connect()` starts a fresh attempt from this state.
    #[must_use]
    pub const fn accepts_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }

    /// Lowercase name, as used in logs and serialized form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

/// A state together with its position in the transition sequence.
///
/// `serial` starts at 0 for the initial `Disconnected` state and grows by one
/// per transition, so two observations can be ordered even when delivered
/// through different paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// The state entered.
    pub state: ConnectionState,
    /// Transition number.
    pub serial: u64,
}

impl StateChange {
    /// Create a state observation.
    #[must_use]
    pub const fn new(state: ConnectionState, serial: u64) -> Self {
        Self { state, serial }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
