//! Run identity, status and output fragments.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run identifier.
pub type RunId = Uuid;

/// Status of a submitted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, request not yet handed to the connection.
    Pending,
    /// Request sent, output may arrive.
    Running,
    /// Backend reported completion.
    Completed,
    /// Superseded or lost its connection.
    Aborted,
}

impl RunStatus {
    /// Pending or Running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Completed or Aborted. No transition leaves a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Aborted)
                | (Self::Running, Self::Completed | Self::Aborted)
        )
    }
}

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// A newer run replaced it.
    Superseded { by: RunId },
    /// The connection left `Open` while the run was active.
    ConnectionLost,
}

/// One chunk of output belonging to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFragment {
    /// Run this fragment belongs to.
    pub run_id: RunId,
    /// Position within the run, starting at 0.
    pub sequence: u64,
    /// Output text.
    pub payload: String,
}

impl OutputFragment {
    /// Create a fragment.
    #[must_use]
    pub fn new(run_id: RunId, sequence: u64, payload: impl Into<String>) -> Self {
        Self {
            run_id,
            sequence,
            payload: payload.into(),
        }
    }
}
