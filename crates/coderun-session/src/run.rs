//! A single submitted run.

use coderun_core::{AbortReason, OutputFragment, RunId, RunStatus};
use coderun_transport::RunRequest;
use serde::Serialize;

use crate::aggregator::{AppendOutcome, OutputAggregator};

/// One submission of source text and everything observed about it.
#[derive(Debug, Clone)]
pub struct RunSession {
    id: RunId,
    request: RunRequest,
    status: RunStatus,
    abort_reason: Option<AbortReason>,
    output: OutputAggregator,
}

impl RunSession {
    /// New pending run.
    #[must_use]
    pub fn new(id: RunId, request: RunRequest) -> Self {
        Self {
            id,
            request,
            status: RunStatus::Pending,
            abort_reason: None,
            output: OutputAggregator::new(id),
        }
    }

    /// Run identifier.
    #[must_use]
    pub const fn id(&self) -> RunId {
        self.id
    }

    /// Request as submitted.
    #[must_use]
    pub const fn request(&self) -> &RunRequest {
        &self.request
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Why the run was aborted, if it was.
    #[must_use]
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    /// Output received so far.
    #[must_use]
    pub const fn output(&self) -> &OutputAggregator {
        &self.output
    }

    /// Pending -> Running.
    pub fn mark_running(&mut self) -> bool {
        self.transition(RunStatus::Running)
    }

    /// Running -> Completed.
    pub fn complete(&mut self) -> bool {
        self.transition(RunStatus::Completed)
    }

    /// Pending/Running -> Aborted.
    pub fn abort(&mut self, reason: AbortReason) -> bool {
        let changed = self.transition(RunStatus::Aborted);
        if changed {
            self.abort_reason = Some(reason);
        }
        changed
    }

    /// Offer a fragment. Returns `None` once the run is terminal.
    pub fn append(&mut self, fragment: &OutputFragment) -> Option<AppendOutcome> {
        if self.status.is_terminal() {
            tracing::debug!(run_id = %self.id, status = ?self.status, "Run closed, fragment dropped");
            return None;
        }
        Some(self.output.append(fragment))
    }

    /// Point-in-time copy for the UI.
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            id: self.id,
            status: self.status,
            abort_reason: self.abort_reason,
            output: self.output.snapshot(),
            fragments: self.output.next_sequence(),
        }
    }

    fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::debug!(run_id = %self.id, from = ?self.status, to = ?next, "Ignoring run transition");
            return false;
        }
        tracing::debug!(run_id = %self.id, from = ?self.status, to = ?next, "Run status changed");
        self.status = next;
        true
    }
}

/// Immutable view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSnapshot {
    /// Run identifier.
    pub id: RunId,
    /// Status at the time of the snapshot.
    pub status: RunStatus,
    /// Abort reason, for aborted runs.
    pub abort_reason: Option<AbortReason>,
    /// Accepted output.
    pub output: String,
    /// Number of accepted fragments.
    pub fragments: u64,
}
