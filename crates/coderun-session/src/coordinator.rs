//! Session coordinator.
//!
//! Keeps at most one run active. Submitting while a run is active supersedes
//! it; backend output is routed only to the active run, and anything naming
//! another run is dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use coderun_core::{
    AbortReason, ChannelError, ConnectionState, OutputFragment, RunChannel, RunId, StateChange,
};
use coderun_transport::{ConnectionEvent, ConnectionManager, RunRequest, ServerFrame};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{
    aggregator::AppendOutcome,
    history::{DEFAULT_HISTORY_LIMIT, RunHistory},
    run::{RunSession, RunSnapshot},
};

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Retired runs kept for inspection.
    pub history_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Notification for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Connection entered a new state.
    ConnectionChanged(ConnectionState),
    /// A new run became active. Its output starts empty.
    RunStarted { run_id: RunId },
    /// Output accepted for the active run.
    Output {
        run_id: RunId,
        sequence: u64,
        text: String,
    },
    /// The backend reported completion.
    RunCompleted { run_id: RunId },
    /// The run ended without completing. With `AbortReason::Superseded`, any
    /// further output for it is ignored.
    RunAborted { run_id: RunId, reason: AbortReason },
    /// A fragment skipped ahead and was dropped.
    GapDetected {
        run_id: RunId,
        expected: u64,
        received: u64,
    },
    /// An inbound message could not be understood and was dropped.
    ProtocolError { message: String },
}

struct ActiveRun {
    session: RunSession,
    /// Serial of the `Open` state the request was sent on.
    opened_at: u64,
}

struct CoordinatorState {
    active: Option<ActiveRun>,
    history: RunHistory,
    subscribers: Vec<mpsc::UnboundedSender<CoordinatorEvent>>,
}

impl CoordinatorState {
    fn publish(&mut self, events: Vec<CoordinatorEvent>) {
        for event in events {
            self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn retire_aborted(&mut self, mut session: RunSession, reason: AbortReason) -> CoordinatorEvent {
        session.abort(reason);
        self.history.push(session.snapshot());
        CoordinatorEvent::RunAborted {
            run_id: session.id(),
            reason,
        }
    }
}

/// Coordinator between the UI and the connection.
///
/// Generic over the channel so it can run against the real
/// `ConnectionManager` or anything else exposing state and send.
pub struct SessionCoordinator<C: RunChannel = ConnectionManager> {
    channel: C,
    state: Mutex<CoordinatorState>,
}

impl<C: RunChannel> SessionCoordinator<C> {
    /// Create a coordinator over a channel.
    #[must_use]
    pub fn new(channel: C, config: CoordinatorConfig) -> Self {
        Self {
            channel,
            state: Mutex::new(CoordinatorState {
                active: None,
                history: RunHistory::new(config.history_limit),
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The underlying channel.
    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Subscribe to coordinator events from now on.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CoordinatorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Submit source text for execution.
    ///
    /// # Errors
    /// Returns `ChannelError::NotConnected` if the connection is not open; in
    /// that case nothing changes.
    pub fn submit_run(&self, code: impl Into<String>) -> Result<RunId, ChannelError> {
        self.submit_run_with_input(code, None)
    }

    /// Submit source text together with stdin for the program.
    ///
    /// Any active run is aborted as superseded before the new one starts.
    ///
    /// # Errors
    /// Returns `ChannelError::NotConnected` if the connection is not open, or
    /// the channel's error if the request could not be handed over.
    pub fn submit_run_with_input(
        &self,
        code: impl Into<String>,
        user_input: Option<String>,
    ) -> Result<RunId, ChannelError> {
        let mut state = self.lock();
        let current = self.channel.current();
        if !current.state.is_open() {
            tracing::warn!(state = %current.state, "Run rejected, not connected");
            return Err(ChannelError::NotConnected {
                state: current.state,
            });
        }

        let run_id = Uuid::new_v4();
        let request = RunRequest::new(code)
            .with_user_input(user_input)
            .with_run_id(run_id);
        let payload = request
            .to_json()
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        let mut events = Vec::new();
        if let Some(previous) = state.active.take() {
            tracing::info!(run_id = %previous.session.id(), by = %run_id, "Superseding active run");
            events.push(
                state.retire_aborted(previous.session, AbortReason::Superseded { by: run_id }),
            );
        }

        let mut session = RunSession::new(run_id, request);
        events.push(CoordinatorEvent::RunStarted { run_id });

        let sent = self.channel.send(payload);
        match &sent {
            Ok(()) => {
                session.mark_running();
                tracing::info!(run_id = %run_id, "Run submitted");
                state.active = Some(ActiveRun {
                    session,
                    opened_at: current.serial,
                });
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Run request could not be sent");
                events.push(state.retire_aborted(session, AbortReason::ConnectionLost));
            }
        }

        state.publish(events);
        sent.map(|()| run_id)
    }

    /// Route one raw inbound message.
    ///
    /// Malformed messages are reported as `ProtocolError` events and otherwise
    /// ignored.
    ///
    /// Frames without a `run_id` always belong to the active run, so late
    /// output from a superseded run is only filtered out if the backend echoes
    /// the run token.
    pub fn handle_message(&self, raw: &str) {
        let frame = match ServerFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Protocol error, message dropped");
                self.lock().publish(vec![CoordinatorEvent::ProtocolError {
                    message: e.to_string(),
                }]);
                return;
            }
        };
        if frame.is_empty() {
            tracing::debug!("Ignoring message without output or completion");
            return;
        }

        let mut state = self.lock();
        let Some(active) = state.active.as_mut() else {
            tracing::debug!("No active run, message dropped");
            return;
        };
        let run_id = active.session.id();
        if let Some(target) = frame.run_id.filter(|target| *target != run_id) {
            tracing::debug!(run_id = %target, active = %run_id, "Message for retired run dropped");
            return;
        }

        let mut events = Vec::new();
        if let Some(text) = frame.output {
            let sequence = frame
                .seq
                .unwrap_or_else(|| active.session.output().next_sequence());
            let fragment = OutputFragment::new(run_id, sequence, text);
            match active.session.append(&fragment) {
                Some(AppendOutcome::Accepted) => events.push(CoordinatorEvent::Output {
                    run_id,
                    sequence,
                    text: fragment.payload,
                }),
                Some(AppendOutcome::Gap { expected, received }) => {
                    events.push(CoordinatorEvent::GapDetected {
                        run_id,
                        expected,
                        received,
                    });
                }
                Some(AppendOutcome::Duplicate | AppendOutcome::WrongRun) | None => {}
            }
        }

        if frame.done {
            if let Some(mut finished) = state.active.take() {
                finished.session.complete();
                tracing::info!(run_id = %run_id, "Run completed");
                state.history.push(finished.session.snapshot());
                events.push(CoordinatorEvent::RunCompleted { run_id });
            }
        }

        state.publish(events);
    }

    /// React to a connection state change.
    ///
    /// Leaving `Open` aborts the active run, unless the change predates the
    /// connection the run was sent on.
    pub fn handle_state_change(&self, change: StateChange) {
        let mut state = self.lock();
        let mut events = vec![CoordinatorEvent::ConnectionChanged(change.state)];

        if !change.state.is_open() {
            if let Some(lost) = state.active.take_if(|active| change.serial > active.opened_at) {
                tracing::warn!(run_id = %lost.session.id(), state = %change.state, "Connection lost during run");
                events.push(state.retire_aborted(lost.session, AbortReason::ConnectionLost));
            }
        }

        state.publish(events);
    }

    /// Dispatch one event from the connection.
    pub fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(change) => self.handle_state_change(change),
            ConnectionEvent::Message(raw) => self.handle_message(&raw),
            ConnectionEvent::TransportError(err) => {
                tracing::debug!(error = %err, "Transport error observed");
            }
        }
    }

    /// Snapshot of the active run.
    #[must_use]
    pub fn active_run(&self) -> Option<RunSnapshot> {
        self.lock()
            .active
            .as_ref()
            .map(|active| active.session.snapshot())
    }

    /// Output of the active run so far.
    #[must_use]
    pub fn active_output(&self) -> Option<String> {
        self.lock()
            .active
            .as_ref()
            .map(|active| active.session.output().snapshot())
    }

    /// Look up a run, active or retired.
    #[must_use]
    pub fn run(&self, id: RunId) -> Option<RunSnapshot> {
        let state = self.lock();
        state
            .active
            .as_ref()
            .filter(|active| active.session.id() == id)
            .map(|active| active.session.snapshot())
            .or_else(|| state.history.get(id).cloned())
    }

    /// Retired runs, newest first.
    #[must_use]
    pub fn history(&self) -> Vec<RunSnapshot> {
        self.lock().history.iter().cloned().collect()
    }
}

impl<C: RunChannel + 'static> SessionCoordinator<C> {
    /// Feed connection events into this coordinator until the stream ends.
    pub fn spawn_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_connection_event(event);
            }
            tracing::debug!("Connection event stream ended");
        })
    }
}

impl SessionCoordinator<ConnectionManager> {
    /// Wire a coordinator to a manager and start connecting.
    ///
    /// Subscribes before connecting so no transition is missed.
    #[must_use]
    pub fn start(manager: ConnectionManager, config: CoordinatorConfig) -> (Arc<Self>, JoinHandle<()>) {
        let events = manager.subscribe();
        let coordinator = Arc::new(Self::new(manager, config));
        let handle = Arc::clone(&coordinator).spawn_event_loop(events);
        coordinator.channel.connect();
        (coordinator, handle)
    }
}

#[cfg(test)]
mod tests {
    use coderun_core::RunStatus;
    use serde_json::Value;

    use super::*;

    struct FakeChannel {
        inner: Mutex<(StateChange, Vec<String>)>,
    }

    impl FakeChannel {
        fn open() -> Self {
            Self {
                inner: Mutex::new((StateChange::new(ConnectionState::Open, 2), Vec::new())),
            }
        }

        fn set_state(&self, state: ConnectionState) -> StateChange {
            let mut inner = self.inner.lock().unwrap();
            inner.0 = StateChange::new(state, inner.0.serial + 1);
            inner.0
        }

        fn sent(&self) -> Vec<Value> {
            let inner = self.inner.lock().unwrap();
            inner
                .1
                .iter()
                .map(|raw| serde_json::from_str(raw).unwrap())
                .collect()
        }
    }

    impl RunChannel for FakeChannel {
        fn current(&self) -> StateChange {
            self.inner.lock().unwrap().0
        }

        fn send(&self, message: String) -> Result<(), ChannelError> {
            let mut inner = self.inner.lock().unwrap();
            if !inner.0.state.is_open() {
                return Err(ChannelError::NotConnected {
                    state: inner.0.state,
                });
            }
            inner.1.push(message);
            Ok(())
        }
    }

    fn coordinator() -> SessionCoordinator<FakeChannel> {
        SessionCoordinator::new(FakeChannel::open(), CoordinatorConfig::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_run_a_then_run_b_scenario() {
        let coordinator = coordinator();

        let a = coordinator.submit_run("print('x')").unwrap();
        coordinator.handle_message(&format!(r#"{{"run_id":"{a}","seq":0,"output":"x\n"}}"#));
        coordinator.handle_message(&format!(r#"{{"run_id":"{a}","done":true}}"#));

        let run_a = coordinator.run(a).unwrap();
        assert_eq!(run_a.output, "x\n");
        assert_eq!(run_a.status, RunStatus::Completed);

        let a2 = coordinator.submit_run("print('x')").unwrap();
        let b = coordinator.submit_run("print('y')").unwrap();
        assert_eq!(coordinator.run(a2).unwrap().status, RunStatus::Aborted);

        // Late output from the superseded run
        coordinator.handle_message(&format!(r#"{{"run_id":"{a2}","seq":0,"output":"x\n"}}"#));
        coordinator.handle_message(&format!(r#"{{"run_id":"{b}","seq":0,"output":"y\n"}}"#));

        let run_b = coordinator.active_run().unwrap();
        assert_eq!(run_b.id, b);
        assert_eq!(run_b.status, RunStatus::Running);
        assert_eq!(run_b.output, "y\n");
        assert_eq!(coordinator.run(a2).unwrap().output, "");
    }

    #[test]
    fn test_supersede_emits_abort_before_start() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();

        let first = coordinator.submit_run("1").unwrap();
        let second = coordinator.submit_run("2").unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                CoordinatorEvent::RunStarted { run_id: first },
                CoordinatorEvent::RunAborted {
                    run_id: first,
                    reason: AbortReason::Superseded { by: second },
                },
                CoordinatorEvent::RunStarted { run_id: second },
            ]
        );
    }

    #[test]
    fn test_only_one_run_is_live_after_quick_submits() {
        let coordinator = coordinator();
        let ids: Vec<_> = (0..3)
            .map(|i| coordinator.submit_run(format!("print({i})")).unwrap())
            .collect();

        let live: Vec<_> = ids
            .iter()
            .filter_map(|id| coordinator.run(*id))
            .filter(|run| matches!(run.status, RunStatus::Running | RunStatus::Completed))
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, ids[2]);
    }

    #[test]
    fn test_submit_while_disconnected_changes_nothing() {
        let coordinator = coordinator();
        let first = coordinator.submit_run("1").unwrap();
        coordinator.channel().set_state(ConnectionState::Connecting);

        assert_eq!(
            coordinator.submit_run("2"),
            Err(ChannelError::NotConnected {
                state: ConnectionState::Connecting
            })
        );
        assert_eq!(coordinator.active_run().unwrap().id, first);
        assert_eq!(coordinator.channel().sent().len(), 1);
    }

    #[test]
    fn test_request_carries_code_input_and_token() {
        let coordinator = coordinator();
        let id = coordinator
            .submit_run_with_input("name = input()", Some("Ada\n".to_string()))
            .unwrap();

        let sent = coordinator.channel().sent();
        assert_eq!(sent[0]["code"], "name = input()");
        assert_eq!(sent[0]["userInput"], "Ada\n");
        assert_eq!(sent[0]["run_id"], id.to_string());
    }

    #[test]
    fn test_untagged_output_goes_to_active_run_in_order() {
        let coordinator = coordinator();
        coordinator.submit_run("for i in range(2): print(i)").unwrap();

        coordinator.handle_message(r#"{"output": "0\n"}"#);
        coordinator.handle_message(r#"{"output": "1\n"}"#);

        let run = coordinator.active_run().unwrap();
        assert_eq!(run.output, "0\n1\n");
        assert_eq!(run.fragments, 2);
    }

    #[test]
    fn test_untagged_frames_after_supersede_go_to_new_run() {
        let coordinator = coordinator();
        let first = coordinator.submit_run("print('x')").unwrap();
        let second = coordinator.submit_run("print('y')").unwrap();

        // Late reply for the first run, without a token
        coordinator.handle_message(r#"{"output": "x\n"}"#);
        coordinator.handle_message(r#"{"done": true}"#);

        let run = coordinator.run(second).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, "x\n");
        assert_eq!(coordinator.run(first).unwrap().output, "");
    }

    #[test]
    fn test_duplicate_and_gap_fragments_are_dropped() {
        let coordinator = coordinator();
        let id = coordinator.submit_run("x").unwrap();
        let mut rx = coordinator.subscribe();

        coordinator.handle_message(r#"{"seq": 0, "output": "a"}"#);
        coordinator.handle_message(r#"{"seq": 0, "output": "a"}"#);
        coordinator.handle_message(r#"{"seq": 2, "output": "c"}"#);

        assert_eq!(coordinator.active_output().as_deref(), Some("a"));
        assert_eq!(
            drain(&mut rx),
            vec![
                CoordinatorEvent::Output {
                    run_id: id,
                    sequence: 0,
                    text: "a".to_string()
                },
                CoordinatorEvent::GapDetected {
                    run_id: id,
                    expected: 1,
                    received: 2
                },
            ]
        );
    }

    #[test]
    fn test_completed_run_accepts_nothing_more() {
        let coordinator = coordinator();
        let id = coordinator.submit_run("x").unwrap();

        coordinator.handle_message(r#"{"output": "done\n", "done": true}"#);
        coordinator.handle_message(r#"{"output": "more"}"#);
        coordinator.handle_message(&format!(r#"{{"run_id":"{id}","seq":1,"output":"more"}}"#));

        assert!(coordinator.active_run().is_none());
        let run = coordinator.run(id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, "done\n");
    }

    #[test]
    fn test_malformed_message_reports_protocol_error() {
        let coordinator = coordinator();
        coordinator.submit_run("x").unwrap();
        let mut rx = coordinator.subscribe();

        coordinator.handle_message("{not json");
        coordinator.handle_message(r#"{"output": 5}"#);
        coordinator.handle_message(r#"{"output": "ok"}"#);

        let events = drain(&mut rx);
        let errors = events
            .iter()
            .filter(|e| matches!(e, CoordinatorEvent::ProtocolError { .. }))
            .count();
        assert_eq!(errors, 2);
        assert_eq!(coordinator.active_output().as_deref(), Some("ok"));
        assert_eq!(coordinator.connection_state(), ConnectionState::Open);
    }

    #[test]
    fn test_unrelated_message_is_tolerated() {
        let coordinator = coordinator();
        coordinator.submit_run("x").unwrap();
        let mut rx = coordinator.subscribe();

        coordinator.handle_message(r#"{"message": "WebSocket connected!"}"#);

        assert!(drain(&mut rx).is_empty());
        assert_eq!(coordinator.active_run().unwrap().status, RunStatus::Running);
    }

    #[test]
    fn test_connection_loss_aborts_once() {
        let coordinator = coordinator();
        let id = coordinator.submit_run("while True: pass").unwrap();
        let mut rx = coordinator.subscribe();

        let closed = coordinator.channel().set_state(ConnectionState::Closed);
        coordinator.handle_state_change(closed);
        let connecting = coordinator.channel().set_state(ConnectionState::Connecting);
        coordinator.handle_state_change(connecting);

        assert_eq!(
            drain(&mut rx),
            vec![
                CoordinatorEvent::ConnectionChanged(ConnectionState::Closed),
                CoordinatorEvent::RunAborted {
                    run_id: id,
                    reason: AbortReason::ConnectionLost
                },
                CoordinatorEvent::ConnectionChanged(ConnectionState::Connecting),
            ]
        );
        assert_eq!(coordinator.run(id).unwrap().status, RunStatus::Aborted);
    }

    #[test]
    fn test_state_change_from_before_submit_is_ignored() {
        let coordinator = coordinator();
        // Delivered late: the Connecting that preceded the current Open.
        let stale = StateChange::new(ConnectionState::Connecting, 1);
        let id = coordinator.submit_run("x").unwrap();

        coordinator.handle_state_change(stale);

        assert_eq!(coordinator.run(id).unwrap().status, RunStatus::Running);
    }

    #[test]
    fn test_history_is_bounded() {
        let coordinator = SessionCoordinator::new(
            FakeChannel::open(),
            CoordinatorConfig { history_limit: 2 },
        );
        for i in 0..5 {
            coordinator.submit_run(format!("{i}")).unwrap();
        }

        assert_eq!(coordinator.history().len(), 2);
        assert!(
            coordinator
                .history()
                .iter()
                .all(|run| run.status == RunStatus::Aborted)
        );
    }
}
