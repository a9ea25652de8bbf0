//! Reconnecting connection manager.
//!
//! `ConnectionManager` owns at most one transport link at a time and is the
//! only writer of `ConnectionState`. Observers receive every transition and
//! every inbound message through one ordered event stream each.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use coderun_core::{
    ChannelError, ConnectionState, LinkSender, ReconnectPolicy, RunChannel, StateChange,
    Transport, TransportEvent, TransportLink,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Event delivered to connection observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection entered a new state.
    StateChanged(StateChange),
    /// Text message from the backend.
    Message(String),
    /// Transport reported an error. State changes, if any, follow separately.
    TransportError(String),
}

struct Shared {
    current: StateChange,
    link: Option<LinkSender>,
    generation: u64,
    task: Option<JoinHandle<()>>,
    subscribers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl Shared {
    fn transition(&mut self, next: ConnectionState) {
        if self.current.state == next {
            return;
        }
        tracing::info!(from = %self.current.state, to = %next, "Connection state changed");
        self.current = StateChange::new(next, self.current.serial + 1);
        self.emit(ConnectionEvent::StateChanged(self.current));
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn retire_task(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    shared: Mutex<Shared>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` only if `generation` is still the live connection loop.
    fn apply<R>(&self, generation: u64, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        let mut shared = self.lock();
        (shared.generation == generation).then(|| f(&mut shared))
    }
}

/// How a link ended.
enum LinkEnd {
    /// `close()` was requested.
    Explicit,
    /// The link dropped on its own.
    Unexpected,
    /// A newer connection loop took over.
    Stale,
}

/// Manager for the single backend connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager over a transport. Nothing is opened until `connect()`.
    #[must_use]
    pub fn new(transport: impl Transport + 'static, policy: ReconnectPolicy) -> Self {
        Self::with_transport(Arc::new(transport), policy)
    }

    /// Create a manager over a shared transport.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                shared: Mutex::new(Shared {
                    current: StateChange::default(),
                    link: None,
                    generation: 0,
                    task: None,
                    subscribers: Vec::new(),
                }),
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().current.state
    }

    /// Subscribe to state changes and messages, in the order they happen.
    ///
    /// Only events after the call are delivered.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    /// `subscribe()` as a `Stream`.
    #[must_use]
    pub fn events(&self) -> UnboundedReceiverStream<ConnectionEvent> {
        UnboundedReceiverStream::new(self.subscribe())
    }

    /// Call `handler` for every state change. Must be called inside a tokio runtime.
    pub fn on_state_change<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(StateChange) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let ConnectionEvent::StateChanged(change) = event {
                    handler(change);
                }
            }
        })
    }

    /// Call `handler` for every inbound message. Must be called inside a tokio runtime.
    pub fn on_message<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(String) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let ConnectionEvent::Message(text) = event {
                    handler(text);
                }
            }
        })
    }

    /// Start connecting.
    ///
    /// Idempotent: does nothing while `Connecting`, `Open` or `Closing`.
    pub fn connect(&self) {
        let mut shared = self.inner.lock();
        if !shared.current.state.accepts_connect() {
            tracing::debug!(state = %shared.current.state, "connect() ignored");
            return;
        }

        shared.retire_task();
        let generation = shared.generation;
        shared.transition(ConnectionState::Connecting);

        let inner = Arc::clone(&self.inner);
        shared.task = Some(tokio::spawn(run_connection(inner, generation)));
    }

    /// Tear the connection down. No reconnect follows.
    pub fn close(&self) {
        let mut shared = self.inner.lock();
        match shared.current.state {
            ConnectionState::Open => {
                shared.transition(ConnectionState::Closing);
                match &shared.link {
                    Some(link) => link.close(),
                    None => {
                        shared.retire_task();
                        shared.transition(ConnectionState::Closed);
                    }
                }
            }
            // Closed also covers the backoff after an unexpected close.
            ConnectionState::Connecting | ConnectionState::Failed | ConnectionState::Closed => {
                shared.retire_task();
                shared.link = None;
                shared.transition(ConnectionState::Closed);
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {}
        }
    }

    /// Hand a text message to the open link.
    ///
    /// # Errors
    /// Returns `ChannelError::NotConnected` unless the state is `Open`, or
    /// `ChannelError::SendFailed` if the link vanished underneath.
    pub fn send(&self, message: String) -> Result<(), ChannelError> {
        let shared = self.inner.lock();
        let state = shared.current.state;
        if !state.is_open() {
            return Err(ChannelError::NotConnected { state });
        }
        let link = shared
            .link
            .as_ref()
            .ok_or(ChannelError::NotConnected { state })?;
        link.send_text(message)
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }
}

impl RunChannel for ConnectionManager {
    fn current(&self) -> StateChange {
        self.inner.lock().current
    }

    fn send(&self, message: String) -> Result<(), ChannelError> {
        Self::send(self, message)
    }
}

async fn run_connection(inner: Arc<Inner>, generation: u64) {
    let mut failures: u32 = 0;

    loop {
        tracing::info!(endpoint = %inner.transport.endpoint(), "Opening transport");
        match inner.transport.open().await {
            Ok(mut link) => {
                failures = 0;
                let sender = link.sender();
                let attached = inner.apply(generation, |shared| {
                    shared.link = Some(sender.clone());
                    shared.transition(ConnectionState::Open);
                });
                if attached.is_none() {
                    sender.close();
                    return;
                }

                match pump(&inner, generation, &mut link).await {
                    LinkEnd::Explicit | LinkEnd::Stale => return,
                    LinkEnd::Unexpected => {
                        tracing::warn!("Connection lost, reconnecting");
                    }
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, attempt = failures, "Transport open failed");
                if inner
                    .apply(generation, |shared| {
                        shared.transition(ConnectionState::Failed);
                    })
                    .is_none()
                {
                    return;
                }
                if !inner.policy.allows_attempt(failures) {
                    tracing::error!(attempts = failures, "Giving up on reconnecting");
                    return;
                }
            }
        }

        tokio::time::sleep(inner.policy.delay_for(failures.max(1))).await;

        let resumed = inner.apply(generation, |shared| {
            shared.transition(ConnectionState::Connecting);
        });
        if resumed.is_none() {
            return;
        }
    }
}

async fn pump(inner: &Inner, generation: u64, link: &mut TransportLink) -> LinkEnd {
    loop {
        let delivered = match link.next_event().await {
            TransportEvent::Message(text) => inner.apply(generation, |shared| {
                shared.emit(ConnectionEvent::Message(text));
            }),
            TransportEvent::Error(err) => {
                tracing::warn!(error = %err, "Transport error");
                inner.apply(generation, |shared| {
                    shared.emit(ConnectionEvent::TransportError(err));
                })
            }
            TransportEvent::Closed { reason } => {
                tracing::info!(reason = reason.as_deref().unwrap_or("none"), "Transport closed");
                return inner
                    .apply(generation, |shared| {
                        shared.link = None;
                        let explicit = shared.current.state == ConnectionState::Closing;
                        shared.transition(ConnectionState::Closed);
                        if explicit {
                            LinkEnd::Explicit
                        } else {
                            LinkEnd::Unexpected
                        }
                    })
                    .unwrap_or(LinkEnd::Stale);
            }
        };
        if delivered.is_none() {
            return LinkEnd::Stale;
        }
    }
}
