//! Console client: connect, submit one program, stream its output.
//!
//! Usage: `coderun-console <source-file> [stdin-file]`
//!
//! The backend URL and reconnect policy come from the `CODERUN_*`
//! environment variables.
//!
//! Backends that never send a completion marker are handled with an idle
//! timeout: once output has started, `CODERUN_IDLE_MS` (default 3000) without
//! further output ends the run.

use std::{
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, bail};
use coderun_core::{AbortReason, ConnectionConfig, ConnectionState, RunId};
use coderun_session::{CoordinatorConfig, CoordinatorEvent, SessionCoordinator};
use coderun_transport::{ConnectionManager, WebSocketTransport};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: coderun-console <source-file> [stdin-file]";
const DEFAULT_IDLE_MS: u64 = 3000;

fn idle_limit(raw: Option<&str>) -> anyhow::Result<Duration> {
    let ms = match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid CODERUN_IDLE_MS: {raw:?}"))?,
        None => DEFAULT_IDLE_MS,
    };
    Ok(Duration::from_millis(ms))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so program output stays clean
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args_os().skip(1).map(PathBuf::from);
    let source_path = args.next().context(USAGE)?;
    let code = tokio::fs::read_to_string(&source_path)
        .await
        .with_context(|| format!("reading {}", source_path.display()))?;
    let user_input = match args.next() {
        Some(path) => Some(
            tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };

    let config = ConnectionConfig::from_env()?;
    let idle = idle_limit(std::env::var("CODERUN_IDLE_MS").ok().as_deref())?;
    tracing::info!(url = %config.url, "Using execution backend");

    let manager = ConnectionManager::new(
        WebSocketTransport::from_config(&config),
        config.reconnect.clone(),
    );
    let (coordinator, _event_loop) =
        SessionCoordinator::start(manager, CoordinatorConfig::default());
    let mut events = coordinator.subscribe();

    let outcome = tokio::select! {
        result = async {
            if !coordinator.connection_state().is_open() {
                wait_until_open(&mut events).await?;
            }
            let run_id = coordinator.submit_run_with_input(code, user_input)?;
            stream_run(&mut events, run_id, idle).await
        } => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    coordinator.channel().close();
    outcome
}

fn banner(state: ConnectionState) {
    match state {
        ConnectionState::Open => eprintln!("[connected]"),
        ConnectionState::Closed => eprintln!("[disconnected]"),
        ConnectionState::Failed => eprintln!("[connection failed, retrying]"),
        _ => {}
    }
}

async fn wait_until_open(
    events: &mut mpsc::UnboundedReceiver<CoordinatorEvent>,
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        if let CoordinatorEvent::ConnectionChanged(state) = event {
            banner(state);
            if state.is_open() {
                return Ok(());
            }
        }
    }
    bail!("coordinator stopped before connecting")
}

async fn stream_run(
    events: &mut mpsc::UnboundedReceiver<CoordinatorEvent>,
    id: RunId,
    idle: Duration,
) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    // Armed once output starts
    let mut deadline: Option<Duration> = None;
    loop {
        let next = match deadline {
            Some(limit) => match tokio::time::timeout(limit, events.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::debug!(run_id = %id, "Output idle, treating run as finished");
                    return Ok(());
                }
            },
            None => events.recv().await,
        };
        let Some(event) = next else {
            bail!("coordinator stopped during the run");
        };

        match event {
            CoordinatorEvent::Output { run_id, text, .. } if run_id == id => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
                deadline = Some(idle);
            }
            CoordinatorEvent::RunCompleted { run_id } if run_id == id => return Ok(()),
            CoordinatorEvent::RunAborted { run_id, reason } if run_id == id => match reason {
                AbortReason::ConnectionLost => bail!("connection lost before the run completed"),
                AbortReason::Superseded { by } => bail!("run superseded by {by}"),
            },
            CoordinatorEvent::ConnectionChanged(state) => banner(state),
            CoordinatorEvent::GapDetected {
                expected, received, ..
            } => {
                eprintln!("[output gap: expected fragment {expected}, got {received}]");
            }
            _ => {}
        }
    }
}
