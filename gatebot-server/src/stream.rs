//! The long-lived connection to the Gerrit event stream.
//!
//! `StreamSupervisor` runs a `Disconnected → Connecting → Streaming`
//! machine that never gives up: a dropped connection is confirmed closed
//! and redialed forever under the configured [`ReconnectPolicy`]. Inside
//! `Streaming`, each received line is decoded as one event; a line that
//! does not decode is skipped, it never tears down the connection.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use gatebot_core::GerritEvent;

use crate::handlers::{dispatch, DispatchOutcome};
use crate::AppState;

/// Connection to the review server lost or unobtainable. Never fatal;
/// only drives the reconnect loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open event stream: {0}")]
    Connect(#[source] std::io::Error),
    #[error("event stream read failed: {0}")]
    Read(#[source] std::io::Error),
}

/// How long to wait before redialing after the stream drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Redial immediately. Fine when the transport runs its own
    /// keep-alive, as the SSH stream does.
    Immediate,
    /// Fixed delay between attempts.
    Fixed(Duration),
}

impl ReconnectPolicy {
    async fn wait(&self) {
        match self {
            ReconnectPolicy::Immediate => {}
            ReconnectPolicy::Fixed(delay) => tokio::time::sleep(*delay).await,
        }
    }
}

/// A dialable source of newline-delimited events.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn EventConnection>, TransportError>;
}

/// One live connection. `next_line` returns `Ok(None)` on clean EOF.
#[async_trait]
pub trait EventConnection: Send {
    async fn next_line(&mut self) -> Result<Option<String>, TransportError>;

    /// Confirm the underlying connection is fully closed. Called before
    /// the supervisor dials again.
    async fn close(&mut self);
}

const SSH_KEEPALIVE_OPTIONS: &[&str] =
    &["-o", "ServerAliveInterval=10", "-o", "ServerAliveCountMax=3"];

/// Streams `gerrit stream-events` over an ssh subprocess. The keep-alive
/// options surface a dead peer as EOF within about thirty seconds, which
/// is what lets the reconnect policy default to immediate redial.
pub struct SshEventSource {
    user: String,
    host: String,
    port: u16,
    key_path: PathBuf,
}

impl SshEventSource {
    pub fn new(user: &str, host: &str, port: u16, key_path: &Path) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            key_path: key_path.to_path_buf(),
        }
    }

    fn stream_args(&self) -> Vec<String> {
        let mut args: Vec<String> = SSH_KEEPALIVE_OPTIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend([
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            format!("{}@{}", self.user, self.host),
            "gerrit".to_string(),
            "stream-events".to_string(),
        ]);
        args
    }
}

#[async_trait]
impl EventSource for SshEventSource {
    async fn connect(&self) -> Result<Box<dyn EventConnection>, TransportError> {
        let mut child = Command::new("ssh")
            .args(self.stream_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(TransportError::Connect)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Connect(std::io::Error::other("ssh stdout not available"))
        })?;

        Ok(Box::new(SshConnection {
            child,
            lines: BufReader::new(stdout).lines(),
        }))
    }
}

struct SshConnection {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl EventConnection for SshConnection {
    async fn next_line(&mut self) -> Result<Option<String>, TransportError> {
        self.lines.next_line().await.map_err(TransportError::Read)
    }

    async fn close(&mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

enum StreamState {
    Disconnected,
    Connecting,
    Streaming(Box<dyn EventConnection>),
}

/// Owns the connection to the review server and feeds decoded events into
/// the router.
pub struct StreamSupervisor {
    source: Box<dyn EventSource>,
    policy: ReconnectPolicy,
}

impl StreamSupervisor {
    pub fn new(source: Box<dyn EventSource>, policy: ReconnectPolicy) -> Self {
        Self { source, policy }
    }

    /// Run forever. Reconnects without bound; only process shutdown stops
    /// this loop.
    pub async fn run(&self, state: Arc<AppState>) {
        let mut stream_state = StreamState::Disconnected;
        loop {
            stream_state = match stream_state {
                StreamState::Disconnected => {
                    self.policy.wait().await;
                    StreamState::Connecting
                }
                StreamState::Connecting => match self.source.connect().await {
                    Ok(connection) => {
                        info!("event stream connected");
                        StreamState::Streaming(connection)
                    }
                    Err(err) => {
                        warn!(error = %err, "event stream connect failed");
                        StreamState::Disconnected
                    }
                },
                StreamState::Streaming(mut connection) => {
                    stream_events(connection.as_mut(), &state).await;
                    connection.close().await;
                    info!("event stream disconnected");
                    StreamState::Disconnected
                }
            };
        }
    }
}

/// Pump the connection until EOF or a transport error.
async fn stream_events(connection: &mut dyn EventConnection, state: &AppState) {
    loop {
        match connection.next_line().await {
            Ok(Some(line)) => handle_line(state, &line).await,
            Ok(None) => {
                info!("event stream reached EOF");
                return;
            }
            Err(err) => {
                warn!(error = %err, "event stream read failed");
                return;
            }
        }
    }
}

/// Decode and dispatch one stream line. A single undecodable line is
/// logged and skipped.
async fn handle_line(state: &AppState, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    let event: GerritEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "skipping undecodable event line");
            return;
        }
    };

    debug!(event_type = %event.event_type, "received event");
    match dispatch(state, &event).await {
        DispatchOutcome::Handled => {}
        DispatchOutcome::Skipped(reason) => {
            debug!(event_type = %event.event_type, reason, "event skipped");
        }
        DispatchOutcome::NoHandler => {
            info!(event_type = %event.event_type, "no handler for event");
        }
        DispatchOutcome::Failed(err) => {
            error!(event_type = %event.event_type, error = %err, "event handler failed");
        }
    }
}
