//! A complete chat session: one relay node plus one client pump.
//!
//! Every session is a full peer. `start` brings up an embedded relay on the
//! session's port and a client pump pointed at the seed host, then hands
//! back queue-based handles: `send` for outgoing lines, `next_message` for
//! accepted chat, and an event channel for everything else.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, warn};

use super::client::{self, ServerList};
use super::config::{ClientConfig, ConfigError};
use super::packet::{DataMessage, Packet, ServerEntry};
use super::relay;

/// How long `start` waits for the embedded relay to come up before
/// proceeding anyway (the bind retries in the background).
const START_WAIT: Duration = Duration::from_secs(5);

/// Hard bound on `stop`: tasks still running past this are a bug.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the network tells a session, in arrival order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An accepted chat message (also queued for `next_message`).
    Message(DataMessage),
    /// The candidate server list was replaced by a gossip snapshot.
    Servers(Vec<ServerEntry>),
    /// Any other decoded packet.
    Packet(Packet),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session is no longer connected")]
    Disconnected,
    #[error("session tasks did not stop within {STOP_TIMEOUT:?}")]
    StopTimeout,
}

/// A running chat session. Stop it before dropping; an unstopped session's
/// tasks end on their own once the runtime shuts down, but leave the
/// listener bound until then.
pub struct ChatSession {
    config: Arc<ClientConfig>,
    outbound_tx: mpsc::Sender<String>,
    messages_rx: mpsc::UnboundedReceiver<DataMessage>,
    shutdown_tx: watch::Sender<bool>,
    server_up: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl ChatSession {
    /// Starts a session: relay on `port`, client pump seeded with `host`.
    /// Returns the session and its event stream.
    pub async fn start(
        host: &str,
        username: &str,
        password: &str,
        port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let config = Arc::new(ClientConfig::new(username, password, port)?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Rendezvous queue: a sender blocks until the pump takes the line,
        // so callers see backpressure instead of silent buffering.
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(1);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (up_tx, mut up_rx) = watch::channel(false);

        let relay_state = relay::new_state(ClientConfig::server_identity());
        let relay_task = {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = relay::serve(relay_state, port, shutdown, Some(up_tx)).await {
                    error!("relay task failed: {e}");
                }
            })
        };

        let client_task = {
            let config = Arc::clone(&config);
            let servers = ServerList::new(host);
            tokio::spawn(async move {
                if let Err(e) = client::run(
                    config,
                    servers,
                    outbound_rx,
                    messages_tx,
                    events_tx,
                    shutdown_rx,
                )
                .await
                {
                    error!("client task failed: {e}");
                }
            })
        };

        // Wait for the listener; a contended port keeps retrying in the
        // background and the session still runs as a pure client.
        match timeout(START_WAIT, up_rx.wait_for(|up| *up)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => {
                warn!(port, "relay not up yet, continuing without a listener");
            }
        }

        Ok((
            Self {
                config,
                outbound_tx,
                messages_rx,
                shutdown_tx,
                server_up: up_rx,
                tasks: vec![relay_task, client_task],
                stopped: false,
            },
            events_rx,
        ))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether the embedded relay is currently listening.
    pub fn is_server_up(&self) -> bool {
        *self.server_up.borrow()
    }

    /// Queues one line for sending. Blocks until the pump takes it.
    pub async fn send(&self, line: impl Into<String>) -> Result<(), SessionError> {
        if self.stopped {
            return Err(SessionError::Disconnected);
        }
        self.outbound_tx
            .send(line.into())
            .await
            .map_err(|_| SessionError::Disconnected)
    }

    /// Next accepted chat message, or `None` once the pump has ended.
    pub async fn next_message(&mut self) -> Option<DataMessage> {
        self.messages_rx.recv().await
    }

    /// Stops both tasks. Idempotent; repeated calls are no-ops.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks.drain(..) {
            match timeout(STOP_TIMEOUT, task).await {
                Ok(_) => {}
                Err(_) => return Err(SessionError::StopTimeout),
            }
        }
        Ok(())
    }
}
