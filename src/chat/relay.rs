//! Relay server core — accept loop, per-connection tasks, packet dispatch.
//!
//! Every node runs one of these. Connections are TLS-wrapped, framed by
//! [`PacketCodec`], and fan frames out to each other through per-connection
//! mpsc channels. Dispatch encodes each outbound packet once and clones the
//! resulting `Bytes` per recipient.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::sleep;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::cache::MessageCache;
use super::codec::{self, CodecError, PacketCodec};
use super::config::ClientConfig;
use super::packet::{Packet, RequestRange};
use super::registry::{NodeRegistry, UsernameRegistry};
use super::tls::{self, TlsError};

/// How long to wait before retrying a failed bind.
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(5);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Handle to push pre-encoded frames at a connected peer.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub addr: SocketAddr,
    /// Username this connection claimed, once it has.
    pub username: Option<String>,
    pub tx: mpsc::UnboundedSender<Bytes>,
}

/// Shared relay state.
pub struct RelayState {
    /// Live connections: connection id → sender handle.
    pub connections: HashMap<u64, ConnectionHandle>,
    pub usernames: UsernameRegistry,
    pub nodes: NodeRegistry,
    pub cache: MessageCache,
    /// Identity the relay signs its own notices with.
    pub identity: ClientConfig,
}

/// Shared, thread-safe relay state.
pub type SharedState = Arc<RwLock<RelayState>>;

pub fn new_state(identity: ClientConfig) -> SharedState {
    Arc::new(RwLock::new(RelayState {
        connections: HashMap::new(),
        usernames: UsernameRegistry::new(),
        nodes: NodeRegistry::new(),
        cache: MessageCache::new(),
        identity,
    }))
}

/// What the dispatcher decided about the connection that sent a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Close,
}

/// Runs the relay on `port` until shutdown. The bind is retried every
/// [`BIND_RETRY_INTERVAL`] so a node restarting into a lingering socket
/// eventually comes up; `up_tx` (when given) flips to true once listening.
pub async fn serve(
    state: SharedState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
    up_tx: Option<watch::Sender<bool>>,
) -> Result<(), RelayError> {
    let acceptor = tls::build_acceptor()?;

    let listener = loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => break listener,
            Err(e) => {
                warn!(port, "bind failed: {e}, retrying");
                tokio::select! {
                    _ = sleep(BIND_RETRY_INTERVAL) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        }
    };

    info!(port, "relay listening");
    if let Some(tx) = &up_tx {
        let _ = tx.send(true);
    }

    let result = accept_loop(listener, acceptor, state, shutdown).await;
    if let Some(tx) = &up_tx {
        let _ = tx.send(false);
    }
    result
}

/// Accept loop over an already-bound listener.
pub async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                info!(%addr, "new connection");
                let acceptor = acceptor.clone();
                let state = Arc::clone(&state);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    // A failed handshake only costs this connection.
                    let stream = match acceptor.accept(socket).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(%addr, "tls handshake failed: {e}");
                            return;
                        }
                    };
                    if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                        warn!(%addr, "connection error: {e}");
                    }
                    info!(%addr, "disconnected");
                });
            }
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single TLS connection until it closes or shutdown.
async fn handle_connection(
    stream: TlsStream<TcpStream>,
    addr: SocketAddr,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let cipher = stream
        .get_ref()
        .1
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()))
        .unwrap_or_else(|| "unknown".to_string());

    let mut framed = Framed::new(stream, PacketCodec::default());

    // Register before the banner goes out, so a peer that has seen the
    // banner is guaranteed to be reachable by broadcasts.
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    state.write().await.connections.insert(
        conn_id,
        ConnectionHandle {
            addr,
            username: None,
            tx,
        },
    );

    // Welcome banner, signed by the relay itself.
    let banner = {
        let st = state.read().await;
        [
            Packet::data(
                &st.identity,
                format!("Welcome to {} secure chat!", tls::local_hostname()),
            ),
            Packet::data(
                &st.identity,
                format!("Your session is protected by {cipher} cipher suite."),
            ),
        ]
    };

    let mut result = Ok(());
    for packet in banner {
        if let Err(e) = framed.send(packet).await {
            result = Err(RelayError::Codec(e));
            break;
        }
    }

    if result.is_ok() {
        result = loop {
            tokio::select! {
                frame = framed.next() => {
                    let packet = match frame {
                        Some(Ok(packet)) => packet,
                        Some(Err(e)) => {
                            warn!(%addr, "frame error: {e}");
                            break Ok(());
                        }
                        None => break Ok(()), // Connection closed.
                    };
                    match handle_packet(&state, conn_id, packet).await {
                        Ok(Disposition::Keep) => {}
                        Ok(Disposition::Close) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }

                // Frames fanned out from other connections.
                Some(frame) = rx.recv() => {
                    if let Err(e) = framed.send(frame).await {
                        break Err(RelayError::Codec(e));
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };
    }

    // Clean up on disconnect: drop the handle, free the username.
    let mut st = state.write().await;
    if let Some(username) = st
        .connections
        .remove(&conn_id)
        .and_then(|conn| conn.username)
    {
        st.usernames.release(&username);
        info!(%addr, %username, "username released");
    }

    result
}

/// Dispatch one inbound packet. Returns whether the sending connection
/// should stay open.
pub async fn handle_packet(
    state: &SharedState,
    conn_id: u64,
    packet: Packet,
) -> Result<Disposition, RelayError> {
    match packet {
        Packet::Data(message) => {
            let mut st = state.write().await;

            if message.is_termination() {
                let notice = server_notice(
                    &st.identity,
                    format!("{} has decided to leave :(", message.username),
                )?;
                broadcast_frame(&st, Some(conn_id), &notice);
                st.usernames.release(&message.username);
                return Ok(Disposition::Close);
            }

            // Relay only messages this node hasn't seen recently.
            if st.cache.insert_if_absent(message.clone()) {
                let frame = codec::encode_frame(&Packet::Data(message))?;
                broadcast_frame(&st, Some(conn_id), &frame);
            } else {
                debug!(key = %message.key(), "duplicate dropped");
            }
        }

        Packet::NewUser { username, id, is_node } => {
            let mut st = state.write().await;

            if is_node {
                if let Some(addr) = st.connections.get(&conn_id).map(|c| c.addr) {
                    st.nodes.upsert(id.clone(), addr.ip().to_string());
                    info!(node = %id, %addr, "node announced");
                }
                let snapshot = Packet::Servers {
                    servers: st.nodes.snapshot(),
                };
                let frame = codec::encode_frame(&snapshot)?;
                broadcast_frame(&st, None, &frame);
            }

            if st.usernames.claim(&username, &id) {
                if let Some(conn) = st.connections.get_mut(&conn_id) {
                    conn.username = Some(username.clone());
                }
                let notice =
                    server_notice(&st.identity, format!("{username} joined the chat."))?;
                broadcast_frame(&st, None, &notice);
            } else {
                // Only the announcer learns about the collision.
                let notice =
                    server_notice(&st.identity, format!("{username} already exists!"))?;
                send_frame(&st, conn_id, notice);
            }
        }

        Packet::DataRequest { id } => match RequestRange::parse(&id) {
            Ok(range) => {
                let mut st = state.write().await;
                let found = st.cache.backfill(&range.origin, range.low, range.high);
                if !found.is_empty() {
                    let frame = codec::encode_frame(&Packet::package(found))?;
                    send_frame(&st, conn_id, frame);
                }
            }
            Err(e) => debug!(%id, "malformed backfill request dropped: {e}"),
        },

        Packet::DataPackage { messages } => {
            // Backfilled history only refills the cache; it never re-enters
            // the broadcast path.
            let mut st = state.write().await;
            for message in messages {
                st.cache.insert(message);
            }
        }

        Packet::Ping { load, .. } => {
            if load.is_none() {
                let st = state.read().await;
                let frame = codec::encode_frame(&Packet::ping())?;
                send_frame(&st, conn_id, frame);
            }
        }

        // Relays only originate these; one arriving inbound is a peer
        // confusion we ignore.
        Packet::Servers { .. } => {
            debug!("ignoring inbound Servers snapshot");
        }
    }

    Ok(Disposition::Keep)
}

fn server_notice(identity: &ClientConfig, text: String) -> Result<Bytes, CodecError> {
    codec::encode_frame(&Packet::data(identity, text))
}

/// Fan a pre-encoded frame out to every connection except `skip`.
pub fn broadcast_frame(state: &RelayState, skip: Option<u64>, frame: &Bytes) {
    for (id, conn) in &state.connections {
        if Some(*id) == skip {
            continue;
        }
        let _ = conn.tx.send(frame.clone());
    }
}

/// Push a pre-encoded frame at one connection, if it is still live.
pub fn send_frame(state: &RelayState, conn_id: u64, frame: Bytes) {
    if let Some(conn) = state.connections.get(&conn_id) {
        let _ = conn.tx.send(frame);
    }
}
