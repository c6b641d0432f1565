//! Outbound connection pump — keeps one link to a relay node alive.
//!
//! The pump connects to the first candidate in the server list, announces
//! itself, then shuttles lines out and packets in until shutdown. Connect
//! failures back off and retry; they are never fatal. A write that stalls
//! past the timeout self-heals by terminating the session cleanly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep, timeout};
use tokio_rustls::client::TlsStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::codec::PacketCodec;
use super::config::ClientConfig;
use super::packet::{DataMessage, Packet, TERMINATION_KEYWORD};
use super::session::SessionEvent;
use super::tls::{self, TlsError};

/// Delay between failed connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How long a single outbound write may take before the link is presumed
/// wedged.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded waits for the exit handshake: flushing our goodbye, then the
/// peer closing its end.
const FLUSH_WAIT: Duration = Duration::from_secs(1);
const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Candidate relay hosts, in preference order. A `Servers` snapshot from
/// the network replaces the whole list; connect attempts always take the
/// current first entry, with no rotation on failure.
#[derive(Debug, Default)]
pub struct ServerList {
    entries: Mutex<Vec<String>>,
    changed: Notify,
}

impl ServerList {
    pub fn new(seed: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(vec![seed.into()]),
            changed: Notify::new(),
        })
    }

    pub fn first(&self) -> Option<String> {
        self.entries
            .lock()
            .expect("server list poisoned")
            .first()
            .cloned()
    }

    /// Replaces the list wholesale, waking anyone blocked on an empty list.
    pub fn replace(&self, entries: Vec<String>) {
        *self.entries.lock().expect("server list poisoned") = entries;
        self.changed.notify_waiters();
    }

    /// The current first candidate, waiting if the list is empty.
    pub async fn wait_first(&self) -> String {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before re-checking, so a replace() between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(first) = self.first() {
                return first;
            }
            notified.await;
        }
    }
}

/// Runs the connection pump until shutdown or a clean exit handshake.
///
/// `outbound` carries raw lines the user wants sent; `messages` receives
/// accepted chat messages; `events` sees every decoded inbound packet.
pub async fn run(
    config: Arc<ClientConfig>,
    servers: Arc<ServerList>,
    mut outbound: mpsc::Receiver<String>,
    messages: mpsc::UnboundedSender<DataMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TlsError> {
    let connector = tls::build_connector();

    'connect: loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let host = tokio::select! {
            host = servers.wait_first() => host,
            _ = shutdown.changed() => return Ok(()),
        };

        let stream = match tls::connect(&connector, &host, config.port()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%host, "connect attempt failed: {e}");
                tokio::select! {
                    _ = sleep(RETRY_INTERVAL) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
                continue;
            }
        };
        info!(%host, port = config.port(), "connected");

        let mut framed = Framed::new(stream, PacketCodec::default());
        if let Err(e) = framed.send(Packet::new_user(&config, false)).await {
            warn!(%host, "announcement failed: {e}");
            tokio::select! {
                _ = sleep(RETRY_INTERVAL) => {}
                _ = shutdown.changed() => return Ok(()),
            }
            continue;
        }

        // A line the pump injected itself (write-timeout self-heal) that
        // must be sent before anything new is taken from the queue.
        let mut pending: Option<String> = None;

        loop {
            let line = match pending.take() {
                Some(line) => Some(line),
                None => {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            // A dropped sender counts as shutdown.
                            if changed.is_err() || *shutdown.borrow() {
                                return Ok(());
                            }
                            None
                        }

                        line = outbound.recv() => match line {
                            Some(line) => Some(line),
                            // Producer gone: the session was dropped.
                            None => return Ok(()),
                        },

                        frame = framed.next() => match frame {
                            Some(Ok(packet)) => {
                                dispatch_inbound(packet, &servers, &messages, &events);
                                None
                            }
                            Some(Err(e)) => {
                                warn!(%host, "frame error: {e}");
                                continue 'connect;
                            }
                            None => {
                                info!(%host, "server closed connection");
                                continue 'connect;
                            }
                        },
                    }
                }
            };

            let Some(line) = line else { continue };
            let is_exit = line.trim().eq_ignore_ascii_case(TERMINATION_KEYWORD);
            let packet = Packet::data(&config, line);

            match timeout(WRITE_TIMEOUT, framed.send(packet)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(%host, "write failed: {e}");
                    continue 'connect;
                }
                Err(_) if is_exit => {
                    // Even the goodbye cannot be written; give the link up.
                    warn!(%host, "exit write stalled, dropping the link");
                    return Ok(());
                }
                Err(_) => {
                    // The link is wedged. End the session cleanly rather
                    // than queue into a black hole.
                    warn!(%host, "write stalled, terminating session");
                    pending = Some(TERMINATION_KEYWORD.to_string());
                    continue;
                }
            }

            if is_exit {
                // The codec also encodes pre-built Bytes frames, so the sink
                // item type must be pinned for flush.
                let _ = timeout(FLUSH_WAIT, SinkExt::<Packet>::flush(&mut framed)).await;
                let _ = timeout(CLOSE_WAIT, wait_peer_close(&mut framed)).await;
                info!(%host, "session ended");
                return Ok(());
            }
        }
    }
}

/// Routes one decoded inbound packet.
fn dispatch_inbound(
    packet: Packet,
    servers: &ServerList,
    messages: &mpsc::UnboundedSender<DataMessage>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    match packet {
        Packet::Servers { servers: list } => {
            servers.replace(list.iter().map(|entry| entry.location.clone()).collect());
            let _ = events.send(SessionEvent::Servers(list));
        }
        Packet::Data(message) => {
            let _ = messages.send(message.clone());
            let _ = events.send(SessionEvent::Message(message));
        }
        other => {
            let _ = events.send(SessionEvent::Packet(other));
        }
    }
}

/// Drains the stream until the peer closes or errors.
async fn wait_peer_close(framed: &mut Framed<TlsStream<TcpStream>, PacketCodec>) {
    while let Some(result) = framed.next().await {
        if result.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::packet::ServerEntry;
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    // ── ServerList ───────────────────────────────────────────────

    #[test]
    fn first_is_the_seed() {
        let list = ServerList::new("relay.example");
        assert_eq!(list.first(), Some("relay.example".to_string()));
    }

    #[test]
    fn replace_swaps_the_whole_list() {
        let list = ServerList::new("relay.example");
        list.replace(vec!["10.0.0.1".into(), "10.0.0.2".into()]);
        assert_eq!(list.first(), Some("10.0.0.1".to_string()));

        list.replace(vec![]);
        assert_eq!(list.first(), None);
    }

    #[tokio::test]
    async fn wait_first_blocks_until_replace() {
        let list = ServerList::new("seed");
        list.replace(vec![]);

        let waiter = {
            let list = Arc::clone(&list);
            tokio::spawn(async move { list.wait_first().await })
        };
        tokio::task::yield_now().await;
        list.replace(vec!["10.0.0.9".into()]);

        let first = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "10.0.0.9");
    }

    // ── Inbound dispatch ─────────────────────────────────────────

    #[test]
    fn servers_packet_replaces_list_and_raises_event() {
        let list = ServerList::new("seed");
        let (messages_tx, _messages_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let entries = vec![ServerEntry {
            id: "node-a".into(),
            location: "10.0.0.5".into(),
        }];
        dispatch_inbound(
            Packet::Servers {
                servers: entries.clone(),
            },
            &list,
            &messages_tx,
            &events_tx,
        );

        assert_eq!(list.first(), Some("10.0.0.5".to_string()));
        assert!(matches!(
            events_rx.try_recv(),
            Ok(SessionEvent::Servers(received)) if received == entries
        ));
    }

    #[test]
    fn data_packet_feeds_queue_and_events() {
        let list = ServerList::new("seed");
        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let message = DataMessage::new("alice", "o", 1, "hi");
        dispatch_inbound(
            Packet::Data(message.clone()),
            &list,
            &messages_tx,
            &events_tx,
        );

        assert_eq!(messages_rx.try_recv().unwrap(), message);
        assert!(matches!(
            events_rx.try_recv(),
            Ok(SessionEvent::Message(m)) if m == message
        ));
    }

    #[test]
    fn other_packets_only_raise_events() {
        let list = ServerList::new("seed");
        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        dispatch_inbound(Packet::ping(), &list, &messages_tx, &events_tx);

        assert!(messages_rx.try_recv().is_err());
        assert!(matches!(
            events_rx.try_recv(),
            Ok(SessionEvent::Packet(Packet::Ping { .. }))
        ));
    }

    // ── Reconnect backoff ────────────────────────────────────────

    #[tokio::test]
    async fn failed_connects_back_off_five_seconds() {
        // A listener that accepts and immediately hangs up, so every TLS
        // handshake fails and the pump goes through its retry path.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let attempts = Arc::new(Mutex::new(Vec::<Instant>::new()));
        let recorder = Arc::clone(&attempts);
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                recorder.lock().unwrap().push(Instant::now());
                drop(socket);
            }
        });

        let config = Arc::new(ClientConfig::new("alice", "long enough", port).unwrap());
        let servers = ServerList::new("127.0.0.1");
        let (_outbound_tx, outbound_rx) = mpsc::channel(1);
        let (messages_tx, _messages_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(run(
            config,
            servers,
            outbound_rx,
            messages_tx,
            events_tx,
            shutdown_rx,
        ));

        // Enough time for the first attempt plus two retries.
        sleep(Duration::from_secs(12)).await;
        let _ = shutdown_tx.send(true);
        let _ = timeout(Duration::from_secs(5), pump).await;

        let attempts = attempts.lock().unwrap();
        assert!(
            attempts.len() >= 2,
            "expected retries, got {} attempt(s)",
            attempts.len()
        );
        for pair in attempts.windows(2) {
            assert!(
                pair[1] - pair[0] >= RETRY_INTERVAL,
                "retry came early: {:?}",
                pair[1] - pair[0]
            );
        }
    }

    // ── Write-timeout self-heal ──────────────────────────────────

    #[tokio::test]
    async fn stalled_write_terminates_the_session() {
        // A peer that completes the TLS handshake and then never reads, so
        // the socket buffers fill and the pump's writes stall.
        let acceptor = tls::build_acceptor().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let stream = acceptor.accept(tcp).await.unwrap();
            sleep(Duration::from_secs(120)).await;
            drop(stream);
        });

        let config = Arc::new(ClientConfig::new("alice", "long enough", port).unwrap());
        let servers = ServerList::new("127.0.0.1");
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (messages_tx, _messages_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(run(
            config,
            servers,
            outbound_rx,
            messages_tx,
            events_tx,
            shutdown_rx,
        ));

        // Feed large lines until the pump wedges and gives up. The send
        // fails once the pump has returned and dropped its receiver.
        let line = "x".repeat(512 * 1024);
        tokio::spawn(async move { while outbound_tx.send(line.clone()).await.is_ok() {} });

        // The pump must end on its own: the stalled write injects the
        // termination keyword, and the stalled goodbye drops the link.
        let joined = timeout(Duration::from_secs(30), pump)
            .await
            .expect("pump did not end after its writes stalled");
        joined.unwrap().unwrap();
    }
}
