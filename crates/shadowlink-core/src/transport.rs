//! Encrypted session transport.
//!
//! Once negotiation hands over session keys and a confirmed path, a
//! dedicated task owns the session: it seals outbound messages, opens
//! inbound envelopes in arrival order, emits decrypted messages on the
//! node event stream, and runs the keepalive clock. Large messages are
//! chunked into `Fragment` envelopes with a final `Data` envelope;
//! strict sequence ordering means fragments reassemble without any
//! reordering logic.
//!
//! The task is the only owner of the session's cipher and counters, so
//! no cross-session locking exists anywhere. When it exits - explicit
//! disconnect, peer disconnect, keepalive expiry, or socket failure -
//! the key material is dropped (and zeroed) immediately and a `Closed`
//! status is emitted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sgp_core::relay::{RelayHeader, RelayPacketType, RELAY_HEADER_SIZE};
use sgp_core::{Envelope, EnvelopeKind};
use sgp_crypto::{SealError, SessionCipher, ShadowId};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{NodeEvent, PeerStatus};
use crate::peer::Route;

/// Payload bytes per envelope; keeps a sealed envelope inside a single
/// relay frame.
pub(crate) const DATA_CHUNK_BYTES: usize = 1024;

/// Transport-facing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("session closed")]
    Closed,

    #[error("no session for peer")]
    UnknownPeer,

    #[error("message exceeds {0} bytes")]
    TooLarge(usize),
}

/// Where a session's envelopes go on the wire.
#[derive(Debug, Clone)]
pub enum SessionPath {
    /// Straight UDP to the peer.
    Direct {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    /// Envelopes wrapped in relay Forward frames on a circuit.
    Relay {
        socket: Arc<UdpSocket>,
        relay: SocketAddr,
        circuit: Uuid,
    },
}

impl SessionPath {
    pub fn route(&self) -> Route {
        match self {
            Self::Direct { peer, .. } => Route::Direct(*peer),
            Self::Relay { relay, .. } => Route::Relay(*relay),
        }
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> std::io::Result<()> {
        let bytes = envelope
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        match self {
            Self::Direct { socket, peer } => {
                socket.send_to(&bytes, peer).await?;
            }
            Self::Relay {
                socket,
                relay,
                circuit,
            } => {
                let packet =
                    sgp_core::relay::encode_packet(RelayPacketType::Forward, *circuit, &bytes)
                        .map_err(|e| {
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                        })?;
                socket.send_to(&packet, relay).await?;
            }
        }
        Ok(())
    }
}

enum SessionCommand {
    Send(Vec<u8>),
    Disconnect,
}

/// Narrow handle the node keeps per live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub peer: ShadowId,
    pub route: Route,
    max_message_bytes: usize,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Queue an application message for sealing and transmission.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if data.len() > self.max_message_bytes {
            return Err(TransportError::TooLarge(self.max_message_bytes));
        }
        self.cmd_tx
            .send(SessionCommand::Send(data))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Ask the session to send a disconnect envelope and tear down.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Disconnect).await;
    }

    /// Whether the owning task has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

pub(crate) struct SessionParams {
    pub session_id: Uuid,
    pub peer: ShadowId,
    pub cipher: SessionCipher,
    pub path: SessionPath,
    pub events: broadcast::Sender<NodeEvent>,
    pub keepalive_interval: Duration,
    pub keepalive_deadline: Duration,
    pub max_message_bytes: usize,
}

/// Spawn the session task. Returns the handle for the node's session
/// table and the channel the demultiplexer feeds inbound envelopes
/// into.
pub(crate) fn spawn_session(params: SessionParams) -> (SessionHandle, mpsc::Sender<Envelope>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (envelope_tx, envelope_rx) = mpsc::channel(256);

    let handle = SessionHandle {
        session_id: params.session_id,
        peer: params.peer.clone(),
        route: params.path.route(),
        max_message_bytes: params.max_message_bytes,
        cmd_tx,
    };

    tokio::spawn(run_session(params, cmd_rx, envelope_rx));

    (handle, envelope_tx)
}

async fn run_session(
    params: SessionParams,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut envelope_rx: mpsc::Receiver<Envelope>,
) {
    let SessionParams {
        session_id,
        peer,
        mut cipher,
        path,
        events,
        keepalive_interval,
        keepalive_deadline,
        max_message_bytes,
    } = params;

    let mut last_rx = Instant::now();
    let mut last_tx = Instant::now();
    let mut assembly: Vec<u8> = Vec::new();
    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Send(data)) => {
                        if send_message(&mut cipher, &path, &data).await.is_err() {
                            warn!("Session {} write failed, closing", session_id);
                            break;
                        }
                        last_tx = Instant::now();
                    }
                    Some(SessionCommand::Disconnect) | None => {
                        // Best-effort notice to the peer, then tear down
                        if let Ok(envelope) = cipher.seal(EnvelopeKind::Disconnect, &[]) {
                            let _ = path.send_envelope(&envelope).await;
                        }
                        break;
                    }
                }
            }
            envelope = envelope_rx.recv() => {
                let Some(envelope) = envelope else { break };
                match envelope.kind {
                    EnvelopeKind::Data | EnvelopeKind::Fragment => {
                        match cipher.open(&envelope) {
                            Ok(plaintext) => {
                                last_rx = Instant::now();
                                if assembly.len() + plaintext.len() > max_message_bytes {
                                    warn!(
                                        "Session {} message exceeds {} bytes, dropping",
                                        session_id, max_message_bytes
                                    );
                                    assembly.clear();
                                    continue;
                                }
                                assembly.extend_from_slice(&plaintext);
                                if envelope.kind == EnvelopeKind::Data {
                                    let data = std::mem::take(&mut assembly);
                                    let _ = events.send(NodeEvent::Message {
                                        session: session_id,
                                        peer: peer.clone(),
                                        data,
                                    });
                                }
                            }
                            Err(SealError::Replay(seq)) => {
                                warn!("Session {} replay rejected: sequence {}", session_id, seq);
                            }
                            Err(e) => {
                                warn!("Session {} envelope rejected: {}", session_id, e);
                            }
                        }
                    }
                    EnvelopeKind::Keepalive => {
                        match cipher.open(&envelope) {
                            Ok(_) => last_rx = Instant::now(),
                            Err(e) => debug!("Session {} bad keepalive: {}", session_id, e),
                        }
                    }
                    EnvelopeKind::Disconnect => {
                        match cipher.open(&envelope) {
                            Ok(_) => {
                                debug!("Session {} closed by peer", session_id);
                                break;
                            }
                            Err(e) => debug!("Session {} bad disconnect: {}", session_id, e),
                        }
                    }
                    // Stray handshake retransmits after establishment
                    _ => {}
                }
            }
            _ = keepalive.tick() => {
                if last_rx.elapsed() > keepalive_deadline {
                    debug!(
                        "Session {} peer silent for {:?}, closing",
                        session_id,
                        last_rx.elapsed()
                    );
                    break;
                }
                if last_tx.elapsed() >= keepalive_interval {
                    match cipher.seal(EnvelopeKind::Keepalive, &[]) {
                        Ok(envelope) => {
                            if path.send_envelope(&envelope).await.is_err() {
                                warn!("Session {} keepalive write failed, closing", session_id);
                                break;
                            }
                            last_tx = Instant::now();
                        }
                        Err(e) => {
                            warn!("Session {} keepalive seal failed: {}", session_id, e);
                            break;
                        }
                    }
                }
            }
        }
    }

    // Dropping the cipher zeroes the session keys
    drop(cipher);
    let _ = events.send(NodeEvent::Status {
        peer,
        status: PeerStatus::Closed,
    });
}

async fn send_message(
    cipher: &mut SessionCipher,
    path: &SessionPath,
    data: &[u8],
) -> std::io::Result<()> {
    // Empty messages still produce one Data envelope
    let mut chunks: Vec<&[u8]> = data.chunks(DATA_CHUNK_BYTES).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let last = chunks.len() - 1;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let kind = if i == last {
            EnvelopeKind::Data
        } else {
            EnvelopeKind::Fragment
        };
        let envelope = cipher
            .seal(kind, chunk)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        path.send_envelope(&envelope).await?;
    }
    Ok(())
}

/// Feed a session's dedicated socket into its envelope channel.
///
/// Outbound sessions own an ephemeral socket; this reader unwraps
/// relay frames when the session runs over a circuit and forwards
/// decoded envelopes until either side goes away.
pub(crate) fn spawn_socket_reader(
    socket: Arc<UdpSocket>,
    circuit: Option<Uuid>,
    envelope_tx: mpsc::Sender<Envelope>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let received = tokio::select! {
                // Session gone: drop the socket right away
                _ = envelope_tx.closed() => break,
                result = socket.recv(&mut buf) => result,
            };
            let len = match received {
                Ok(len) => len,
                Err(e) => {
                    debug!("Session socket read failed: {}", e);
                    break;
                }
            };

            let datagram = &buf[..len];
            let envelope_bytes = match circuit {
                None => Bytes::copy_from_slice(datagram),
                Some(expected) => {
                    // Only Forward frames for our circuit carry envelopes
                    let Ok(header) = RelayHeader::decode(datagram) else {
                        continue;
                    };
                    if header.packet_type != RelayPacketType::Forward || header.circuit != expected
                    {
                        continue;
                    }
                    Bytes::copy_from_slice(&datagram[RELAY_HEADER_SIZE..])
                }
            };

            match Envelope::decode(envelope_bytes) {
                Ok(envelope) => {
                    if envelope_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Undecodable datagram on session socket: {}", e),
            }
        }
    });
}
