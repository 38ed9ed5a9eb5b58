//! Connection negotiation.
//!
//! Drives one peer from `Idle` through address resolution, a raced
//! direct phase, and a relay fallback, to an authenticated session:
//!
//! ```text
//! Idle -> AddressResolving -> DirectAttempt -> DirectEstablished -\
//!                                  |                              +-> Active
//!                                  v                              |
//!                             RelayAttempt  ->  RelayEstablished -/
//! ```
//!
//! `Failed` is reachable from every non-terminal phase. Candidate
//! addresses race concurrently with bounded fan-out, each attempt on
//! its own ephemeral socket inside a `JoinSet`; the first completed
//! handshake aborts the rest, which closes their sockets. Transient
//! failures retry with linear backoff; handshake and authentication
//! failures never retry and fail the whole negotiation immediately.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sgp_core::relay::{KeyPayload, OpenRejectPayload, RelayHeader, RelayPacketType, RELAY_HEADER_SIZE};
use sgp_core::{Envelope, EnvelopeKind};
use sgp_crypto::{
    ContactToken, HandshakeError, Identity, Initiator, RemoteIdentity, SessionKeys, ShadowId,
    TokenError,
};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::peer::{AttemptOutcome, NegotiationPhase, Peer, Route};
use crate::transport::SessionPath;

/// Terminal negotiation errors, as surfaced to the caller of
/// `Node::connect`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid contact token: {0}")]
    Token(#[from] TokenError),

    #[error("cannot connect to own contact token")]
    SelfConnection,

    #[error("already connected to {0}")]
    AlreadyConnected(ShadowId),

    #[error("peer unreachable: direct and relay attempts exhausted")]
    Unreachable,

    #[error("peer authentication failed: {0}")]
    PeerAuthentication(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

/// The product of a successful negotiation, ready to hand to the
/// session transport.
pub(crate) struct Negotiated {
    pub keys: SessionKeys,
    pub remote: RemoteIdentity,
    pub path: SessionPath,
}

enum AttemptError {
    /// Transient: worth retrying or falling back.
    Retryable(AttemptOutcome),
    /// Authentication or integrity failure: never retried.
    Fatal(ConnectError),
}

/// Run the full negotiation for one peer.
///
/// The peer record's phase and attempt history are kept current as the
/// machine advances; the caller owns status events.
pub(crate) async fn negotiate(
    identity: Arc<Identity>,
    peer: Arc<Mutex<Peer>>,
    config: NodeConfig,
) -> Result<Negotiated, ConnectError> {
    let (token, candidates, relay_hint) = {
        let p = peer.lock().await;
        (p.token().clone(), p.candidates(), p.relay_hint())
    };
    let relay = relay_hint.or(config.relay);
    let step_timeout = config.direct_attempt_timeout / config.max_direct_attempts.max(1);

    // Direct phase: race the candidates, first handshake wins
    if !candidates.is_empty() {
        peer.lock().await.set_phase(NegotiationPhase::DirectAttempt);

        let token_shared = Arc::new(token.clone());
        let mut set = JoinSet::new();
        for addr in candidates.into_iter().take(config.direct_fanout.max(1)) {
            set.spawn(attempt_direct_candidate(
                identity.clone(),
                token_shared.clone(),
                addr,
                config.max_direct_attempts,
                config.retry_backoff,
                step_timeout,
            ));
        }

        let deadline = tokio::time::Instant::now() + config.direct_attempt_timeout;
        let mut fatal = None;

        while !set.is_empty() {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Err(_) => {
                    // Attempt window elapsed; cancel what is still in flight
                    debug!("Direct attempt window elapsed for {}", token.shadow_id());
                    set.abort_all();
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(_))) => continue, // aborted attempt
                Ok(Some(Ok((addr, result)))) => match result {
                    Ok(negotiated) => {
                        // Winner takes the session; losers are aborted
                        // and their sockets closed by drop
                        set.abort_all();
                        let mut p = peer.lock().await;
                        p.record_attempt(Route::Direct(addr), AttemptOutcome::Succeeded);
                        p.set_phase(NegotiationPhase::DirectEstablished);
                        info!("Direct path to {} via {}", token.shadow_id(), addr);
                        return Ok(negotiated);
                    }
                    Err(AttemptError::Retryable(outcome)) => {
                        peer.lock()
                            .await
                            .record_attempt(Route::Direct(addr), outcome);
                    }
                    Err(AttemptError::Fatal(e)) => {
                        peer.lock()
                            .await
                            .record_attempt(Route::Direct(addr), AttemptOutcome::HandshakeFailed);
                        fatal = Some(e);
                        set.abort_all();
                        break;
                    }
                },
            }
        }

        if let Some(e) = fatal {
            peer.lock().await.set_phase(NegotiationPhase::Failed);
            return Err(e);
        }
    }

    // Relay phase
    let Some(relay_addr) = relay else {
        debug!("No relay available for {}", token.shadow_id());
        peer.lock().await.set_phase(NegotiationPhase::Failed);
        return Err(ConnectError::Unreachable);
    };

    peer.lock().await.set_phase(NegotiationPhase::RelayAttempt);

    match attempt_relay(&identity, &token, relay_addr, &config, step_timeout).await {
        Ok(negotiated) => {
            let mut p = peer.lock().await;
            p.record_attempt(Route::Relay(relay_addr), AttemptOutcome::Succeeded);
            p.set_phase(NegotiationPhase::RelayEstablished);
            info!("Relay path to {} via {}", token.shadow_id(), relay_addr);
            Ok(negotiated)
        }
        Err(AttemptError::Retryable(outcome)) => {
            let mut p = peer.lock().await;
            p.record_attempt(Route::Relay(relay_addr), outcome);
            p.set_phase(NegotiationPhase::Failed);
            Err(ConnectError::Unreachable)
        }
        Err(AttemptError::Fatal(e)) => {
            let mut p = peer.lock().await;
            p.record_attempt(Route::Relay(relay_addr), AttemptOutcome::HandshakeFailed);
            p.set_phase(NegotiationPhase::Failed);
            Err(e)
        }
    }
}

fn ephemeral_bind_addr(target: SocketAddr) -> SocketAddr {
    if target.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid bind address")
    } else {
        "[::]:0".parse().expect("valid bind address")
    }
}

fn io_outcome(e: &std::io::Error) -> AttemptOutcome {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => AttemptOutcome::Refused,
        std::io::ErrorKind::TimedOut => AttemptOutcome::TimedOut,
        _ => AttemptOutcome::Refused,
    }
}

/// One direct candidate: ephemeral socket, bounded handshake retries.
async fn attempt_direct_candidate(
    identity: Arc<Identity>,
    token: Arc<ContactToken>,
    addr: SocketAddr,
    max_attempts: u32,
    backoff: Duration,
    step_timeout: Duration,
) -> (SocketAddr, Result<Negotiated, AttemptError>) {
    let result = async {
        let socket = UdpSocket::bind(ephemeral_bind_addr(addr))
            .await
            .map_err(|e| AttemptError::Retryable(io_outcome(&e)))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| AttemptError::Retryable(io_outcome(&e)))?;

        let mut last = AttemptError::Retryable(AttemptOutcome::TimedOut);
        for attempt in 0..max_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(backoff * attempt).await;
            }
            let outcome = {
                let wire = Wire::Direct(&socket);
                run_handshake(&identity, &token, &wire, step_timeout).await
            };
            match outcome {
                Ok((keys, remote)) => {
                    return Ok(Negotiated {
                        keys,
                        remote,
                        path: SessionPath::Direct {
                            socket: Arc::new(socket),
                            peer: addr,
                        },
                    });
                }
                Err(AttemptError::Fatal(e)) => return Err(AttemptError::Fatal(e)),
                Err(retryable) => last = retryable,
            }
        }
        Err(last)
    }
    .await;

    (addr, result)
}

/// Relay fallback: open a circuit, then the same handshake through
/// Forward frames.
async fn attempt_relay(
    identity: &Identity,
    token: &ContactToken,
    relay_addr: SocketAddr,
    config: &NodeConfig,
    step_timeout: Duration,
) -> Result<Negotiated, AttemptError> {
    let socket = UdpSocket::bind(ephemeral_bind_addr(relay_addr))
        .await
        .map_err(|e| AttemptError::Retryable(io_outcome(&e)))?;
    socket
        .connect(relay_addr)
        .await
        .map_err(|e| AttemptError::Retryable(io_outcome(&e)))?;

    let mut key_buf = [0u8; KeyPayload::SIZE];
    KeyPayload {
        key: token.verify_key,
    }
    .encode(&mut key_buf)
    .map_err(|_| AttemptError::Retryable(AttemptOutcome::Refused))?;
    let open = sgp_core::relay::encode_packet(RelayPacketType::Open, Uuid::nil(), &key_buf)
        .map_err(|_| AttemptError::Retryable(AttemptOutcome::Refused))?;

    // Circuit open with bounded retries
    let mut circuit = None;
    for attempt in 0..config.max_direct_attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(config.retry_backoff * attempt).await;
        }
        socket
            .send(&open)
            .await
            .map_err(|e| AttemptError::Retryable(io_outcome(&e)))?;
        match wait_open_ack(&socket, step_timeout).await {
            Ok(id) => {
                circuit = Some(id);
                break;
            }
            Err(AttemptError::Retryable(AttemptOutcome::TimedOut)) => continue,
            Err(other) => return Err(other),
        }
    }
    let Some(circuit) = circuit else {
        return Err(AttemptError::Retryable(AttemptOutcome::TimedOut));
    };
    debug!("Relay circuit {} open via {}", circuit, relay_addr);

    // Handshake through the circuit with bounded retries
    let mut last = AttemptError::Retryable(AttemptOutcome::TimedOut);
    for attempt in 0..config.max_direct_attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(config.retry_backoff * attempt).await;
        }
        let outcome = {
            let wire = Wire::Relay {
                socket: &socket,
                circuit,
            };
            run_handshake(identity, token, &wire, step_timeout).await
        };
        match outcome {
            Ok((keys, remote)) => {
                return Ok(Negotiated {
                    keys,
                    remote,
                    path: SessionPath::Relay {
                        socket: Arc::new(socket),
                        relay: relay_addr,
                        circuit,
                    },
                });
            }
            Err(AttemptError::Fatal(e)) => return Err(AttemptError::Fatal(e)),
            Err(retryable) => last = retryable,
        }
    }
    Err(last)
}

async fn wait_open_ack(socket: &UdpSocket, step_timeout: Duration) -> Result<Uuid, AttemptError> {
    let mut buf = vec![0u8; 2048];
    let wait = async {
        loop {
            let len = socket
                .recv(&mut buf)
                .await
                .map_err(|e| AttemptError::Retryable(io_outcome(&e)))?;
            let Ok(header) = RelayHeader::decode(&buf[..len]) else {
                continue;
            };
            match header.packet_type {
                RelayPacketType::OpenAck => return Ok(header.circuit),
                RelayPacketType::OpenReject => {
                    let reason = OpenRejectPayload::decode(&buf[RELAY_HEADER_SIZE..len])
                        .map(|p| format!("{:?}", p.reason))
                        .unwrap_or_else(|_| "unknown".to_string());
                    debug!("Relay refused circuit: {}", reason);
                    return Err(AttemptError::Retryable(AttemptOutcome::Refused));
                }
                _ => continue,
            }
        }
    };

    match tokio::time::timeout(step_timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(AttemptError::Retryable(AttemptOutcome::TimedOut)),
    }
}

/// A connected socket speaking either raw envelopes or envelopes
/// wrapped in relay Forward frames.
enum Wire<'a> {
    Direct(&'a UdpSocket),
    Relay { socket: &'a UdpSocket, circuit: Uuid },
}

impl Wire<'_> {
    async fn send(&self, envelope: &Envelope) -> Result<(), AttemptError> {
        let bytes = envelope
            .encode()
            .map_err(|_| AttemptError::Retryable(AttemptOutcome::Refused))?;
        let result = match self {
            Wire::Direct(socket) => socket.send(&bytes).await,
            Wire::Relay { socket, circuit } => {
                let packet =
                    sgp_core::relay::encode_packet(RelayPacketType::Forward, *circuit, &bytes)
                        .map_err(|_| AttemptError::Retryable(AttemptOutcome::Refused))?;
                socket.send(&packet).await
            }
        };
        result.map_err(|e| AttemptError::Retryable(io_outcome(&e)))?;
        Ok(())
    }

    /// Wait for an envelope of the expected kind, skipping strays.
    async fn recv_expect(
        &self,
        kind: EnvelopeKind,
        step_timeout: Duration,
    ) -> Result<Envelope, AttemptError> {
        let mut buf = vec![0u8; 2048];
        let wait = async {
            loop {
                let (socket, expected_circuit) = match self {
                    Wire::Direct(socket) => (*socket, None),
                    Wire::Relay { socket, circuit } => (*socket, Some(*circuit)),
                };
                let len = socket
                    .recv(&mut buf)
                    .await
                    .map_err(|e| AttemptError::Retryable(io_outcome(&e)))?;

                let envelope_bytes: &[u8] = match expected_circuit {
                    None => &buf[..len],
                    Some(circuit) => {
                        let Ok(header) = RelayHeader::decode(&buf[..len]) else {
                            continue;
                        };
                        match header.packet_type {
                            RelayPacketType::Forward if header.circuit == circuit => {
                                &buf[RELAY_HEADER_SIZE..len]
                            }
                            RelayPacketType::OpenReject => {
                                return Err(AttemptError::Retryable(AttemptOutcome::Refused));
                            }
                            _ => continue,
                        }
                    }
                };

                match Envelope::decode(bytes::Bytes::copy_from_slice(envelope_bytes)) {
                    Ok(envelope) if envelope.kind == kind => return Ok(envelope),
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Undecodable datagram during handshake: {}", e);
                        continue;
                    }
                }
            }
        };

        match tokio::time::timeout(step_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::Retryable(AttemptOutcome::TimedOut)),
        }
    }
}

/// Drive the initiator side of the handshake over a wire and check the
/// result against the contact token.
async fn run_handshake(
    identity: &Identity,
    token: &ContactToken,
    wire: &Wire<'_>,
    step_timeout: Duration,
) -> Result<(SessionKeys, RemoteIdentity), AttemptError> {
    let fatal = |e: HandshakeError| AttemptError::Fatal(ConnectError::Handshake(e));

    let mut initiator = Initiator::new(identity).map_err(fatal)?;

    let msg1 = initiator.first_message().map_err(fatal)?;
    wire.send(&Envelope::new(
        EnvelopeKind::Handshake1,
        0,
        bytes::Bytes::from(msg1),
    ))
    .await?;

    let response = wire
        .recv_expect(EnvelopeKind::Handshake2, step_timeout)
        .await?;
    let remote = initiator.read_response(&response.payload).map_err(fatal)?;

    // The live handshake must match the token that introduced the peer
    if remote.static_key != token.transport_key || remote.verify_key != token.verify_key {
        return Err(AttemptError::Fatal(ConnectError::PeerAuthentication(
            "handshake identity does not match contact token".into(),
        )));
    }

    let msg3 = initiator.final_message().map_err(fatal)?;
    wire.send(&Envelope::new(
        EnvelopeKind::Handshake3,
        2,
        bytes::Bytes::from(msg3),
    ))
    .await?;

    let (keys, remote) = initiator.into_session_keys().map_err(fatal)?;
    Ok((keys, remote))
}
