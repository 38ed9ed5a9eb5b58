//! Node facade and inbound demultiplexer.
//!
//! A [`Node`] is the whole engine behind one identity: it binds the
//! listen socket, answers inbound handshakes, negotiates outbound
//! connections, and exposes the narrow surface the UI and persistence
//! collaborators see - `connect`, `send`, `disconnect`, and the event
//! stream. The node never touches disk; identities and contacts are
//! persisted by whoever embeds it.
//!
//! One demultiplexer task owns the listen socket. It separates relay
//! frames from plain envelopes by magic, routes traffic for live
//! sessions into their channels, and drives responder handshakes for
//! unknown sources. Outbound sessions run on their own ephemeral
//! sockets and bypass the demultiplexer entirely.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sgp_core::relay::{KeyPayload, RelayHeader, RelayPacketType, RELAY_HEADER_SIZE};
use sgp_core::{Envelope, EnvelopeKind};
use sgp_crypto::{
    ContactToken, Identity, RemoteIdentity, RendezvousHint, Responder, SessionCipher, SessionKeys,
    ShadowId,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::discovery::probe_stun_servers;
use crate::events::{NodeEvent, PeerStatus};
use crate::negotiator::{negotiate, ConnectError, Negotiated};
use crate::peer::{AttemptOutcome, AttemptRecord, NegotiationPhase, Peer, Route};
use crate::transport::{
    spawn_session, spawn_socket_reader, SessionHandle, SessionParams, SessionPath, TransportError,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PENDING_HANDSHAKE_TTL: Duration = Duration::from_secs(30);
const REGISTER_REFRESH: Duration = Duration::from_secs(30);
const DEMUX_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// One Shadowlink node: identity, listen socket, sessions, events.
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    identity: Arc<Identity>,
    config: NodeConfig,
    socket: Arc<UdpSocket>,
    observed: RwLock<Option<SocketAddr>>,
    peers: RwLock<HashMap<ShadowId, Arc<Mutex<Peer>>>>,
    sessions: RwLock<HashMap<ShadowId, SessionHandle>>,
    events: broadcast::Sender<NodeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind the listen socket and start the node's background tasks:
    /// the demultiplexer, startup address discovery, and (when a relay
    /// is configured) the listener registration refresh.
    pub async fn bind(identity: Identity, config: NodeConfig) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.listen).await?);
        info!(
            "Node {} listening on {}",
            identity.shadow_id(),
            socket.local_addr()?
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(NodeInner {
            identity: Arc::new(identity),
            config,
            socket,
            observed: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(demux_loop(inner.clone()))];

        if !inner.config.stun_servers.is_empty() {
            let disc = inner.clone();
            tasks.push(tokio::spawn(async move {
                if let Some(addr) =
                    probe_stun_servers(&disc.config.stun_servers, disc.config.discovery_timeout)
                        .await
                {
                    info!("Observed public address: {}", addr);
                    *disc.observed.write().await = Some(addr);
                }
            }));
        }

        if let Some(relay) = inner.config.relay {
            tasks.push(tokio::spawn(presence_loop(inner.clone(), relay)));
        }

        *inner.tasks.lock().await = tasks;
        Ok(Self { inner })
    }

    pub fn shadow_id(&self) -> ShadowId {
        self.inner.identity.shadow_id()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// The reflexive address discovered at startup, if any.
    pub async fn observed_addr(&self) -> Option<SocketAddr> {
        *self.inner.observed.read().await
    }

    /// Subscribe to status, contact, and message events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// The local SG link: identity plus current rendezvous hints.
    pub async fn contact_link(&self) -> String {
        let mut hints = Vec::new();
        let direct = match *self.inner.observed.read().await {
            Some(addr) => Some(addr),
            None => self.inner.socket.local_addr().ok(),
        };
        if let Some(addr) = direct {
            hints.push(RendezvousHint::Direct(addr));
        }
        if let Some(relay) = self.inner.config.relay {
            hints.push(RendezvousHint::Relay(relay));
        }
        ContactToken::encode(&self.inner.identity, &hints)
    }

    /// Import a contact token and negotiate a session with its owner.
    ///
    /// Resolves once the session is `Active`, or with the terminal
    /// negotiation error. Transient network trouble is retried inside
    /// the negotiator and never surfaces here.
    pub async fn connect(&self, link: &str) -> Result<ShadowId, ConnectError> {
        let token = ContactToken::decode(link)?;
        if token.verify_key == self.inner.identity.verify_key_bytes() {
            return Err(ConnectError::SelfConnection);
        }
        let peer_id = token.shadow_id();

        {
            let sessions = self.inner.sessions.read().await;
            if let Some(handle) = sessions.get(&peer_id) {
                if !handle.is_closed() {
                    return Err(ConnectError::AlreadyConnected(peer_id));
                }
            }
        }

        let peer = {
            let mut peers = self.inner.peers.write().await;
            peers
                .entry(peer_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Peer::from_token(token.clone()))))
                .clone()
        };
        {
            let mut p = peer.lock().await;
            p.update_token(token);
            p.set_phase(NegotiationPhase::AddressResolving);
        }

        let _ = self.inner.events.send(NodeEvent::Status {
            peer: peer_id.clone(),
            status: PeerStatus::Connecting,
        });

        // Local reachability; the direct phase proceeds regardless of
        // how this probe ends
        if self.inner.observed.read().await.is_none() && !self.inner.config.stun_servers.is_empty()
        {
            if let Some(addr) = probe_stun_servers(
                &self.inner.config.stun_servers,
                self.inner.config.discovery_timeout,
            )
            .await
            {
                *self.inner.observed.write().await = Some(addr);
            }
        }

        match negotiate(
            self.inner.identity.clone(),
            peer.clone(),
            self.inner.config.clone(),
        )
        .await
        {
            Ok(negotiated) => {
                self.inner.install_outbound_session(negotiated).await;
                peer.lock().await.set_phase(NegotiationPhase::Active);
                Ok(peer_id)
            }
            Err(e) => {
                let _ = self.inner.events.send(NodeEvent::Status {
                    peer: peer_id,
                    status: PeerStatus::Failed,
                });
                Err(e)
            }
        }
    }

    /// Send an application message to a connected peer.
    pub async fn send(&self, peer: &ShadowId, data: Vec<u8>) -> Result<(), TransportError> {
        let handle = self
            .inner
            .sessions
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or(TransportError::UnknownPeer)?;

        if handle.is_closed() {
            self.inner.sessions.write().await.remove(peer);
            return Err(TransportError::Closed);
        }
        handle.send(data).await
    }

    /// Tear down the session with a peer, notifying it first.
    pub async fn disconnect(&self, peer: &ShadowId) -> Result<(), TransportError> {
        let handle = self
            .inner
            .sessions
            .write()
            .await
            .remove(peer)
            .ok_or(TransportError::UnknownPeer)?;
        handle.disconnect().await;

        if let Some(p) = self.inner.peers.read().await.get(peer) {
            p.lock().await.set_phase(NegotiationPhase::Closed);
        }
        Ok(())
    }

    /// Current negotiation phase of a known peer.
    pub async fn peer_phase(&self, peer: &ShadowId) -> Option<NegotiationPhase> {
        let peers = self.inner.peers.read().await;
        match peers.get(peer) {
            Some(p) => Some(p.lock().await.phase()),
            None => None,
        }
    }

    /// Connection attempt history of a known peer.
    pub async fn attempt_history(&self, peer: &ShadowId) -> Vec<AttemptRecord> {
        let peers = self.inner.peers.read().await;
        match peers.get(peer) {
            Some(p) => p.lock().await.attempt_history().to_vec(),
            None => Vec::new(),
        }
    }

    /// The route the live session with a peer runs over.
    pub async fn session_route(&self, peer: &ShadowId) -> Option<Route> {
        self.inner
            .sessions
            .read()
            .await
            .get(peer)
            .filter(|h| !h.is_closed())
            .map(|h| h.route)
    }

    /// Close every session and stop background tasks.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.disconnect().await;
        }

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

impl NodeInner {
    async fn install_outbound_session(&self, negotiated: Negotiated) {
        let peer_id = negotiated.remote.shadow_id.clone();
        let route = negotiated.path.route();
        let (socket, circuit) = match &negotiated.path {
            SessionPath::Direct { socket, .. } => (socket.clone(), None),
            SessionPath::Relay {
                socket, circuit, ..
            } => (socket.clone(), Some(*circuit)),
        };

        let (handle, envelope_tx) =
            self.spawn_session_for(negotiated.keys, &negotiated.remote, negotiated.path);
        spawn_socket_reader(socket, circuit, envelope_tx);

        self.finish_install(peer_id, route, handle).await;
    }

    fn spawn_session_for(
        &self,
        keys: SessionKeys,
        remote: &RemoteIdentity,
        path: SessionPath,
    ) -> (SessionHandle, mpsc::Sender<Envelope>) {
        let cipher = SessionCipher::new(&keys);
        spawn_session(SessionParams {
            session_id: Uuid::new_v4(),
            peer: remote.shadow_id.clone(),
            cipher,
            path,
            events: self.events.clone(),
            keepalive_interval: self.config.keepalive_interval,
            keepalive_deadline: self.config.keepalive_deadline(),
            max_message_bytes: self.config.max_message_bytes,
        })
    }

    async fn finish_install(&self, peer_id: ShadowId, route: Route, handle: SessionHandle) {
        if let Some(old) = self
            .sessions
            .write()
            .await
            .insert(peer_id.clone(), handle)
        {
            if !old.is_closed() {
                debug!("Replacing live session with {}", peer_id);
                old.disconnect().await;
            }
        }

        let _ = self.events.send(NodeEvent::ContactResolved {
            peer: peer_id.clone(),
            route,
        });
        let _ = self.events.send(NodeEvent::Status {
            peer: peer_id,
            status: PeerStatus::Connected,
        });
    }

    /// Register an inbound session: peer record, session table, events.
    async fn install_inbound_session(
        &self,
        keys: SessionKeys,
        remote: RemoteIdentity,
        path: SessionPath,
    ) -> mpsc::Sender<Envelope> {
        let peer_id = remote.shadow_id.clone();
        let route = path.route();
        let (handle, envelope_tx) = self.spawn_session_for(keys, &remote, path);

        {
            let mut peers = self.peers.write().await;
            let entry = peers.entry(peer_id.clone()).or_insert_with(|| {
                let hint = match route {
                    Route::Direct(addr) => RendezvousHint::Direct(addr),
                    Route::Relay(addr) => RendezvousHint::Relay(addr),
                };
                Arc::new(Mutex::new(Peer::from_token(ContactToken {
                    verify_key: remote.verify_key,
                    transport_key: remote.static_key,
                    hints: vec![hint],
                })))
            });
            let mut p = entry.lock().await;
            p.record_attempt(route, AttemptOutcome::Succeeded);
            p.set_phase(NegotiationPhase::Active);
        }

        info!("Inbound session from {} via {}", peer_id, route);
        self.finish_install(peer_id, route, handle).await;
        envelope_tx
    }
}

struct PendingHandshake {
    responder: Responder,
    created: tokio::time::Instant,
}

/// Owns the listen socket: separates relay frames from envelopes,
/// feeds live sessions, and answers inbound handshakes.
async fn demux_loop(inner: Arc<NodeInner>) {
    let mut buf = vec![0u8; 2048];
    let mut direct_routes: HashMap<SocketAddr, mpsc::Sender<Envelope>> = HashMap::new();
    let mut circuit_routes: HashMap<Uuid, mpsc::Sender<Envelope>> = HashMap::new();
    let mut pending_direct: HashMap<SocketAddr, PendingHandshake> = HashMap::new();
    let mut pending_relay: HashMap<Uuid, PendingHandshake> = HashMap::new();
    let mut sweep = tokio::time::interval(DEMUX_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            result = inner.socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("Listen socket read failed: {}", e);
                        continue;
                    }
                };
                let datagram = &buf[..len];

                if RelayHeader::quick_check(datagram) {
                    handle_relay_frame(
                        &inner,
                        datagram,
                        src,
                        &mut circuit_routes,
                        &mut pending_relay,
                    )
                    .await;
                } else if Envelope::quick_check(datagram) {
                    let Ok(envelope) = Envelope::decode(Bytes::copy_from_slice(datagram)) else {
                        continue;
                    };
                    handle_direct_envelope(
                        &inner,
                        envelope,
                        src,
                        &mut direct_routes,
                        &mut pending_direct,
                    )
                    .await;
                }
            }
            _ = sweep.tick() => {
                let now = tokio::time::Instant::now();
                pending_direct.retain(|_, p| now.duration_since(p.created) < PENDING_HANDSHAKE_TTL);
                pending_relay.retain(|_, p| now.duration_since(p.created) < PENDING_HANDSHAKE_TTL);
                direct_routes.retain(|_, tx| !tx.is_closed());
                circuit_routes.retain(|_, tx| !tx.is_closed());
            }
        }
    }
}

/// Deliver into a live session channel. Returns the envelope back if
/// the session is gone so the handshake handlers get a shot.
fn route_to_session(tx: &mpsc::Sender<Envelope>, envelope: Envelope) -> Option<Envelope> {
    match tx.try_send(envelope) {
        Ok(()) => None,
        Err(TrySendError::Full(_)) => {
            debug!("Session inbound queue full, dropping envelope");
            None
        }
        Err(TrySendError::Closed(envelope)) => Some(envelope),
    }
}

async fn handle_direct_envelope(
    inner: &Arc<NodeInner>,
    envelope: Envelope,
    src: SocketAddr,
    direct_routes: &mut HashMap<SocketAddr, mpsc::Sender<Envelope>>,
    pending_direct: &mut HashMap<SocketAddr, PendingHandshake>,
) {
    let envelope = if let Some(tx) = direct_routes.get(&src) {
        match route_to_session(tx, envelope) {
            None => return,
            Some(envelope) => {
                direct_routes.remove(&src);
                envelope
            }
        }
    } else {
        envelope
    };

    match envelope.kind {
        EnvelopeKind::Handshake1 => {
            // Fresh responder per hello; a retransmit restarts cleanly
            let mut responder = match Responder::new(&inner.identity) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Responder setup failed: {}", e);
                    return;
                }
            };
            if let Err(e) = responder.read_first(&envelope.payload) {
                debug!("Bad hello from {}: {}", src, e);
                return;
            }
            let msg2 = match responder.response_message() {
                Ok(m) => m,
                Err(e) => {
                    debug!("Handshake response failed: {}", e);
                    return;
                }
            };
            let reply = Envelope::new(EnvelopeKind::Handshake2, 1, Bytes::from(msg2));
            let Ok(bytes) = reply.encode() else { return };
            if let Err(e) = inner.socket.send_to(&bytes, src).await {
                debug!("Handshake reply to {} failed: {}", src, e);
                return;
            }
            pending_direct.insert(
                src,
                PendingHandshake {
                    responder,
                    created: tokio::time::Instant::now(),
                },
            );
        }
        EnvelopeKind::Handshake3 => {
            let Some(mut pending) = pending_direct.remove(&src) else {
                debug!("Unexpected handshake finish from {}", src);
                return;
            };
            match pending.responder.read_final(&envelope.payload) {
                Ok(remote) => {
                    let Ok((keys, _)) = pending.responder.into_session_keys() else {
                        return;
                    };
                    let path = SessionPath::Direct {
                        socket: inner.socket.clone(),
                        peer: src,
                    };
                    let envelope_tx = inner.install_inbound_session(keys, remote, path).await;
                    direct_routes.insert(src, envelope_tx);
                }
                Err(e) => {
                    debug!("Handshake from {} failed: {}", src, e);
                }
            }
        }
        _ => {
            debug!("Envelope from unknown address {} dropped", src);
        }
    }
}

async fn handle_relay_frame(
    inner: &Arc<NodeInner>,
    datagram: &[u8],
    src: SocketAddr,
    circuit_routes: &mut HashMap<Uuid, mpsc::Sender<Envelope>>,
    pending_relay: &mut HashMap<Uuid, PendingHandshake>,
) {
    // Only the relay we registered with may open circuits toward us
    if inner.config.relay != Some(src) {
        debug!("Relay frame from unexpected source {}", src);
        return;
    }

    let Ok(header) = RelayHeader::decode(datagram) else {
        return;
    };

    match header.packet_type {
        RelayPacketType::RegisterAck => {
            debug!("Relay registration confirmed");
        }
        RelayPacketType::Incoming => {
            debug!("Incoming circuit {}", header.circuit);
            // The circuit goes live when its first envelope arrives
        }
        RelayPacketType::Forward => {
            let payload = &datagram[RELAY_HEADER_SIZE..];
            let Ok(envelope) = Envelope::decode(Bytes::copy_from_slice(payload)) else {
                return;
            };

            let envelope = if let Some(tx) = circuit_routes.get(&header.circuit) {
                match route_to_session(tx, envelope) {
                    None => return,
                    Some(envelope) => {
                        circuit_routes.remove(&header.circuit);
                        envelope
                    }
                }
            } else {
                envelope
            };

            match envelope.kind {
                EnvelopeKind::Handshake1 => {
                    let mut responder = match Responder::new(&inner.identity) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("Responder setup failed: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = responder.read_first(&envelope.payload) {
                        debug!("Bad hello on circuit {}: {}", header.circuit, e);
                        return;
                    }
                    let msg2 = match responder.response_message() {
                        Ok(m) => m,
                        Err(e) => {
                            debug!("Handshake response failed: {}", e);
                            return;
                        }
                    };
                    let reply = Envelope::new(EnvelopeKind::Handshake2, 1, Bytes::from(msg2));
                    let Ok(reply_bytes) = reply.encode() else { return };
                    let Ok(packet) = sgp_core::relay::encode_packet(
                        RelayPacketType::Forward,
                        header.circuit,
                        &reply_bytes,
                    ) else {
                        return;
                    };
                    if let Err(e) = inner.socket.send_to(&packet, src).await {
                        debug!("Handshake reply on circuit {} failed: {}", header.circuit, e);
                        return;
                    }
                    pending_relay.insert(
                        header.circuit,
                        PendingHandshake {
                            responder,
                            created: tokio::time::Instant::now(),
                        },
                    );
                }
                EnvelopeKind::Handshake3 => {
                    let Some(mut pending) = pending_relay.remove(&header.circuit) else {
                        debug!("Unexpected handshake finish on circuit {}", header.circuit);
                        return;
                    };
                    match pending.responder.read_final(&envelope.payload) {
                        Ok(remote) => {
                            let Ok((keys, _)) = pending.responder.into_session_keys() else {
                                return;
                            };
                            let path = SessionPath::Relay {
                                socket: inner.socket.clone(),
                                relay: src,
                                circuit: header.circuit,
                            };
                            let envelope_tx =
                                inner.install_inbound_session(keys, remote, path).await;
                            circuit_routes.insert(header.circuit, envelope_tx);
                        }
                        Err(e) => {
                            debug!("Handshake on circuit {} failed: {}", header.circuit, e);
                        }
                    }
                }
                _ => {
                    debug!("Envelope on unknown circuit {} dropped", header.circuit);
                }
            }
        }
        _ => {}
    }
}

/// Keep the listener registration with the relay fresh.
async fn presence_loop(inner: Arc<NodeInner>, relay: SocketAddr) {
    let mut key_buf = [0u8; KeyPayload::SIZE];
    if (KeyPayload {
        key: inner.identity.verify_key_bytes(),
    })
    .encode(&mut key_buf)
    .is_err()
    {
        return;
    }
    let Ok(packet) =
        sgp_core::relay::encode_packet(RelayPacketType::Register, Uuid::nil(), &key_buf)
    else {
        return;
    };

    let mut interval = tokio::time::interval(REGISTER_REFRESH);
    loop {
        interval.tick().await;
        if let Err(e) = inner.socket.send_to(&packet, relay).await {
            debug!("Relay registration send failed: {}", e);
        }
    }
}
