#![forbid(unsafe_code)]

//! Shadowlink relay - blind UDP rendezvous for encrypted peer traffic.
//!
//! The relay:
//! 1. Tracks listeners registered under opaque 32-byte keys
//! 2. Pairs callers with listeners into circuits
//! 3. Forwards sealed envelopes in both directions, never decrypting
//!
//! It is exposed as a library so tests (and embedded deployments) can
//! run an in-process instance; the binary in `main.rs` is a thin
//! wrapper.

pub mod circuit;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use sgp_core::relay::{
    KeyPayload, OpenRejectPayload, OpenRejectReason, RegisterAckPayload, RelayHeader,
    RelayPacketType, RELAY_HEADER_SIZE, RELAY_MAX_PACKET_SIZE,
};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use circuit::{CircuitPool, OpenError};

/// Default configuration values
pub const DEFAULT_MAX_CIRCUITS: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LISTENER_TTL_SECS: u64 = 120;
pub const DEFAULT_MAX_PPS: u64 = 1000;
const SWEEP_INTERVAL_SECS: u64 = 10;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum concurrent circuits.
    pub max_circuits: usize,
    /// Circuits silent this long are dropped.
    pub idle_timeout: Duration,
    /// Registrations expire unless refreshed within this window.
    pub listener_ttl: Duration,
    /// Per-IP packet rate limit, packets per second.
    pub max_pps: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_circuits: DEFAULT_MAX_CIRCUITS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            listener_ttl: Duration::from_secs(DEFAULT_LISTENER_TTL_SECS),
            max_pps: DEFAULT_MAX_PPS,
        }
    }
}

/// Rate limiter for per-IP flood protection
struct IpRateLimiter {
    /// IP -> (packet_count, window_start)
    counts: HashMap<std::net::IpAddr, (u64, std::time::Instant)>,
    max_pps: u64,
    window: Duration,
}

impl IpRateLimiter {
    fn new(max_pps: u64) -> Self {
        Self {
            counts: HashMap::new(),
            max_pps,
            window: Duration::from_secs(1),
        }
    }

    fn check(&mut self, ip: std::net::IpAddr) -> bool {
        let now = std::time::Instant::now();
        let entry = self.counts.entry(ip).or_insert((0, now));

        // Reset window if expired
        if now.duration_since(entry.1) > self.window {
            *entry = (0, now);
        }

        entry.0 += 1;
        entry.0 <= self.max_pps
    }

    fn cleanup(&mut self) {
        let now = std::time::Instant::now();
        self.counts
            .retain(|_, (_, start)| now.duration_since(*start) < self.window * 2);
    }
}

/// Packet handling errors
#[derive(Debug, thiserror::Error)]
enum PacketError {
    #[error("invalid packet size")]
    InvalidSize,
    #[error("invalid magic/version")]
    InvalidMagic,
    #[error("rate limited")]
    RateLimited,
    #[error("invalid header")]
    InvalidHeader,
    #[error("invalid payload")]
    InvalidPayload,
    #[error("unexpected packet type")]
    UnexpectedType,
    #[error("unknown circuit")]
    UnknownCircuit,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay server state.
pub struct Relay {
    socket: UdpSocket,
    circuits: RwLock<CircuitPool>,
    ip_limiter: RwLock<IpRateLimiter>,
    config: RelayConfig,
}

impl Relay {
    /// Bind the relay socket.
    pub async fn bind(listen: SocketAddr, config: RelayConfig) -> Result<Self> {
        let socket = UdpSocket::bind(listen).await?;
        info!("Relay listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            circuits: RwLock::new(CircuitPool::new(
                config.max_circuits,
                config.idle_timeout,
                config.listener_ttl,
            )),
            ip_limiter: RwLock::new(IpRateLimiter::new(config.max_pps)),
            config,
        })
    }

    /// The bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of active circuits.
    pub async fn active_circuit_count(&self) -> usize {
        self.circuits.read().await.active_count()
    }

    /// Serve until the task is aborted.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; RELAY_MAX_PACKET_SIZE];
        let mut sweep_interval =
            tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, src) = result?;
                    let packet = &buf[..len];

                    if let Err(e) = self.handle_packet(packet, src).await {
                        debug!("Packet from {} dropped: {}", src, e);
                    }
                }
                _ = sweep_interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn handle_packet(&self, packet: &[u8], src: SocketAddr) -> Result<(), PacketError> {
        // 1. Size check
        if packet.len() < RELAY_HEADER_SIZE || packet.len() > RELAY_MAX_PACKET_SIZE {
            return Err(PacketError::InvalidSize);
        }

        // 2. Magic and version check (fast path)
        if !RelayHeader::quick_check(packet) {
            return Err(PacketError::InvalidMagic);
        }

        // 3. Per-IP rate limit
        {
            let mut limiter = self.ip_limiter.write().await;
            if !limiter.check(src.ip()) {
                return Err(PacketError::RateLimited);
            }
        }

        // 4. Parse header
        let header = RelayHeader::decode(packet).map_err(|_| PacketError::InvalidHeader)?;
        let payload = &packet[RELAY_HEADER_SIZE..];

        // 5. Dispatch by type
        match header.packet_type {
            RelayPacketType::Register => self.handle_register(payload, src).await,
            RelayPacketType::Open => self.handle_open(payload, src).await,
            RelayPacketType::Forward => self.handle_forward(&header, packet, src).await,
            _ => Err(PacketError::UnexpectedType),
        }
    }

    async fn handle_register(&self, payload: &[u8], src: SocketAddr) -> Result<(), PacketError> {
        let payload = KeyPayload::decode(payload).map_err(|_| PacketError::InvalidPayload)?;

        {
            let mut circuits = self.circuits.write().await;
            circuits.register(payload.key, src);
        }

        let ack = RegisterAckPayload {
            ttl_secs: self.config.listener_ttl.as_secs().min(u16::MAX as u64) as u16,
        };
        let mut ack_buf = [0u8; RegisterAckPayload::SIZE];
        ack.encode(&mut ack_buf).map_err(|_| PacketError::InvalidPayload)?;
        let packet = sgp_core::relay::encode_packet(
            RelayPacketType::RegisterAck,
            Uuid::nil(),
            &ack_buf,
        )
        .map_err(|_| PacketError::InvalidPayload)?;
        self.socket.send_to(&packet, src).await?;

        debug!("Listener registered from {}", src);
        Ok(())
    }

    async fn handle_open(&self, payload: &[u8], src: SocketAddr) -> Result<(), PacketError> {
        let payload = KeyPayload::decode(payload).map_err(|_| PacketError::InvalidPayload)?;

        let opened = {
            let mut circuits = self.circuits.write().await;
            circuits.open(&payload.key, src)
        };

        match opened {
            Ok((circuit, listener_addr)) => {
                let ack = sgp_core::relay::encode_packet(RelayPacketType::OpenAck, circuit, &[])
                    .map_err(|_| PacketError::InvalidPayload)?;
                self.socket.send_to(&ack, src).await?;

                let incoming =
                    sgp_core::relay::encode_packet(RelayPacketType::Incoming, circuit, &[])
                        .map_err(|_| PacketError::InvalidPayload)?;
                self.socket.send_to(&incoming, listener_addr).await?;

                info!("Circuit {} opened: {} <-> {}", circuit, src, listener_addr);
                Ok(())
            }
            Err(reason) => {
                let reason = match reason {
                    OpenError::UnknownTarget => OpenRejectReason::UnknownTarget,
                    OpenError::CircuitFull => OpenRejectReason::CircuitFull,
                };
                self.send_open_reject(src, reason).await;
                Ok(())
            }
        }
    }

    async fn handle_forward(
        &self,
        header: &RelayHeader,
        packet: &[u8],
        src: SocketAddr,
    ) -> Result<(), PacketError> {
        let dest = {
            let mut circuits = self.circuits.write().await;
            circuits
                .route(&header.circuit, src, packet.len())
                .ok_or(PacketError::UnknownCircuit)?
        };

        // Forward the packet untouched; the payload is opaque to us
        self.socket.send_to(packet, dest).await?;
        Ok(())
    }

    async fn send_open_reject(&self, dest: SocketAddr, reason: OpenRejectReason) {
        let payload = OpenRejectPayload { reason };
        let mut buf = [0u8; OpenRejectPayload::SIZE];
        if payload.encode(&mut buf).is_err() {
            return;
        }
        let Ok(packet) =
            sgp_core::relay::encode_packet(RelayPacketType::OpenReject, Uuid::nil(), &buf)
        else {
            return;
        };

        if let Err(e) = self.socket.send_to(&packet, dest).await {
            debug!("Failed to send OPEN_REJECT to {}: {}", dest, e);
        }
    }

    async fn sweep(&self) {
        let (circuits, listeners) = self.circuits.write().await.sweep();
        if circuits > 0 || listeners > 0 {
            info!(
                "Swept {} idle circuits, {} stale listeners",
                circuits, listeners
            );
        }

        let mut limiter = self.ip_limiter.write().await;
        limiter.cleanup();
    }
}
