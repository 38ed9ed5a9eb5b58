//! Relay wire protocol types.
//!
//! This module defines the binary protocol spoken between peers and a
//! rendezvous relay. The relay is blind: it pairs a caller with a
//! registered listener into a circuit and forwards opaque envelope
//! bytes in both directions, never seeing plaintext.
//!
//! # Packet Format
//!
//! All packets share a common header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Magic (0x52) |    Version    |     Type      |   Reserved    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Circuit ID                            |
//! |                         (16 bytes)                            |
//! |                                                               |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Registration and circuit-open packets run with a nil circuit id;
//! the relay assigns a fresh id when it pairs a circuit.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Magic byte identifying relay protocol packets.
pub const RELAY_MAGIC: u8 = 0x52; // 'R'

/// Current relay protocol version.
pub const RELAY_VERSION: u8 = 1;

/// Minimum packet size (header only).
pub const RELAY_HEADER_SIZE: usize = 20;

/// Maximum packet size for relay forwarding.
pub const RELAY_MAX_PACKET_SIZE: usize = 1500;

/// Maximum payload size (packet - header).
pub const RELAY_MAX_PAYLOAD_SIZE: usize = RELAY_MAX_PACKET_SIZE - RELAY_HEADER_SIZE;

/// Relay packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RelayPacketType {
    /// Listener announcing (or refreshing) its presence under a key.
    Register = 0x01,
    /// Relay acknowledging a registration.
    RegisterAck = 0x02,
    /// Caller asking for a circuit to a registered listener.
    Open = 0x03,
    /// Relay granting a circuit to the caller.
    OpenAck = 0x04,
    /// Relay refusing a circuit.
    OpenReject = 0x05,
    /// Relay notifying a listener of a new inbound circuit.
    Incoming = 0x06,
    /// Forwarded envelope bytes on an established circuit.
    Forward = 0x10,
}

impl TryFrom<u8> for RelayPacketType {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Register),
            0x02 => Ok(Self::RegisterAck),
            0x03 => Ok(Self::Open),
            0x04 => Ok(Self::OpenAck),
            0x05 => Ok(Self::OpenReject),
            0x06 => Ok(Self::Incoming),
            0x10 => Ok(Self::Forward),
            _ => Err(RelayError::UnknownPacketType(value)),
        }
    }
}

/// Reasons for refusing a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum OpenRejectReason {
    /// No listener registered under the requested key.
    UnknownTarget = 0x0001,
    /// Relay at circuit capacity.
    CircuitFull = 0x0002,
    /// Too many requests from this source.
    RateLimited = 0x0003,
}

impl TryFrom<u16> for OpenRejectReason {
    type Error = RelayError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::UnknownTarget),
            0x0002 => Ok(Self::CircuitFull),
            0x0003 => Ok(Self::RateLimited),
            _ => Err(RelayError::UnknownRejectReason(value)),
        }
    }
}

/// Relay protocol errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("packet too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("invalid magic byte: 0x{0:02x}, expected 0x{1:02x}")]
    InvalidMagic(u8, u8),

    #[error("unsupported version: {0}, expected {1}")]
    UnsupportedVersion(u8, u8),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unknown reject reason: 0x{0:04x}")]
    UnknownRejectReason(u16),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Relay packet header (20 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHeader {
    /// Protocol version.
    pub version: u8,
    /// Packet type.
    pub packet_type: RelayPacketType,
    /// Circuit identifier; nil for registration and open requests.
    pub circuit: Uuid,
}

impl RelayHeader {
    /// Create a new header.
    pub fn new(packet_type: RelayPacketType, circuit: Uuid) -> Self {
        Self {
            version: RELAY_VERSION,
            packet_type,
            circuit,
        }
    }

    /// Encode header to bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.len() < RELAY_HEADER_SIZE {
            return Err(RelayError::TooShort(buf.len(), RELAY_HEADER_SIZE));
        }

        buf[0] = RELAY_MAGIC;
        buf[1] = self.version;
        buf[2] = self.packet_type as u8;
        buf[3] = 0;
        buf[4..20].copy_from_slice(self.circuit.as_bytes());

        Ok(RELAY_HEADER_SIZE)
    }

    /// Decode header from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        if buf.len() < RELAY_HEADER_SIZE {
            return Err(RelayError::TooShort(buf.len(), RELAY_HEADER_SIZE));
        }

        if buf[0] != RELAY_MAGIC {
            return Err(RelayError::InvalidMagic(buf[0], RELAY_MAGIC));
        }

        let version = buf[1];
        if version != RELAY_VERSION {
            return Err(RelayError::UnsupportedVersion(version, RELAY_VERSION));
        }

        let packet_type = RelayPacketType::try_from(buf[2])?;

        let mut circuit_bytes = [0u8; 16];
        circuit_bytes.copy_from_slice(&buf[4..20]);
        let circuit = Uuid::from_bytes(circuit_bytes);

        Ok(Self {
            version,
            packet_type,
            circuit,
        })
    }

    /// Quick check if a buffer might be a valid relay packet.
    ///
    /// This is a fast pre-check before full parsing.
    pub fn quick_check(buf: &[u8]) -> bool {
        buf.len() >= RELAY_HEADER_SIZE && buf[0] == RELAY_MAGIC && buf[1] == RELAY_VERSION
    }
}

/// REGISTER / OPEN payload: the 32-byte key a listener is (or should
/// be) registered under. Keys are opaque to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPayload {
    pub key: [u8; 32],
}

impl KeyPayload {
    /// Encoded size in bytes.
    pub const SIZE: usize = 32;

    /// Encode to bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.len() < Self::SIZE {
            return Err(RelayError::TooShort(buf.len(), Self::SIZE));
        }
        buf[..32].copy_from_slice(&self.key);
        Ok(Self::SIZE)
    }

    /// Decode from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        if buf.len() < Self::SIZE {
            return Err(RelayError::TooShort(buf.len(), Self::SIZE));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&buf[..32]);
        Ok(Self { key })
    }
}

/// REGISTER_ACK payload.
#[derive(Debug, Clone, Copy)]
pub struct RegisterAckPayload {
    /// How long the registration stays live without a refresh, seconds.
    pub ttl_secs: u16,
}

impl RegisterAckPayload {
    /// Encoded size in bytes.
    pub const SIZE: usize = 2;

    /// Encode to bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.len() < Self::SIZE {
            return Err(RelayError::TooShort(buf.len(), Self::SIZE));
        }
        buf[0..2].copy_from_slice(&self.ttl_secs.to_be_bytes());
        Ok(Self::SIZE)
    }

    /// Decode from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        if buf.len() < Self::SIZE {
            return Err(RelayError::TooShort(buf.len(), Self::SIZE));
        }
        let ttl_secs = u16::from_be_bytes([buf[0], buf[1]]);
        Ok(Self { ttl_secs })
    }
}

/// OPEN_REJECT payload.
#[derive(Debug, Clone, Copy)]
pub struct OpenRejectPayload {
    /// Rejection reason.
    pub reason: OpenRejectReason,
}

impl OpenRejectPayload {
    /// Encoded size in bytes.
    pub const SIZE: usize = 2;

    /// Encode to bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.len() < Self::SIZE {
            return Err(RelayError::TooShort(buf.len(), Self::SIZE));
        }
        buf[0..2].copy_from_slice(&(self.reason as u16).to_be_bytes());
        Ok(Self::SIZE)
    }

    /// Decode from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        if buf.len() < Self::SIZE {
            return Err(RelayError::TooShort(buf.len(), Self::SIZE));
        }
        let reason_code = u16::from_be_bytes([buf[0], buf[1]]);
        let reason = OpenRejectReason::try_from(reason_code)?;
        Ok(Self { reason })
    }
}

/// Assemble a full relay packet (header + payload) into a fresh buffer.
pub fn encode_packet(
    packet_type: RelayPacketType,
    circuit: Uuid,
    payload: &[u8],
) -> Result<Vec<u8>, RelayError> {
    if payload.len() > RELAY_MAX_PAYLOAD_SIZE {
        return Err(RelayError::PayloadTooLarge(payload.len()));
    }
    let header = RelayHeader::new(packet_type, circuit);
    let mut buf = vec![0u8; RELAY_HEADER_SIZE + payload.len()];
    header.encode(&mut buf)?;
    buf[RELAY_HEADER_SIZE..].copy_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let circuit = Uuid::new_v4();
        let header = RelayHeader::new(RelayPacketType::Forward, circuit);

        let mut buf = [0u8; 32];
        header.encode(&mut buf).unwrap();

        let decoded = RelayHeader::decode(&buf).unwrap();
        assert_eq!(decoded.version, RELAY_VERSION);
        assert_eq!(decoded.packet_type, RelayPacketType::Forward);
        assert_eq!(decoded.circuit, circuit);
    }

    #[test]
    fn test_quick_check() {
        let mut buf = [0u8; 32];
        buf[0] = RELAY_MAGIC;
        buf[1] = RELAY_VERSION;

        assert!(RelayHeader::quick_check(&buf));
        assert!(!RelayHeader::quick_check(&[0x00; 32])); // Wrong magic
        assert!(!RelayHeader::quick_check(&[0x52, 0x99])); // Too short
    }

    #[test]
    fn test_key_payload_roundtrip() {
        let payload = KeyPayload { key: [0x42; 32] };

        let mut buf = [0u8; 64];
        let len = payload.encode(&mut buf).unwrap();

        let decoded = KeyPayload::decode(&buf[..len]).unwrap();
        assert_eq!(decoded.key, [0x42; 32]);
    }

    #[test]
    fn test_register_ack_payload() {
        let payload = RegisterAckPayload { ttl_secs: 120 };

        let mut buf = [0u8; 2];
        payload.encode(&mut buf).unwrap();

        let decoded = RegisterAckPayload::decode(&buf).unwrap();
        assert_eq!(decoded.ttl_secs, 120);
    }

    #[test]
    fn test_open_reject_payload() {
        let payload = OpenRejectPayload {
            reason: OpenRejectReason::UnknownTarget,
        };

        let mut buf = [0u8; 2];
        payload.encode(&mut buf).unwrap();

        let decoded = OpenRejectPayload::decode(&buf).unwrap();
        assert_eq!(decoded.reason, OpenRejectReason::UnknownTarget);
    }

    #[test]
    fn test_encode_packet() {
        let circuit = Uuid::new_v4();
        let packet = encode_packet(RelayPacketType::Forward, circuit, b"envelope bytes").unwrap();

        let header = RelayHeader::decode(&packet).unwrap();
        assert_eq!(header.packet_type, RelayPacketType::Forward);
        assert_eq!(header.circuit, circuit);
        assert_eq!(&packet[RELAY_HEADER_SIZE..], b"envelope bytes");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; RELAY_MAX_PAYLOAD_SIZE + 1];
        let result = encode_packet(RelayPacketType::Forward, Uuid::nil(), &payload);
        assert!(matches!(result, Err(RelayError::PayloadTooLarge(_))));
    }
}
