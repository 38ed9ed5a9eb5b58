//! Core SGP protocol types, framing, and constants.
//!
//! This crate provides:
//! - Envelope framing for encrypted session traffic
//! - STUN binding codec for reflexive address discovery
//! - Relay wire protocol for rendezvous circuits
//!
//! Everything here is pure codec work; no crypto, no I/O.

#![forbid(unsafe_code)]

pub mod relay;
pub mod stun;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const SGP_VERSION: u8 = 1;

pub const SGP_MAGIC: [u8; 2] = [0x53, 0x47]; // 'SG'

/// Envelope header layout:
/// [Magic (2B)][Version (1B)][Kind (1B)][Sequence (8B)][Length (2B)][Csum (2B)]
pub const ENVELOPE_HEADER_SIZE: usize = 16;

/// Largest payload a single envelope can carry (length field is u16).
pub const MAX_PAYLOAD_BYTES: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum SgpError {
    #[error("envelope too short: {0}")]
    TooShort(usize),
    #[error("invalid magic: {0:?}")]
    InvalidMagic([u8; 2]),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown envelope kind: 0x{0:02x}")]
    UnknownKind(u8),
    #[error("length mismatch: header says {0}, got {1}")]
    LengthMismatch(usize, usize),
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// Envelope message types.
///
/// Handshake kinds carry raw Noise messages; everything else carries
/// ciphertext plus AEAD tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Noise message 1 (initiator -> responder).
    Handshake1 = 0x01,
    /// Noise message 2 (responder -> initiator).
    Handshake2 = 0x02,
    /// Noise message 3 (initiator -> responder).
    Handshake3 = 0x03,
    /// Final (or only) part of an application message.
    Data = 0x10,
    /// Non-final part of a chunked application message.
    Fragment = 0x11,
    /// Idle probe; payload is empty plaintext.
    Keepalive = 0x20,
    /// Explicit session teardown.
    Disconnect = 0x21,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = SgpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Handshake1),
            0x02 => Ok(Self::Handshake2),
            0x03 => Ok(Self::Handshake3),
            0x10 => Ok(Self::Data),
            0x11 => Ok(Self::Fragment),
            0x20 => Ok(Self::Keepalive),
            0x21 => Ok(Self::Disconnect),
            _ => Err(SgpError::UnknownKind(value)),
        }
    }
}

/// One authenticated wire unit within a session.
///
/// Sequence numbers are assigned per session direction and must be
/// strictly increasing; the receiving side rejects anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub kind: EnvelopeKind,
    pub sequence: u64,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, sequence: u64, payload: Bytes) -> Self {
        Self {
            version: SGP_VERSION,
            kind,
            sequence,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Bytes, SgpError> {
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(SgpError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.payload.len());
        buf.put_slice(&SGP_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.sequence);
        buf.put_u16(self.payload.len() as u16);

        // Placeholder for checksum
        let csum_pos = buf.len();
        buf.put_u16(0);

        buf.put_slice(&self.payload);

        // Checksum covers header and payload, minus the checksum field itself
        let mut state = crc16::State::<crc16::KERMIT>::new();
        state.update(&buf[..csum_pos]);
        state.update(&buf[ENVELOPE_HEADER_SIZE..]);
        let csum = state.get();

        let mut csum_slice = &mut buf[csum_pos..csum_pos + 2];
        csum_slice.put_u16(csum);

        Ok(buf.freeze())
    }

    pub fn decode(bytes: Bytes) -> Result<Self, SgpError> {
        if bytes.len() < ENVELOPE_HEADER_SIZE {
            return Err(SgpError::TooShort(bytes.len()));
        }

        if bytes[0..2] != SGP_MAGIC {
            return Err(SgpError::InvalidMagic([bytes[0], bytes[1]]));
        }

        let version = bytes[2];
        if version != SGP_VERSION {
            return Err(SgpError::UnsupportedVersion(version));
        }

        let kind = EnvelopeKind::try_from(bytes[3])?;
        let sequence = u64::from_be_bytes(bytes[4..12].try_into().unwrap());
        let length = u16::from_be_bytes([bytes[12], bytes[13]]) as usize;
        let csum = u16::from_be_bytes([bytes[14], bytes[15]]);

        let actual = bytes.len() - ENVELOPE_HEADER_SIZE;
        if length != actual {
            return Err(SgpError::LengthMismatch(length, actual));
        }

        let mut state = crc16::State::<crc16::KERMIT>::new();
        state.update(&bytes[..14]);
        state.update(&bytes[ENVELOPE_HEADER_SIZE..]);
        if state.get() != csum {
            return Err(SgpError::ChecksumMismatch);
        }

        let mut payload = bytes;
        payload.advance(ENVELOPE_HEADER_SIZE);

        Ok(Self {
            version,
            kind,
            sequence,
            payload,
        })
    }

    /// Quick check whether a datagram could be an SGP envelope.
    ///
    /// Used by demultiplexers to separate envelopes from relay frames
    /// sharing a socket, before full parsing.
    pub fn quick_check(buf: &[u8]) -> bool {
        buf.len() >= ENVELOPE_HEADER_SIZE && buf[0..2] == SGP_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope::new(EnvelopeKind::Data, 42, Bytes::from(vec![1, 2, 3, 4]));
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn envelope_empty_payload() {
        let envelope = Envelope::new(EnvelopeKind::Keepalive, 7, Bytes::new());
        let bytes = envelope.encode().unwrap();
        assert_eq!(bytes.len(), ENVELOPE_HEADER_SIZE);
        let decoded = Envelope::decode(bytes).unwrap();
        assert_eq!(decoded.kind, EnvelopeKind::Keepalive);
        assert_eq!(decoded.sequence, 7);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn envelope_too_short() {
        let bytes = Bytes::from(vec![1, 2]);
        assert!(matches!(
            Envelope::decode(bytes),
            Err(SgpError::TooShort(_))
        ));
    }

    #[test]
    fn envelope_invalid_magic() {
        let mut raw = Envelope::new(EnvelopeKind::Data, 0, Bytes::from_static(b"x"))
            .encode()
            .unwrap()
            .to_vec();
        raw[0] = 0xFF;
        assert!(matches!(
            Envelope::decode(Bytes::from(raw)),
            Err(SgpError::InvalidMagic(_))
        ));
    }

    #[test]
    fn envelope_unsupported_version() {
        let mut raw = Envelope::new(EnvelopeKind::Data, 0, Bytes::from_static(b"x"))
            .encode()
            .unwrap()
            .to_vec();
        raw[2] = 0xFF;
        assert!(matches!(
            Envelope::decode(Bytes::from(raw)),
            Err(SgpError::UnsupportedVersion(0xFF))
        ));
    }

    #[test]
    fn envelope_unknown_kind() {
        let mut raw = Envelope::new(EnvelopeKind::Data, 0, Bytes::from_static(b"x"))
            .encode()
            .unwrap()
            .to_vec();
        raw[3] = 0x7F;
        assert!(matches!(
            Envelope::decode(Bytes::from(raw)),
            Err(SgpError::UnknownKind(0x7F))
        ));
    }

    #[test]
    fn envelope_payload_tamper_detected() {
        let envelope = Envelope::new(
            EnvelopeKind::Data,
            3,
            Bytes::from(vec![0xAA; 32]),
        );
        let mut raw = envelope.encode().unwrap().to_vec();
        raw[ENVELOPE_HEADER_SIZE + 5] ^= 0x01;
        assert!(matches!(
            Envelope::decode(Bytes::from(raw)),
            Err(SgpError::ChecksumMismatch)
        ));
    }

    #[test]
    fn envelope_truncated_payload_rejected() {
        let envelope = Envelope::new(EnvelopeKind::Data, 3, Bytes::from(vec![0xAA; 32]));
        let raw = envelope.encode().unwrap().to_vec();
        let truncated = Bytes::from(raw[..raw.len() - 4].to_vec());
        assert!(matches!(
            Envelope::decode(truncated),
            Err(SgpError::LengthMismatch(32, 28))
        ));
    }

    #[test]
    fn quick_check_discriminates() {
        let raw = Envelope::new(EnvelopeKind::Data, 0, Bytes::new())
            .encode()
            .unwrap();
        assert!(Envelope::quick_check(&raw));
        assert!(!Envelope::quick_check(&[0x00; 32]));
        assert!(!Envelope::quick_check(&SGP_MAGIC)); // Too short
    }
}
