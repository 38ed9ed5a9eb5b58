//! Envelope sealing with replay protection.
//!
//! A [`SessionCipher`] wraps the directional keys produced by the
//! handshake and turns plaintext into wire [`Envelope`]s:
//! - ChaCha20-Poly1305 with the sequence number as explicit nonce
//! - envelope kind and sequence bound as associated data
//! - strictly increasing sequence acceptance per direction
//!
//! Strict ordering is deliberate: the transport drops anything that
//! arrives out of order rather than buffering and reordering, so a
//! stale or replayed envelope always surfaces as [`SealError::Replay`].
//! The replay check runs before decryption (fail fast); acceptance
//! state only advances after the tag verifies, so bogus sequence
//! numbers cannot wedge the channel.

use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use thiserror::Error;

use crate::handshake::SessionKeys;
use sgp_core::{Envelope, EnvelopeKind, SGP_VERSION};

/// Sealing and opening errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("authentication failed")]
    Authentication,

    #[error("replay rejected: sequence {0}")]
    Replay(u64),

    #[error("encryption failed")]
    Encryption,

    #[error("sequence space exhausted")]
    Exhausted,
}

/// Strictly-increasing sequence acceptance for one session direction.
///
/// Sequence numbers start at 0; an envelope is accepted only if its
/// sequence is strictly greater than the last accepted one.
#[derive(Debug, Clone, Default)]
pub struct SequenceGate {
    last: Option<u64>,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check without updating state.
    pub fn check(&self, seq: u64) -> bool {
        match self.last {
            None => true,
            Some(last) => seq > last,
        }
    }

    /// Mark a sequence number as accepted.
    pub fn advance(&mut self, seq: u64) {
        self.last = Some(seq);
    }

    /// The last accepted sequence number, if any.
    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

/// Per-session authenticated encryption with replay protection.
///
/// Owns the outbound counter and the inbound gate for exactly one
/// session; never shared across sessions or directions.
pub struct SessionCipher {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    tx_seq: u64,
    rx_gate: SequenceGate,
}

impl SessionCipher {
    /// Create a cipher from handshake-derived session keys.
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            send: ChaCha20Poly1305::new((&keys.send).into()),
            recv: ChaCha20Poly1305::new((&keys.recv).into()),
            tx_seq: 0,
            rx_gate: SequenceGate::new(),
        }
    }

    /// Seal plaintext into an envelope, consuming the next outbound
    /// sequence number.
    pub fn seal(&mut self, kind: EnvelopeKind, plaintext: &[u8]) -> Result<Envelope, SealError> {
        let seq = self.tx_seq;
        self.tx_seq = self.tx_seq.checked_add(1).ok_or(SealError::Exhausted)?;

        let nonce = sequence_nonce(seq);
        let aad = seal_aad(kind, seq);

        let ciphertext = self
            .send
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| SealError::Encryption)?;

        Ok(Envelope::new(kind, seq, Bytes::from(ciphertext)))
    }

    /// Open an envelope, enforcing strict sequence ordering.
    pub fn open(&mut self, envelope: &Envelope) -> Result<Vec<u8>, SealError> {
        // Replay check BEFORE decryption (fail fast)
        if !self.rx_gate.check(envelope.sequence) {
            return Err(SealError::Replay(envelope.sequence));
        }

        let nonce = sequence_nonce(envelope.sequence);
        let aad = seal_aad(envelope.kind, envelope.sequence);

        let plaintext = self
            .recv
            .decrypt(
                &nonce,
                Payload {
                    msg: &envelope.payload,
                    aad: &aad,
                },
            )
            .map_err(|_| SealError::Authentication)?;

        // Only advance after the tag verified, so forged sequence
        // numbers cannot block legitimate traffic.
        self.rx_gate.advance(envelope.sequence);

        Ok(plaintext)
    }

    /// Next outbound sequence number (without consuming it).
    pub fn next_tx_seq(&self) -> u64 {
        self.tx_seq
    }

    /// Last accepted inbound sequence number.
    pub fn last_rx_seq(&self) -> Option<u64> {
        self.rx_gate.last()
    }
}

/// Convert a sequence number to a 12-byte nonce for ChaCha20-Poly1305.
fn sequence_nonce(seq: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&seq.to_le_bytes());
    Nonce::from(nonce_bytes)
}

/// Associated data: version, kind, sequence.
fn seal_aad(kind: EnvelopeKind, seq: u64) -> [u8; 10] {
    let mut aad = [0u8; 10];
    aad[0] = SGP_VERSION;
    aad[1] = kind as u8;
    aad[2..].copy_from_slice(&seq.to_be_bytes());
    aad
}
