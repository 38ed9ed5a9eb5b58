//! Noise Protocol handshake with identity binding.
//!
//! Uses Noise XX pattern: `Noise_XX_25519_ChaChaPoly_BLAKE2s`
//!
//! # Why XX?
//!
//! The XX pattern provides:
//! - **Mutual authentication**: Both peers prove their identity
//! - **Identity hiding**: Static keys are encrypted during handshake
//! - **Forward secrecy**: Ephemeral keys per session
//!
//! Shadowlink peers may connect for the first time knowing nothing but
//! a contact token. XX allows this while still hiding identities from
//! passive observers (relays, network sniffers).
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                             Responder
//!     |                                     |
//!     |  -> e                               |  ephemeral key
//!     |------------------------------------>|
//!     |                                     |
//!     |  <- e, ee, s, es  [identity proof]  |  ephemeral, static
//!     |<------------------------------------|
//!     |                                     |
//!     |  -> s, se  [identity proof]         |  static key
//!     |------------------------------------>|
//!     |                                     |
//!     [       Session keys established      ]
//! ```
//!
//! The bracketed payloads are encrypted by Noise and carry an
//! [`IdentityProof`]: an Ed25519 signature binding the sender's X25519
//! static key to its long-term identity. A handshake only completes if
//! the proof verifies against the static key Noise actually saw, so a
//! finished session authenticates a Shadow ID.
//!
//! Directional session keys are derived from the handshake hash; the
//! hash doubles as the session-binding transcript.

use snow::{Builder, HandshakeState};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::{Identity, ShadowId};

/// Noise protocol pattern (XX with X25519, ChaCha20-Poly1305, BLAKE2s)
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Maximum message size for Noise handshake
const MAX_HANDSHAKE_MSG_SIZE: usize = 1024;

/// Domain separator for identity proofs.
const PROOF_CONTEXT: &[u8] = b"sgp-identity-proof-v1";

/// Serialized proof size: verify key + signature.
const PROOF_SIZE: usize = 32 + 64;

/// Handshake errors.
///
/// `Malformed` and `Degenerate` cover bad remote key material;
/// `IdentityProof` is an authentication failure and must never be
/// retried by callers.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake message")]
    Malformed,

    #[error("degenerate key exchange: all-zero remote static key")]
    Degenerate,

    #[error("identity proof rejected")]
    IdentityProof,

    #[error("handshake not complete")]
    NotComplete,

    #[error("handshake already complete")]
    AlreadyComplete,

    #[error("noise error: {0}")]
    Noise(#[from] snow::Error),
}

/// Directional session keys plus the binding transcript hash.
///
/// Zeroed on drop; sessions own exactly one of these.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for sealing outbound envelopes.
    pub send: [u8; 32],
    /// Key for opening inbound envelopes.
    pub recv: [u8; 32],
    /// Handshake transcript hash; same value on both sides.
    pub transcript: [u8; 32],
}

/// The authenticated remote party of a completed (or half-completed)
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub shadow_id: ShadowId,
    pub verify_key: [u8; 32],
    pub static_key: [u8; 32],
}

fn encode_proof(identity: &Identity) -> Vec<u8> {
    let mut message = Vec::with_capacity(PROOF_CONTEXT.len() + 32);
    message.extend_from_slice(PROOF_CONTEXT);
    message.extend_from_slice(&identity.transport_public());

    let mut proof = Vec::with_capacity(PROOF_SIZE);
    proof.extend_from_slice(&identity.verify_key_bytes());
    proof.extend_from_slice(&identity.sign(&message));
    proof
}

fn verify_proof(payload: &[u8], static_key: &[u8; 32]) -> Result<RemoteIdentity, HandshakeError> {
    if payload.len() != PROOF_SIZE {
        return Err(HandshakeError::Malformed);
    }

    let mut verify_key = [0u8; 32];
    verify_key.copy_from_slice(&payload[..32]);
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(&payload[32..]);

    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&verify_key)
        .map_err(|_| HandshakeError::IdentityProof)?;

    let mut message = Vec::with_capacity(PROOF_CONTEXT.len() + 32);
    message.extend_from_slice(PROOF_CONTEXT);
    message.extend_from_slice(static_key);

    verifying_key
        .verify_strict(&message, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
        .map_err(|_| HandshakeError::IdentityProof)?;

    Ok(RemoteIdentity {
        shadow_id: ShadowId::from_bytes(&verify_key),
        verify_key,
        static_key: *static_key,
    })
}

// A zero key means the exchange degenerates to a known shared secret.
fn check_degenerate(key: &[u8; 32]) -> Result<(), HandshakeError> {
    if *key == [0u8; 32] {
        return Err(HandshakeError::Degenerate);
    }
    Ok(())
}

fn remote_static(state: &HandshakeState) -> Result<[u8; 32], HandshakeError> {
    let raw = state.get_remote_static().ok_or(HandshakeError::Malformed)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(raw);
    check_degenerate(&key)?;
    Ok(key)
}

fn capture_hash(state: &HandshakeState) -> Result<[u8; 32], HandshakeError> {
    state
        .get_handshake_hash()
        .try_into()
        .map_err(|_| HandshakeError::Malformed)
}

fn derive_keys(hash: &[u8; 32], is_initiator: bool) -> SessionKeys {
    // Directional keys from the transcript hash, separated by
    // fixed-length labels; the hash itself is the session binder.
    const LABEL_I2R: [u8; 32] = *b"sgp-kdf-initiator-to-responder-0";
    const LABEL_R2I: [u8; 32] = *b"sgp-kdf-responder-to-initiator-0";

    let mut key_i2r = *hash;
    let mut key_r2i = *hash;
    for i in 0..32 {
        key_i2r[i] ^= LABEL_I2R[i];
        key_r2i[i] ^= LABEL_R2I[i];
    }

    let (send, recv) = if is_initiator {
        (key_i2r, key_r2i)
    } else {
        (key_r2i, key_i2r)
    };

    SessionKeys {
        send,
        recv,
        transcript: *hash,
    }
}

enum State {
    Handshake(Box<HandshakeState>),
    Complete,
    Invalid,
}

/// Handshake initiator (the side that imported a contact token).
pub struct Initiator {
    state: State,
    proof: Vec<u8>,
    handshake_hash: Option<[u8; 32]>,
    remote: Option<RemoteIdentity>,
}

impl Initiator {
    pub fn new(identity: &Identity) -> Result<Self, HandshakeError> {
        let builder = Builder::new(NOISE_PATTERN.parse()?);
        let state = builder
            .local_private_key(&identity.transport_secret_bytes())
            .build_initiator()?;

        Ok(Self {
            state: State::Handshake(Box::new(state)),
            proof: encode_proof(identity),
            handshake_hash: None,
            remote: None,
        })
    }

    /// Generate the first handshake message (-> e).
    pub fn first_message(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let state = match &mut self.state {
            State::Handshake(s) => s,
            _ => return Err(HandshakeError::AlreadyComplete),
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state.write_message(&[], &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Process the second handshake message (<- e, ee, s, es).
    ///
    /// Verifies the responder's identity proof against the static key
    /// the exchange actually produced.
    pub fn read_response(&mut self, message: &[u8]) -> Result<RemoteIdentity, HandshakeError> {
        let state = match &mut self.state {
            State::Handshake(s) => s,
            _ => return Err(HandshakeError::AlreadyComplete),
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state
            .read_message(message, &mut buf)
            .map_err(|_| HandshakeError::Malformed)?;
        buf.truncate(len);

        let static_key = remote_static(state)?;
        let remote = verify_proof(&buf, &static_key)?;
        self.remote = Some(remote.clone());
        Ok(remote)
    }

    /// Generate the third handshake message (-> s, se) carrying the
    /// local identity proof. Completes the handshake on this side.
    pub fn final_message(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.remote.is_none() {
            return Err(HandshakeError::NotComplete);
        }

        let old_state = std::mem::replace(&mut self.state, State::Invalid);
        let mut handshake = match old_state {
            State::Handshake(s) => s,
            other => {
                self.state = other;
                return Err(HandshakeError::AlreadyComplete);
            }
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = handshake.write_message(&self.proof, &mut buf)?;
        buf.truncate(len);

        self.handshake_hash = Some(capture_hash(&handshake)?);
        self.state = State::Complete;

        Ok(buf)
    }

    /// Check if the handshake is complete.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// The authenticated remote party, once message 2 is processed.
    pub fn remote_identity(&self) -> Option<&RemoteIdentity> {
        self.remote.as_ref()
    }

    /// Derive directional session keys from the completed handshake.
    pub fn into_session_keys(self) -> Result<(SessionKeys, RemoteIdentity), HandshakeError> {
        let hash = self.handshake_hash.ok_or(HandshakeError::NotComplete)?;
        let remote = self.remote.ok_or(HandshakeError::NotComplete)?;
        Ok((derive_keys(&hash, true), remote))
    }
}

/// Handshake responder (the side listening for inbound contacts).
pub struct Responder {
    state: State,
    proof: Vec<u8>,
    handshake_hash: Option<[u8; 32]>,
    remote: Option<RemoteIdentity>,
}

impl Responder {
    pub fn new(identity: &Identity) -> Result<Self, HandshakeError> {
        let builder = Builder::new(NOISE_PATTERN.parse()?);
        let state = builder
            .local_private_key(&identity.transport_secret_bytes())
            .build_responder()?;

        Ok(Self {
            state: State::Handshake(Box::new(state)),
            proof: encode_proof(identity),
            handshake_hash: None,
            remote: None,
        })
    }

    /// Process the first handshake message (-> e).
    pub fn read_first(&mut self, message: &[u8]) -> Result<(), HandshakeError> {
        let state = match &mut self.state {
            State::Handshake(s) => s,
            _ => return Err(HandshakeError::AlreadyComplete),
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        state
            .read_message(message, &mut buf)
            .map_err(|_| HandshakeError::Malformed)?;
        Ok(())
    }

    /// Generate the second handshake message (<- e, ee, s, es)
    /// carrying the local identity proof.
    pub fn response_message(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let state = match &mut self.state {
            State::Handshake(s) => s,
            _ => return Err(HandshakeError::AlreadyComplete),
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = state.write_message(&self.proof, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Process the third handshake message (-> s, se).
    ///
    /// Verifies the initiator's identity proof and completes the
    /// handshake on this side.
    pub fn read_final(&mut self, message: &[u8]) -> Result<RemoteIdentity, HandshakeError> {
        let old_state = std::mem::replace(&mut self.state, State::Invalid);
        let mut handshake = match old_state {
            State::Handshake(s) => s,
            other => {
                self.state = other;
                return Err(HandshakeError::AlreadyComplete);
            }
        };

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = match handshake.read_message(message, &mut buf) {
            Ok(len) => len,
            Err(_) => {
                self.state = State::Handshake(handshake);
                return Err(HandshakeError::Malformed);
            }
        };
        buf.truncate(len);

        let static_key = remote_static(&handshake)?;
        let remote = verify_proof(&buf, &static_key)?;

        self.handshake_hash = Some(capture_hash(&handshake)?);
        self.remote = Some(remote.clone());
        self.state = State::Complete;

        Ok(remote)
    }

    /// Check if the handshake is complete.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// Derive directional session keys from the completed handshake.
    pub fn into_session_keys(self) -> Result<(SessionKeys, RemoteIdentity), HandshakeError> {
        let hash = self.handshake_hash.ok_or(HandshakeError::NotComplete)?;
        let remote = self.remote.ok_or(HandshakeError::NotComplete)?;
        Ok((derive_keys(&hash, false), remote))
    }
}
