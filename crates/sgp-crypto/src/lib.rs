//! Cryptographic primitives for Shadowlink.
//!
//! This crate provides:
//! - Ed25519 identity keys and Shadow IDs
//! - Noise XX handshake with long-term identity binding
//! - Sealed envelopes with strict-ordering replay protection
//! - The portable SG link contact token
//!
//! # Design
//!
//! Sessions are established with the Noise XX pattern
//! (`Noise_XX_25519_ChaChaPoly_BLAKE2s`) which provides:
//! - Mutual authentication (both peers prove identity)
//! - Identity hiding (static keys encrypted during handshake)
//! - Forward secrecy (ephemeral keys per session)
//!
//! The X25519 static key used by Noise is bound to the long-term
//! Ed25519 identity by a signed proof carried inside the encrypted
//! handshake payloads, so a completed handshake authenticates the
//! Shadow ID, not just a transport key.
//!
//! For UDP transport, envelopes are sealed with explicit
//! sequence-number nonces so the receiver never has to decrypt
//! in lockstep with an internal counter.
//!
//! No I/O happens anywhere in this crate.

#![forbid(unsafe_code)]

pub mod handshake;
pub mod identity;
pub mod seal;
pub mod token;

pub use handshake::{HandshakeError, Initiator, RemoteIdentity, Responder, SessionKeys};
pub use identity::{CryptoError, Identity, ShadowId, IDENTITY_BYTES};
pub use seal::{SealError, SequenceGate, SessionCipher};
pub use token::{ContactToken, RendezvousHint, TokenError};
