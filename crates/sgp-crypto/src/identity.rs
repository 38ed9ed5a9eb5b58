//! Ed25519 identity keys and Shadow ID.
//!
//! A **Shadow ID** is the base64url-encoded Ed25519 public key (32 bytes
//! → 43 characters). This is the stable identifier a contact token
//! carries and the name under which peers know each other.
//!
//! An [`Identity`] also owns an X25519 static keypair used by the Noise
//! handshake; both halves are generated together and serialized
//! together, so one 64-byte blob restores the whole identity. The
//! process holds exactly one `Identity`, constructed explicitly at
//! startup and shared read-only from then on; persistence is the
//! embedding application's job.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

/// Identity construction errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Shadow ID: base64url-encoded Ed25519 public key.
///
/// 32 bytes encoded as 43 characters (no padding).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShadowId(String);

impl ShadowId {
    /// Create a Shadow ID from raw public key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse a Shadow ID from its string representation.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| CryptoError::InvalidKey("invalid base64url encoding".into()))?;

        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "invalid Shadow ID length: expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Self(s.to_string()))
    }

    /// Get the raw public key bytes.
    pub fn to_bytes(&self) -> Result<[u8; 32], CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|_| CryptoError::InvalidKey("invalid base64url encoding".into()))?;

        bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("invalid key length".into()))
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShadowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ShadowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShadowId({})", self.0)
    }
}

/// Serialized identity size: Ed25519 seed plus X25519 secret.
pub const IDENTITY_BYTES: usize = 64;

/// A node's long-lived identity.
///
/// Holds the Ed25519 signing keypair and the X25519 static keypair the
/// Noise handshake runs with. The secret halves never leave this struct
/// except through [`Identity::to_bytes`], which exists solely so the
/// embedding application can persist the identity.
pub struct Identity {
    signing_key: SigningKey,
    transport_secret: x25519_dalek::StaticSecret,
}

impl Identity {
    /// Generate a fresh identity from the OS CSPRNG.
    ///
    /// Fails only when the entropy source is unavailable.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let mut transport = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut transport)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        let transport_secret = x25519_dalek::StaticSecret::from(transport);
        transport.zeroize();

        Ok(Self {
            signing_key,
            transport_secret,
        })
    }

    /// Restore an identity from its 64-byte serialized form.
    pub fn from_bytes(bytes: &[u8; IDENTITY_BYTES]) -> Self {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let mut transport = [0u8; 32];
        transport.copy_from_slice(&bytes[32..]);
        let transport_secret = x25519_dalek::StaticSecret::from(transport);
        transport.zeroize();

        Self {
            signing_key,
            transport_secret,
        }
    }

    /// Serialize for external persistence.
    ///
    /// # Security
    /// Handle with care! These bytes can recreate the identity.
    pub fn to_bytes(&self) -> [u8; IDENTITY_BYTES] {
        let mut out = [0u8; IDENTITY_BYTES];
        out[..32].copy_from_slice(&self.signing_key.to_bytes());
        out[32..].copy_from_slice(&self.transport_secret.to_bytes());
        out
    }

    /// Get the Shadow ID (base64url-encoded Ed25519 public key).
    pub fn shadow_id(&self) -> ShadowId {
        ShadowId::from_bytes(self.signing_key.verifying_key().as_bytes())
    }

    /// Get the Ed25519 public key bytes.
    pub fn verify_key_bytes(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// Get the X25519 static public key the Noise handshake presents.
    pub fn transport_public(&self) -> [u8; 32] {
        *x25519_dalek::PublicKey::from(&self.transport_secret).as_bytes()
    }

    pub(crate) fn transport_secret_bytes(&self) -> [u8; 32] {
        self.transport_secret.to_bytes()
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this identity's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let sig = Signature::from_bytes(signature);
        self.signing_key
            .verifying_key()
            .verify(message, &sig)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let identity = Identity::generate().unwrap();
        let shadow_id = identity.shadow_id();

        // Shadow ID should be 43 characters (32 bytes base64url without padding)
        assert_eq!(shadow_id.as_str().len(), 43);
    }

    #[test]
    fn test_sign_verify() {
        let identity = Identity::generate().unwrap();
        let message = b"hello shadowlink";

        let signature = identity.sign(message);
        assert!(identity.verify(message, &signature));

        // Wrong message should fail
        assert!(!identity.verify(b"wrong message", &signature));
    }

    #[test]
    fn test_shadow_id_roundtrip() {
        let identity = Identity::generate().unwrap();
        let shadow_id = identity.shadow_id();

        let parsed = ShadowId::parse(shadow_id.as_str()).unwrap();
        assert_eq!(shadow_id, parsed);
        assert_eq!(parsed.to_bytes().unwrap(), identity.verify_key_bytes());
    }

    #[test]
    fn test_shadow_id_rejects_bad_input() {
        assert!(ShadowId::parse("not!base64url").is_err());
        assert!(ShadowId::parse("dG9vc2hvcnQ").is_err());
    }

    #[test]
    fn test_identity_bytes_roundtrip() {
        let identity = Identity::generate().unwrap();
        let restored = Identity::from_bytes(&identity.to_bytes());

        assert_eq!(restored.verify_key_bytes(), identity.verify_key_bytes());
        assert_eq!(restored.transport_public(), identity.transport_public());
    }

    #[test]
    fn test_distinct_identities() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        assert_ne!(a.shadow_id(), b.shadow_id());
    }
}
