//! The SG link: portable contact token.
//!
//! An SG link is the copy-pasteable string two people exchange
//! out-of-band to introduce their nodes:
//!
//! ```text
//! sg://<base64url(body || signature || crc16)>
//! ```
//!
//! The body embeds the owner's Ed25519 verify key, the X25519 transport
//! key the handshake will see, and zero or more rendezvous hints. The
//! signature binds the whole body to the embedded identity and must
//! verify before the token is used; the trailing CRC catches casual
//! corruption early. Hints are advisory, a place to try first rather
//! than an authenticated claim.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use crate::identity::{Identity, ShadowId};

/// URI scheme for contact tokens.
pub const TOKEN_SCHEME: &str = "sg://";

/// Domain separator for token signatures.
const TOKEN_CONTEXT: &[u8] = b"sgp-contact-token-v1";

/// Ed25519 signature size.
const SIGNATURE_SIZE: usize = 64;

/// Trailing CRC-16 size.
const CHECKSUM_SIZE: usize = 2;

/// Token decoding errors. All of them mean the same thing to a caller:
/// the string is not a usable SG link.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("missing {TOKEN_SCHEME} scheme")]
    Scheme,

    #[error("invalid base64 encoding")]
    Encoding,

    #[error("token truncated: {0} bytes")]
    Truncated(usize),

    #[error("checksum mismatch")]
    Checksum,

    #[error("malformed token body")]
    Body,

    #[error("embedded key invalid")]
    Key,

    #[error("signature verification failed")]
    Signature,
}

/// Where to try reaching the token's owner first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendezvousHint {
    /// Last-known direct address.
    Direct(SocketAddr),
    /// Relay the owner keeps a registration with.
    Relay(SocketAddr),
}

impl fmt::Display for RendezvousHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(addr) => write!(f, "direct:{addr}"),
            Self::Relay(addr) => write!(f, "relay:{addr}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TokenBody {
    verify_key: [u8; 32],
    transport_key: [u8; 32],
    hints: Vec<RendezvousHint>,
}

/// A decoded, signature-checked contact token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactToken {
    pub verify_key: [u8; 32],
    pub transport_key: [u8; 32],
    pub hints: Vec<RendezvousHint>,
}

impl ContactToken {
    /// The owner's Shadow ID.
    pub fn shadow_id(&self) -> ShadowId {
        ShadowId::from_bytes(&self.verify_key)
    }

    /// Encode the local identity plus hints into an SG link.
    pub fn encode(identity: &Identity, hints: &[RendezvousHint]) -> String {
        let body = TokenBody {
            verify_key: identity.verify_key_bytes(),
            transport_key: identity.transport_public(),
            hints: hints.to_vec(),
        };
        let body_bytes = bincode::serialize(&body).expect("token body serializes");

        let mut message = Vec::with_capacity(TOKEN_CONTEXT.len() + body_bytes.len());
        message.extend_from_slice(TOKEN_CONTEXT);
        message.extend_from_slice(&body_bytes);
        let signature = identity.sign(&message);

        let mut bytes = body_bytes;
        bytes.extend_from_slice(&signature);

        let mut state = crc16::State::<crc16::KERMIT>::new();
        state.update(&bytes);
        bytes.extend_from_slice(&state.get().to_be_bytes());

        format!("{}{}", TOKEN_SCHEME, URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Decode and verify an SG link.
    ///
    /// Any structural damage, checksum failure, or signature failure is
    /// rejected; hints come out exactly as the owner encoded them.
    pub fn decode(link: &str) -> Result<Self, TokenError> {
        let encoded = link.strip_prefix(TOKEN_SCHEME).ok_or(TokenError::Scheme)?;

        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::Encoding)?;

        if bytes.len() < SIGNATURE_SIZE + CHECKSUM_SIZE + 1 {
            return Err(TokenError::Truncated(bytes.len()));
        }

        let (signed, checksum) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        let mut state = crc16::State::<crc16::KERMIT>::new();
        state.update(signed);
        if state.get() != u16::from_be_bytes([checksum[0], checksum[1]]) {
            return Err(TokenError::Checksum);
        }

        let (body_bytes, signature) = signed.split_at(signed.len() - SIGNATURE_SIZE);
        let body: TokenBody = bincode::deserialize(body_bytes).map_err(|_| TokenError::Body)?;

        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&body.verify_key)
            .map_err(|_| TokenError::Key)?;

        let mut message = Vec::with_capacity(TOKEN_CONTEXT.len() + body_bytes.len());
        message.extend_from_slice(TOKEN_CONTEXT);
        message.extend_from_slice(body_bytes);

        let mut sig_bytes = [0u8; SIGNATURE_SIZE];
        sig_bytes.copy_from_slice(signature);
        verifying_key
            .verify_strict(&message, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
            .map_err(|_| TokenError::Signature)?;

        Ok(Self {
            verify_key: body.verify_key,
            transport_key: body.transport_key,
            hints: body.hints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hints() -> Vec<RendezvousHint> {
        vec![
            RendezvousHint::Direct("198.51.100.7:41641".parse().unwrap()),
            RendezvousHint::Relay("203.0.113.2:3478".parse().unwrap()),
        ]
    }

    #[test]
    fn test_token_roundtrip() {
        let identity = Identity::generate().unwrap();
        let hints = sample_hints();

        let link = ContactToken::encode(&identity, &hints);
        assert!(link.starts_with(TOKEN_SCHEME));

        let token = ContactToken::decode(&link).unwrap();
        assert_eq!(token.verify_key, identity.verify_key_bytes());
        assert_eq!(token.transport_key, identity.transport_public());
        assert_eq!(token.hints, hints);
        assert_eq!(token.shadow_id(), identity.shadow_id());
    }

    #[test]
    fn test_token_roundtrip_no_hints() {
        let identity = Identity::generate().unwrap();
        let link = ContactToken::encode(&identity, &[]);
        let token = ContactToken::decode(&link).unwrap();
        assert!(token.hints.is_empty());
    }

    #[test]
    fn test_missing_scheme_rejected() {
        let identity = Identity::generate().unwrap();
        let link = ContactToken::encode(&identity, &[]);
        let stripped = link.strip_prefix(TOKEN_SCHEME).unwrap();
        assert_eq!(ContactToken::decode(stripped), Err(TokenError::Scheme));
    }

    #[test]
    fn test_truncated_token_rejected() {
        assert!(ContactToken::decode("sg://AAAA").is_err());
        assert!(ContactToken::decode("sg://").is_err());
    }

    #[test]
    fn test_every_single_character_mutation_rejected() {
        let identity = Identity::generate().unwrap();
        let link = ContactToken::encode(&identity, &sample_hints());

        for idx in 0..link.len() {
            let original = link.as_bytes()[idx];
            let replacement = if original == b'A' { b'B' } else { b'A' };

            let mut mutated = link.clone().into_bytes();
            mutated[idx] = replacement;
            let mutated = String::from_utf8(mutated).unwrap();

            assert!(
                ContactToken::decode(&mutated).is_err(),
                "mutation at byte {} went undetected",
                idx
            );
        }
    }

    #[test]
    fn test_wrong_signer_rejected() {
        // Body from one identity, signature from another: splice the
        // verify key of B into A's token and re-checksum.
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let link = ContactToken::encode(&alice, &[]);
        let encoded = link.strip_prefix(TOKEN_SCHEME).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(encoded).unwrap();

        // bincode lays the verify key out first in the body
        bytes[..32].copy_from_slice(&bob.verify_key_bytes());
        let len = bytes.len();
        let mut state = crc16::State::<crc16::KERMIT>::new();
        state.update(&bytes[..len - CHECKSUM_SIZE]);
        bytes[len - CHECKSUM_SIZE..].copy_from_slice(&state.get().to_be_bytes());

        let forged = format!("{}{}", TOKEN_SCHEME, URL_SAFE_NO_PAD.encode(bytes));
        assert_eq!(ContactToken::decode(&forged), Err(TokenError::Signature));
    }
}
