//! Shadowlink engine: peer connection establishment, NAT traversal
//! with relay fallback, and the encrypted session protocol.
//!
//! This crate provides:
//! - Reflexive address discovery against STUN-class services
//! - The connection negotiator: raced direct attempts, relay fallback
//! - Encrypted session transport with keepalive and strict ordering
//! - The [`node::Node`] facade the UI and persistence layers talk to
//!
//! # Design
//!
//! One negotiation runs per peer, independently of all others; the
//! only shared state is the process identity, which is immutable after
//! construction. Everything network-facing suspends on Tokio; nothing
//! blocks. Candidate addresses race with bounded fan-out and explicit
//! cancellation, so losing sockets close instead of leaking.

#![forbid(unsafe_code)]

pub mod config;
pub mod discovery;
pub mod events;
pub mod negotiator;
pub mod node;
pub mod peer;
pub mod transport;

pub use config::NodeConfig;
pub use discovery::{discover_public_address, probe_stun_servers, DiscoveryError};
pub use events::{NodeEvent, PeerStatus};
pub use negotiator::ConnectError;
pub use node::Node;
pub use peer::{AttemptOutcome, AttemptRecord, NegotiationPhase, Peer, Route};
pub use transport::{SessionHandle, TransportError};

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
