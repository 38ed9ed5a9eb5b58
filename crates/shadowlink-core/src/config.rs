//! Node configuration.
//!
//! Retry counts, backoff, and keepalive cadence are configuration, not
//! constants baked into the negotiation logic; the defaults here are
//! conservative and every knob can be overridden by the embedding
//! application.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Public STUN services probed when building the local contact link.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP listen address for inbound contacts.
    pub listen: SocketAddr,

    /// STUN servers probed in order for the reflexive address; first
    /// success wins.
    pub stun_servers: Vec<String>,

    /// Relay to keep a listener registration with, and to fall back to
    /// when a peer token carries no relay hint.
    pub relay: Option<SocketAddr>,

    /// Per-probe timeout for a single STUN binding request.
    pub discovery_timeout: Duration,

    /// Overall window for the direct connection phase; when it elapses
    /// without a completed handshake the negotiator falls back to relay.
    pub direct_attempt_timeout: Duration,

    /// Handshake retries per candidate address within the window.
    pub max_direct_attempts: u32,

    /// How many candidate addresses race concurrently.
    pub direct_fanout: usize,

    /// Base delay between handshake retries; grows linearly per retry.
    pub retry_backoff: Duration,

    /// Idle interval after which a keepalive probe is sent.
    pub keepalive_interval: Duration,

    /// Peer silence beyond `keepalive_interval * keepalive_miss_limit`
    /// closes the session.
    pub keepalive_miss_limit: u32,

    /// Largest application message accepted for send or delivery.
    pub max_message_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:0".parse().expect("valid default listen address"),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            relay: None,
            discovery_timeout: Duration::from_secs(3),
            direct_attempt_timeout: Duration::from_secs(5),
            max_direct_attempts: 3,
            direct_fanout: 4,
            retry_backoff: Duration::from_millis(250),
            keepalive_interval: Duration::from_secs(15),
            keepalive_miss_limit: 3,
            max_message_bytes: 1024 * 1024,
        }
    }
}

impl NodeConfig {
    /// Peer silence longer than this closes the session.
    pub fn keepalive_deadline(&self) -> Duration {
        self.keepalive_interval * self.keepalive_miss_limit.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NodeConfig::default();
        assert!(!config.stun_servers.is_empty());
        assert!(config.relay.is_none());
        assert!(config.direct_fanout >= 1);
        assert_eq!(config.keepalive_deadline(), config.keepalive_interval * 3);
    }
}
