//! Per-contact runtime records.
//!
//! One [`Peer`] exists per imported contact, owned by the negotiator.
//! It tracks the current negotiation phase, the candidate addresses to
//! try (most-recently-successful first, then hinted order), and the
//! history of connection attempts.

use std::fmt;
use std::net::SocketAddr;

use sgp_crypto::{ContactToken, RendezvousHint, ShadowId};

/// How a peer is (or was attempted to be) reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct(SocketAddr),
    Relay(SocketAddr),
}

impl Route {
    pub fn is_relay(&self) -> bool {
        matches!(self, Route::Relay(_))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct(addr) => write!(f, "direct {addr}"),
            Route::Relay(addr) => write!(f, "relay {addr}"),
        }
    }
}

/// How one attempt over one route ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    TimedOut,
    Refused,
    HandshakeFailed,
    Cancelled,
}

/// One entry in a peer's attempt history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    pub route: Route,
    pub outcome: AttemptOutcome,
}

/// Negotiation state machine phases.
///
/// `Failed` is terminal for a negotiation cycle and `Closed` for a
/// session; reconnecting starts a fresh cycle from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    AddressResolving,
    DirectAttempt,
    DirectEstablished,
    RelayAttempt,
    RelayEstablished,
    Active,
    Closed,
    Failed,
}

/// Runtime record for one known contact.
#[derive(Debug)]
pub struct Peer {
    token: ContactToken,
    phase: NegotiationPhase,
    last_good_route: Option<Route>,
    attempts: Vec<AttemptRecord>,
}

impl Peer {
    pub fn from_token(token: ContactToken) -> Self {
        Self {
            token,
            phase: NegotiationPhase::Idle,
            last_good_route: None,
            attempts: Vec::new(),
        }
    }

    pub fn shadow_id(&self) -> ShadowId {
        self.token.shadow_id()
    }

    pub fn token(&self) -> &ContactToken {
        &self.token
    }

    /// Replace the stored token, e.g. when a contact is re-imported
    /// with fresh hints.
    pub fn update_token(&mut self, token: ContactToken) {
        self.token = token;
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: NegotiationPhase) {
        self.phase = phase;
    }

    /// Direct candidate addresses in attempt order:
    /// most-recently-successful first, then hinted order.
    pub fn candidates(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        if let Some(Route::Direct(addr)) = self.last_good_route {
            out.push(addr);
        }
        for hint in &self.token.hints {
            if let RendezvousHint::Direct(addr) = hint {
                if !out.contains(addr) {
                    out.push(*addr);
                }
            }
        }
        out
    }

    /// The relay hinted by the token, if any.
    pub fn relay_hint(&self) -> Option<SocketAddr> {
        self.token.hints.iter().find_map(|hint| match hint {
            RendezvousHint::Relay(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Record an attempt outcome; successes also become the preferred
    /// candidate for the next negotiation cycle.
    pub fn record_attempt(&mut self, route: Route, outcome: AttemptOutcome) {
        if outcome == AttemptOutcome::Succeeded {
            self.last_good_route = Some(route);
        }
        self.attempts.push(AttemptRecord { route, outcome });
    }

    pub fn attempt_history(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn last_good_route(&self) -> Option<Route> {
        self.last_good_route
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgp_crypto::Identity;

    fn token_with_hints(hints: &[RendezvousHint]) -> ContactToken {
        let identity = Identity::generate().unwrap();
        let link = ContactToken::encode(&identity, hints);
        ContactToken::decode(&link).unwrap()
    }

    #[test]
    fn candidates_follow_hint_order() {
        let a: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:2000".parse().unwrap();
        let relay: SocketAddr = "192.0.2.9:3478".parse().unwrap();

        let peer = Peer::from_token(token_with_hints(&[
            RendezvousHint::Direct(a),
            RendezvousHint::Relay(relay),
            RendezvousHint::Direct(b),
        ]));

        assert_eq!(peer.candidates(), vec![a, b]);
        assert_eq!(peer.relay_hint(), Some(relay));
    }

    #[test]
    fn last_success_is_preferred() {
        let a: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:2000".parse().unwrap();

        let mut peer = Peer::from_token(token_with_hints(&[
            RendezvousHint::Direct(a),
            RendezvousHint::Direct(b),
        ]));

        peer.record_attempt(Route::Direct(b), AttemptOutcome::Succeeded);
        assert_eq!(peer.candidates(), vec![b, a]);

        // Failures do not change preference
        peer.record_attempt(Route::Direct(a), AttemptOutcome::Refused);
        assert_eq!(peer.candidates(), vec![b, a]);
        assert_eq!(peer.attempt_history().len(), 2);
    }

    #[test]
    fn fresh_peer_is_idle_with_empty_history() {
        let peer = Peer::from_token(token_with_hints(&[]));
        assert_eq!(peer.phase(), NegotiationPhase::Idle);
        assert!(peer.attempt_history().is_empty());
        assert!(peer.candidates().is_empty());
        assert!(peer.relay_hint().is_none());
    }
}
