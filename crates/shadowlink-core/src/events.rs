//! Node event stream.
//!
//! The engine never touches disk or screen; everything the UI and
//! persistence collaborators need flows out of a broadcast channel of
//! [`NodeEvent`]s. Subscribers that lag simply miss events, exactly as
//! with any `tokio::sync::broadcast` consumer.

use sgp_crypto::ShadowId;
use uuid::Uuid;

use crate::peer::Route;

/// Per-peer connection status, as shown to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Events emitted by a [`crate::node::Node`].
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer's connection status changed.
    Status { peer: ShadowId, status: PeerStatus },

    /// A peer was resolved to a live, authenticated route. The
    /// persistence collaborator typically stores the contact here.
    ContactResolved { peer: ShadowId, route: Route },

    /// A decrypted application message arrived in order.
    Message {
        session: Uuid,
        peer: ShadowId,
        data: Vec<u8>,
    },
}
