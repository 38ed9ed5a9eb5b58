//! Reflexive address discovery.
//!
//! One STUN binding request per call; retry policy stays with the
//! caller. The negotiator probes the configured server list in order
//! and takes the first answer.

use std::net::SocketAddr;
use std::time::Duration;

use sgp_core::stun::StunMessage;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no response from {0} within {1:?}")]
    Timeout(String, Duration),

    #[error("discovery endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Ask one STUN-class server for our externally visible address.
///
/// A single best-effort probe: fresh socket, one binding request, one
/// response matched by transaction id.
pub async fn discover_public_address(
    server: &str,
    timeout: Duration,
) -> Result<SocketAddr, DiscoveryError> {
    let mut addrs = tokio::net::lookup_host(server)
        .await
        .map_err(|e| DiscoveryError::Unreachable(format!("{server}: {e}")))?;
    let target = addrs
        .next()
        .ok_or_else(|| DiscoveryError::Unreachable(format!("{server}: no addresses")))?;

    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid bind address")
    } else {
        "[::]:0".parse().expect("valid bind address")
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| DiscoveryError::Unreachable(e.to_string()))?;

    let request = StunMessage::new_binding_request();
    socket
        .send_to(&request.encode(), target)
        .await
        .map_err(|e| DiscoveryError::Unreachable(format!("{server}: {e}")))?;

    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| DiscoveryError::Timeout(server.to_string(), timeout))?
        .map_err(|e| DiscoveryError::Unreachable(format!("{server}: {e}")))?;

    StunMessage::decode_address(&buf[..len], &request.transaction_id)
        .map_err(|e| DiscoveryError::Unreachable(format!("{server}: {e}")))
}

/// Probe a server list in order, returning the first success.
pub async fn probe_stun_servers(servers: &[String], timeout: Duration) -> Option<SocketAddr> {
    for server in servers {
        match discover_public_address(server, timeout).await {
            Ok(addr) => {
                debug!("Reflexive address {} via {}", addr, server);
                return Some(addr);
            }
            Err(e) => debug!("STUN probe failed: {}", e),
        }
    }
    None
}
