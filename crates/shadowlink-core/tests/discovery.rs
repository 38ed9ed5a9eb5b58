//! Address discovery against an in-process STUN responder.

use std::net::SocketAddr;
use std::time::Duration;

use sgp_core::stun::{encode_binding_response, BINDING_REQUEST, STUN_MAGIC_COOKIE};
use shadowlink_core::{discover_public_address, probe_stun_servers, DiscoveryError};
use tokio::net::UdpSocket;

/// A fake STUN service that advertises a fixed reflexive address.
async fn spawn_fake_stun(advertised: SocketAddr) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            if len < 20 {
                continue;
            }
            let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
            let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            if msg_type != BINDING_REQUEST || cookie != STUN_MAGIC_COOKIE {
                continue;
            }
            let mut transaction_id = [0u8; 12];
            transaction_id.copy_from_slice(&buf[8..20]);
            let response = encode_binding_response(&transaction_id, advertised);
            let _ = socket.send_to(&response, src).await;
        }
    });

    addr
}

#[tokio::test]
async fn test_discover_reports_advertised_address() {
    let advertised: SocketAddr = "203.0.113.5:41641".parse().unwrap();
    let stun_addr = spawn_fake_stun(advertised).await;

    let observed = discover_public_address(&stun_addr.to_string(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(observed, advertised);
}

#[tokio::test]
async fn test_discover_times_out_when_silent() {
    // A socket that never answers
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let result = discover_public_address(&addr.to_string(), Duration::from_millis(200)).await;
    assert!(matches!(result, Err(DiscoveryError::Timeout(_, _))));
}

#[tokio::test]
async fn test_discover_rejects_bad_endpoint() {
    // Missing port: resolution fails before any packet is sent
    let result = discover_public_address("127.0.0.1", Duration::from_millis(200)).await;
    assert!(matches!(result, Err(DiscoveryError::Unreachable(_))));
}

#[tokio::test]
async fn test_probe_takes_first_working_server() {
    let advertised: SocketAddr = "198.51.100.10:5000".parse().unwrap();
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let stun_addr = spawn_fake_stun(advertised).await;

    let servers = vec![silent_addr.to_string(), stun_addr.to_string()];
    let observed = probe_stun_servers(&servers, Duration::from_millis(200)).await;
    assert_eq!(observed, Some(advertised));
}

#[tokio::test]
async fn test_probe_gives_up_when_all_fail() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let servers = vec![silent.local_addr().unwrap().to_string()];
    let observed = probe_stun_servers(&servers, Duration::from_millis(100)).await;
    assert_eq!(observed, None);
}
