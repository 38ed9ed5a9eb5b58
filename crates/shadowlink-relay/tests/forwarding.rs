//! End-to-end forwarding through an in-process relay.

use std::sync::Arc;
use std::time::Duration;

use shadowlink_relay::{Relay, RelayConfig};
use sgp_core::relay::{
    encode_packet, KeyPayload, OpenRejectPayload, OpenRejectReason, RegisterAckPayload,
    RelayHeader, RelayPacketType, RELAY_HEADER_SIZE,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use uuid::Uuid;

async fn spawn_relay() -> (Arc<Relay>, std::net::SocketAddr) {
    let relay = Arc::new(
        Relay::bind("127.0.0.1:0".parse().unwrap(), RelayConfig::default())
            .await
            .unwrap(),
    );
    let addr = relay.local_addr().unwrap();
    let runner = relay.clone();
    tokio::spawn(async move { runner.run().await });
    (relay, addr)
}

async fn recv_packet(socket: &UdpSocket) -> (RelayHeader, Vec<u8>) {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for relay packet")
        .unwrap();
    let header = RelayHeader::decode(&buf[..len]).unwrap();
    (header, buf[RELAY_HEADER_SIZE..len].to_vec())
}

#[tokio::test]
async fn test_register_open_forward() {
    let (_relay, relay_addr) = spawn_relay().await;

    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let listen_key = [0x42u8; 32];

    // Listener registers
    let mut key_buf = [0u8; KeyPayload::SIZE];
    KeyPayload { key: listen_key }.encode(&mut key_buf).unwrap();
    let register = encode_packet(RelayPacketType::Register, Uuid::nil(), &key_buf).unwrap();
    listener.send_to(&register, relay_addr).await.unwrap();

    let (header, payload) = recv_packet(&listener).await;
    assert_eq!(header.packet_type, RelayPacketType::RegisterAck);
    let ack = RegisterAckPayload::decode(&payload).unwrap();
    assert!(ack.ttl_secs > 0);

    // Caller opens a circuit
    let open = encode_packet(RelayPacketType::Open, Uuid::nil(), &key_buf).unwrap();
    caller.send_to(&open, relay_addr).await.unwrap();

    let (header, _) = recv_packet(&caller).await;
    assert_eq!(header.packet_type, RelayPacketType::OpenAck);
    let circuit = header.circuit;
    assert_ne!(circuit, Uuid::nil());

    // Listener is told about the new circuit
    let (header, _) = recv_packet(&listener).await;
    assert_eq!(header.packet_type, RelayPacketType::Incoming);
    assert_eq!(header.circuit, circuit);

    // Caller -> listener through the circuit
    let forward = encode_packet(RelayPacketType::Forward, circuit, b"caller says hi").unwrap();
    caller.send_to(&forward, relay_addr).await.unwrap();

    let (header, payload) = recv_packet(&listener).await;
    assert_eq!(header.packet_type, RelayPacketType::Forward);
    assert_eq!(header.circuit, circuit);
    assert_eq!(payload, b"caller says hi");

    // Listener -> caller back through the same circuit
    let reply = encode_packet(RelayPacketType::Forward, circuit, b"listener replies").unwrap();
    listener.send_to(&reply, relay_addr).await.unwrap();

    let (header, payload) = recv_packet(&caller).await;
    assert_eq!(header.packet_type, RelayPacketType::Forward);
    assert_eq!(payload, b"listener replies");
}

#[tokio::test]
async fn test_open_unknown_target_rejected() {
    let (_relay, relay_addr) = spawn_relay().await;

    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut key_buf = [0u8; KeyPayload::SIZE];
    KeyPayload { key: [0x99u8; 32] }.encode(&mut key_buf).unwrap();
    let open = encode_packet(RelayPacketType::Open, Uuid::nil(), &key_buf).unwrap();
    caller.send_to(&open, relay_addr).await.unwrap();

    let (header, payload) = recv_packet(&caller).await;
    assert_eq!(header.packet_type, RelayPacketType::OpenReject);
    let reject = OpenRejectPayload::decode(&payload).unwrap();
    assert_eq!(reject.reason, OpenRejectReason::UnknownTarget);
}

#[tokio::test]
async fn test_forward_unknown_circuit_dropped() {
    let (relay, relay_addr) = spawn_relay().await;

    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let forward = encode_packet(RelayPacketType::Forward, Uuid::new_v4(), b"nowhere").unwrap();
    caller.send_to(&forward, relay_addr).await.unwrap();

    // Nothing comes back and no circuit appears
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.active_circuit_count().await, 0);
}
