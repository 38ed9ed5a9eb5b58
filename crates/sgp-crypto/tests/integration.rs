//! Integration tests for the handshake and sealed envelopes over UDP.

use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use bytes::Bytes;
use sgp_core::{Envelope, EnvelopeKind};
use sgp_crypto::{Identity, Initiator, Responder, SessionCipher};

/// Full Noise XX handshake over loopback UDP, followed by sealed
/// traffic in both directions.
#[tokio::test]
async fn test_handshake_and_sealed_traffic_over_udp() {
    let responder_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let responder_addr = responder_socket.local_addr().unwrap();

    let initiator_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let initiator_addr = initiator_socket.local_addr().unwrap();

    let alice = Identity::generate().unwrap();
    let bob = Identity::generate().unwrap();
    let alice_id = alice.shadow_id();
    let bob_id = bob.shadow_id();

    // Responder (Bob) task
    let bob_task = tokio::spawn(async move {
        let mut responder = Responder::new(&bob).unwrap();
        let mut buf = vec![0u8; 4096];

        // Handshake message 1
        let (len, peer) = responder_socket.recv_from(&mut buf).await.unwrap();
        let envelope = Envelope::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Handshake1);
        responder.read_first(&envelope.payload).unwrap();

        // Handshake message 2
        let msg2 = responder.response_message().unwrap();
        let envelope = Envelope::new(EnvelopeKind::Handshake2, 0, Bytes::from(msg2));
        responder_socket
            .send_to(&envelope.encode().unwrap(), peer)
            .await
            .unwrap();

        // Handshake message 3
        let (len, _) = responder_socket.recv_from(&mut buf).await.unwrap();
        let envelope = Envelope::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Handshake3);
        let remote = responder.read_final(&envelope.payload).unwrap();
        assert_eq!(remote.shadow_id, alice_id);

        let (keys, _) = responder.into_session_keys().unwrap();
        let mut cipher = SessionCipher::new(&keys);

        // Receive sealed data
        let (len, _) = responder_socket.recv_from(&mut buf).await.unwrap();
        let envelope = Envelope::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
        let plaintext = cipher.open(&envelope).unwrap();
        assert_eq!(&plaintext, b"ping");

        // Reply sealed
        let reply = cipher.seal(EnvelopeKind::Data, b"pong").unwrap();
        responder_socket
            .send_to(&reply.encode().unwrap(), initiator_addr)
            .await
            .unwrap();

        "responder_ok"
    });

    // Initiator (Alice) side
    let mut initiator = Initiator::new(&alice).unwrap();

    let msg1 = initiator.first_message().unwrap();
    let envelope = Envelope::new(EnvelopeKind::Handshake1, 0, Bytes::from(msg1));
    initiator_socket
        .send_to(&envelope.encode().unwrap(), responder_addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = timeout(Duration::from_secs(5), initiator_socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let envelope = Envelope::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
    assert_eq!(envelope.kind, EnvelopeKind::Handshake2);
    let remote = initiator.read_response(&envelope.payload).unwrap();
    assert_eq!(remote.shadow_id, bob_id);

    let msg3 = initiator.final_message().unwrap();
    let envelope = Envelope::new(EnvelopeKind::Handshake3, 0, Bytes::from(msg3));
    initiator_socket
        .send_to(&envelope.encode().unwrap(), responder_addr)
        .await
        .unwrap();

    assert!(initiator.is_complete());
    let (keys, _) = initiator.into_session_keys().unwrap();
    let mut cipher = SessionCipher::new(&keys);

    // Send sealed data
    let sealed = cipher.seal(EnvelopeKind::Data, b"ping").unwrap();
    initiator_socket
        .send_to(&sealed.encode().unwrap(), responder_addr)
        .await
        .unwrap();

    // Receive sealed reply
    let (len, _) = timeout(Duration::from_secs(5), initiator_socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let envelope = Envelope::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
    let plaintext = cipher.open(&envelope).unwrap();
    assert_eq!(&plaintext, b"pong");

    assert_eq!(bob_task.await.unwrap(), "responder_ok");
}

/// A longer exchange: every envelope decodes, opens, and stays in order.
#[tokio::test]
async fn test_sealed_envelope_sequence() {
    let alice = Identity::generate().unwrap();
    let bob = Identity::generate().unwrap();

    let mut initiator = Initiator::new(&alice).unwrap();
    let mut responder = Responder::new(&bob).unwrap();

    let msg1 = initiator.first_message().unwrap();
    responder.read_first(&msg1).unwrap();
    let msg2 = responder.response_message().unwrap();
    initiator.read_response(&msg2).unwrap();
    let msg3 = initiator.final_message().unwrap();
    responder.read_final(&msg3).unwrap();

    let (alice_keys, _) = initiator.into_session_keys().unwrap();
    let (bob_keys, _) = responder.into_session_keys().unwrap();
    let mut alice_cipher = SessionCipher::new(&alice_keys);
    let mut bob_cipher = SessionCipher::new(&bob_keys);

    for i in 0..10u64 {
        let msg = format!("message {}", i);
        let sealed = alice_cipher.seal(EnvelopeKind::Data, msg.as_bytes()).unwrap();
        assert_eq!(sealed.sequence, i);

        // Through the wire codec and back
        let wire = sealed.encode().unwrap();
        let decoded = Envelope::decode(wire).unwrap();

        let plaintext = bob_cipher.open(&decoded).unwrap();
        assert_eq!(plaintext, msg.as_bytes());
    }

    for i in 0..10u64 {
        let msg = format!("response {}", i);
        let sealed = bob_cipher.seal(EnvelopeKind::Data, msg.as_bytes()).unwrap();
        assert_eq!(sealed.sequence, i);
        let plaintext = alice_cipher.open(&sealed).unwrap();
        assert_eq!(plaintext, msg.as_bytes());
    }
}
