// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End-to-end scenarios driving the full five-task runtime over an in-memory
//! transport (`tokio::io::duplex`), with a hand-fed fake broker standing in
//! for the other end of the wire.

use std::time::Duration;

use client::{AsyncClient, ConnectOptions, Event, PublishMessage, PublishOutcome};
use codec::v5::{
    ConnectAckPacket, DisconnectPacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, ReasonCode, SubscribeAckPacket,
};
use codec::{ControlPacket, DecodeOutcome, EncodePacket, PacketId, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The broker side of an in-memory connection: reads/writes raw bytes and
/// decodes/encodes packets directly, standing in for an actual MQTT broker.
struct FakeBroker {
    stream: DuplexStream,
    buf: Vec<u8>,
}

impl FakeBroker {
    async fn recv(&mut self) -> ControlPacket {
        loop {
            match codec::decode(&self.buf) {
                DecodeOutcome::Packet(packet, consumed) => {
                    self.buf.drain(..consumed);
                    return packet;
                }
                DecodeOutcome::Partial => {
                    let mut chunk = [0_u8; 1024];
                    let n = self
                        .stream
                        .read(&mut chunk)
                        .await
                        .expect("broker read failed");
                    assert!(n > 0, "client closed the transport unexpectedly");
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                DecodeOutcome::Malformed(err) => panic!("broker decoded a malformed packet: {err:?}"),
            }
        }
    }

    async fn send(&mut self, packet: &impl EncodePacket) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).expect("broker failed to encode packet");
        self.stream.write_all(&buf).await.expect("broker write failed");
    }
}

fn new_pair() -> (client::transport::Transport, FakeBroker) {
    let (client_side, broker_side) = tokio::io::duplex(8192);
    (
        client::transport::Transport::Duplex(client_side),
        FakeBroker {
            stream: broker_side,
            buf: Vec::new(),
        },
    )
}

/// Drives the CONNECT/CONNACK handshake against `broker`, replying with
/// `reason_code`. Returns once the CONNECT has been consumed and the
/// CONNACK sent.
async fn handshake(broker: &mut FakeBroker, reason_code: ReasonCode) {
    match broker.recv().await {
        ControlPacket::Connect(_) => {}
        other => panic!("expected CONNECT, got {other:?}"),
    }
    let ack = ConnectAckPacket::new(false, reason_code);
    broker.send(&ack).await;
}

#[tokio::test]
async fn test_connect_success() {
    let (transport, mut broker) = new_pair();
    let options = ConnectOptions::default();

    let client_fut = AsyncClient::connect_with_transport(options, transport);
    let broker_fut = handshake(&mut broker, ReasonCode::Success);

    let (client, ()) = timeout(TEST_TIMEOUT, futures::future::join(client_fut, broker_fut))
        .await
        .expect("handshake timed out");
    let client = client.expect("connect should succeed on a Success CONNACK");
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connect_rejected_by_broker() {
    let (transport, mut broker) = new_pair();
    let options = ConnectOptions::default();

    let client_fut = AsyncClient::connect_with_transport(options, transport);
    let broker_fut = handshake(&mut broker, ReasonCode::NotAuthorized);

    let (client, ()) = timeout(TEST_TIMEOUT, futures::future::join(client_fut, broker_fut))
        .await
        .expect("handshake timed out");
    assert!(client.is_err(), "a non-Success CONNACK must fail connect()");
}

async fn connected_pair() -> (AsyncClient, FakeBroker) {
    let (transport, mut broker) = new_pair();
    let options = ConnectOptions::default();

    let client_fut = AsyncClient::connect_with_transport(options, transport);
    let broker_fut = handshake(&mut broker, ReasonCode::Success);

    let (client, ()) = timeout(TEST_TIMEOUT, futures::future::join(client_fut, broker_fut))
        .await
        .expect("handshake timed out");
    (client.expect("connect should succeed"), broker)
}

#[tokio::test]
async fn test_publish_qos0_reaches_broker_and_completes_immediately() {
    let (client, mut broker) = connected_pair().await;

    let message = PublishMessage::new("sensors/temp", QoS::AtMostOnce, b"21.5");
    let publish_fut = client.publish_and_confirm(message);
    let recv_fut = broker.recv();

    let (outcome, packet) = timeout(TEST_TIMEOUT, futures::future::join(publish_fut, recv_fut))
        .await
        .expect("publish round trip timed out");

    match packet {
        ControlPacket::Publish(publish) => {
            assert_eq!(publish.topic(), "sensors/temp");
            assert_eq!(publish.qos(), QoS::AtMostOnce);
            assert_eq!(publish.message(), b"21.5");
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }
    assert!(matches!(outcome, Ok(PublishOutcome::Written)));
}

#[tokio::test]
async fn test_publish_qos1_completes_on_puback() {
    let (client, mut broker) = connected_pair().await;

    let message = PublishMessage::new("sensors/temp", QoS::AtLeastOnce, b"21.5");
    let publish_fut = client.publish_and_confirm(message);
    let broker_fut = async {
        let packet = broker.recv().await;
        let id = match packet {
            ControlPacket::Publish(publish) => {
                assert_eq!(publish.qos(), QoS::AtLeastOnce);
                assert_ne!(publish.packet_id().value(), 0);
                publish.packet_id()
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        };
        let mut ack = PublishAckPacket::new(id);
        ack.set_reason_code(ReasonCode::Success);
        broker.send(&ack).await;
    };

    let (outcome, ()) = timeout(TEST_TIMEOUT, futures::future::join(publish_fut, broker_fut))
        .await
        .expect("publish round trip timed out");

    match outcome {
        Ok(PublishOutcome::Acknowledged(reason)) => assert_eq!(reason, ReasonCode::Success),
        other => panic!("expected Acknowledged outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscribe_delivers_suback_event() {
    let (mut client, mut broker) = connected_pair().await;

    client.subscribe("sensors/#", QoS::AtLeastOnce).expect("subscribe should enqueue");

    let broker_fut = async {
        let packet = broker.recv().await;
        let id = match packet {
            ControlPacket::Subscribe(subscribe) => subscribe.packet_id(),
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        };
        let ack = SubscribeAckPacket::new(id, ReasonCode::GrantedQoS1);
        broker.send(&ack).await;
    };
    timeout(TEST_TIMEOUT, broker_fut).await.expect("broker side timed out");

    let event = timeout(TEST_TIMEOUT, client.next_event())
        .await
        .expect("no SubscribeAck event arrived")
        .expect("event stream ended early");
    match event {
        Event::OnSubscribeAckReceived(ack) => {
            assert_eq!(ack.reasons(), &[ReasonCode::GrantedQoS1]);
        }
        other => panic!("expected OnSubscribeAckReceived, got {other:?}"),
    }
}

#[tokio::test]
async fn test_incoming_qos1_publish_is_auto_acked_then_surfaced() {
    let (mut client, mut broker) = connected_pair().await;

    let mut incoming = PublishPacket::new("alerts/fire", QoS::AtLeastOnce, b"help").unwrap();
    incoming.set_packet_id(PacketId::new(42));
    broker.send(&incoming).await;

    let ack_packet = timeout(TEST_TIMEOUT, broker.recv())
        .await
        .expect("broker never received the auto PUBACK");
    match ack_packet {
        ControlPacket::PublishAck(ack) => {
            assert_eq!(ack.packet_id().value(), 42);
            assert_eq!(ack.reason_code(), ReasonCode::Success);
        }
        other => panic!("expected PUBACK, got {other:?}"),
    }

    let event = timeout(TEST_TIMEOUT, client.next_event())
        .await
        .expect("no OnMessageReceived event arrived")
        .expect("event stream ended early");
    match event {
        Event::OnMessageReceived(publish) => {
            assert_eq!(publish.topic(), "alerts/fire");
            assert_eq!(publish.message(), b"help");
        }
        other => panic!("expected OnMessageReceived, got {other:?}"),
    }
}

#[tokio::test]
async fn test_manual_ack_mode_surfaces_event_before_ack() {
    let (transport, mut broker) = new_pair();
    let mut options = ConnectOptions::default();
    options.set_manual_ack_enabled(true);

    let client_fut = AsyncClient::connect_with_transport(options, transport);
    let broker_fut = handshake(&mut broker, ReasonCode::Success);
    let (client, ()) = timeout(TEST_TIMEOUT, futures::future::join(client_fut, broker_fut))
        .await
        .expect("handshake timed out");
    let mut client = client.expect("connect should succeed");

    let mut incoming = PublishPacket::new("alerts/fire", QoS::AtLeastOnce, b"help").unwrap();
    incoming.set_packet_id(PacketId::new(7));
    broker.send(&incoming).await;

    let event = timeout(TEST_TIMEOUT, client.next_event())
        .await
        .expect("no OnMessageReceived event arrived")
        .expect("event stream ended early");
    let packet_id = match event {
        Event::OnMessageReceived(publish) => publish.packet_id(),
        other => panic!("expected OnMessageReceived, got {other:?}"),
    };

    client.ack(packet_id, QoS::AtLeastOnce).expect("manual ack should enqueue");
    let ack_packet = timeout(TEST_TIMEOUT, broker.recv())
        .await
        .expect("broker never received the manual PUBACK");
    assert!(matches!(ack_packet, ControlPacket::PublishAck(ack) if ack.packet_id().value() == 7));
}

#[tokio::test]
async fn test_clean_disconnect_sends_disconnect_packet() {
    let (client, mut broker) = connected_pair().await;

    let disconnect_fut = client.disconnect();
    let broker_fut = broker.recv();
    let ((), packet) = timeout(TEST_TIMEOUT, futures::future::join(disconnect_fut, broker_fut))
        .await
        .expect("disconnect sequence timed out");

    match packet {
        ControlPacket::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code(), ReasonCode::Success);
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_broker_initiated_disconnect_tears_down_client() {
    let (client, mut broker) = connected_pair().await;

    let mut packet = DisconnectPacket::new();
    packet.set_reason_code(ReasonCode::ServerBusy);
    broker.send(&packet).await;

    // Give the reader/handler tasks a chance to observe the DISCONNECT and
    // run the teardown sequence.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_publish_qos2_completes_through_full_handshake() {
    let (client, mut broker) = connected_pair().await;

    let message = PublishMessage::new("sensors/pressure", QoS::ExactOnce, b"99.9");
    let publish_fut = client.publish_and_confirm(message);
    let broker_fut = async {
        let id = match broker.recv().await {
            ControlPacket::Publish(publish) => {
                assert_eq!(publish.qos(), QoS::ExactOnce);
                publish.packet_id()
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        };

        let mut received = PublishReceivedPacket::new(id);
        received.set_reason_code(ReasonCode::Success);
        broker.send(&received).await;

        match broker.recv().await {
            ControlPacket::PublishRelease(release) => assert_eq!(release.packet_id().value(), id.value()),
            other => panic!("expected PUBREL, got {other:?}"),
        }

        let mut complete = PublishCompletePacket::new(id);
        complete.set_reason_code(ReasonCode::Success);
        broker.send(&complete).await;
    };

    let (outcome, ()) = timeout(TEST_TIMEOUT, futures::future::join(publish_fut, broker_fut))
        .await
        .expect("QoS2 round trip timed out");

    match outcome {
        Ok(PublishOutcome::Acknowledged(reason)) => assert_eq!(reason, ReasonCode::Success),
        other => panic!("expected Acknowledged outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_publish_is_deduped_to_one_event() {
    let (mut client, mut broker) = connected_pair().await;

    let mut first = PublishPacket::new("alerts/fire", QoS::AtLeastOnce, b"help").unwrap();
    first.set_packet_id(PacketId::new(9));
    broker.send(&first).await;

    let mut dup = first.clone();
    dup.set_dup(true).expect("QoS 1 allows the DUP flag");
    broker.send(&dup).await;

    for _ in 0..2 {
        let ack_packet = timeout(TEST_TIMEOUT, broker.recv())
            .await
            .expect("broker never received a PUBACK");
        assert!(matches!(ack_packet, ControlPacket::PublishAck(ack) if ack.packet_id().value() == 9));
    }

    let event = timeout(TEST_TIMEOUT, client.next_event())
        .await
        .expect("no OnMessageReceived event arrived")
        .expect("event stream ended early");
    assert!(matches!(event, Event::OnMessageReceived(publish) if publish.packet_id().value() == 9));

    let second = timeout(Duration::from_millis(300), client.next_event()).await;
    assert!(
        second.is_err(),
        "the duplicate PUBLISH must not surface a second OnMessageReceived"
    );
}

#[tokio::test]
async fn test_oversize_incoming_packet_triggers_packet_too_large_disconnect() {
    let (transport, mut broker) = new_pair();
    let mut options = ConnectOptions::default();
    options.set_maximum_packet_size(Some(64));

    let client_fut = AsyncClient::connect_with_transport(options, transport);
    let broker_fut = handshake(&mut broker, ReasonCode::Success);
    let (client, ()) = timeout(TEST_TIMEOUT, futures::future::join(client_fut, broker_fut))
        .await
        .expect("handshake timed out");
    let client = client.expect("connect should succeed");

    let oversized = PublishPacket::new("alerts/fire", QoS::AtMostOnce, &[0_u8; 256]).unwrap();
    broker.send(&oversized).await;

    let disconnect_packet = timeout(TEST_TIMEOUT, broker.recv())
        .await
        .expect("broker never received the DISCONNECT");
    match disconnect_packet {
        ControlPacket::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code(), ReasonCode::PacketTooLarge);
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_keep_alive_idle_triggers_ping_request() {
    let (transport, mut broker) = new_pair();
    let mut options = ConnectOptions::default();
    options.set_keep_alive(Duration::from_millis(500));

    let client_fut = AsyncClient::connect_with_transport(options, transport);
    let broker_fut = handshake(&mut broker, ReasonCode::Success);
    let (client, ()) = timeout(TEST_TIMEOUT, futures::future::join(client_fut, broker_fut))
        .await
        .expect("handshake timed out");
    let _client = client.expect("connect should succeed");

    let packet = timeout(Duration::from_secs(4), broker.recv())
        .await
        .expect("broker never received a PINGREQ after the idle window");
    assert!(matches!(packet, ControlPacket::PingRequest(_)));
}
