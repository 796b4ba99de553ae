// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::time::Duration;

use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::{PublishPacket, PubrelPacket, VariablePacket};
use mqtt::{QualityOfService, TopicName};
use tokio::time::timeout;

use minato::client::{AsyncClient, ConnectOptions};

mod common;
use common::{connect_packet, raw_connect, recv_packet, start_server};

const CONFIG: &str = r#"
[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:0"
"#;

async fn client(addr: std::net::SocketAddr, client_id: &str) -> AsyncClient {
    let mut options = ConnectOptions::new(&addr.to_string());
    options.set_client_id(client_id);
    AsyncClient::connect(options).await.expect("client connect")
}

#[tokio::test]
async fn test_qos1_publish_acknowledged() {
    let (addrs, _broker) = start_server(CONFIG).await;

    let subscriber = client(addrs[0], "q1-sub").await;
    subscriber
        .subscribe(&[("q1/t", QualityOfService::Level1)])
        .await
        .unwrap();
    let mut messages = subscriber.messages();

    let publisher = client(addrs[0], "q1-pub").await;
    // Resolves only once the broker sent PUBACK.
    publisher
        .publish("q1/t", QualityOfService::Level1, false, b"ack-me".to_vec())
        .await
        .unwrap();

    let message = timeout(common::RECV_TIMEOUT, messages.next())
        .await
        .expect("subscriber got nothing")
        .unwrap();
    assert_eq!(message.payload(), b"ack-me");
    assert_eq!(message.qos(), QualityOfService::Level1);
}

#[tokio::test]
async fn test_qos2_exact_handshake() {
    let (addrs, _broker) = start_server(CONFIG).await;
    let (mut codec, connack) = raw_connect(addrs[0], connect_packet("q2-raw", true, 0)).await;
    assert!(!connack.connack_flags().session_present);

    let publish = PublishPacket::new(
        TopicName::new("x").unwrap(),
        QoSWithPacketIdentifier::Level2(7),
        b"P".to_vec(),
    );
    codec
        .send(&VariablePacket::PublishPacket(publish))
        .await
        .unwrap();

    match recv_packet(&mut codec).await {
        VariablePacket::PubrecPacket(pubrec) => assert_eq!(pubrec.packet_identifier(), 7),
        other => panic!("expected PUBREC, got {other:?}"),
    }

    codec
        .send(&VariablePacket::PubrelPacket(PubrelPacket::new(7)))
        .await
        .unwrap();
    match recv_packet(&mut codec).await {
        VariablePacket::PubcompPacket(pubcomp) => assert_eq!(pubcomp.packet_identifier(), 7),
        other => panic!("expected PUBCOMP, got {other:?}"),
    }

    // Identifier 7 is free again for the next exchange.
    let publish = PublishPacket::new(
        TopicName::new("x").unwrap(),
        QoSWithPacketIdentifier::Level2(7),
        b"P2".to_vec(),
    );
    codec
        .send(&VariablePacket::PublishPacket(publish))
        .await
        .unwrap();
    match recv_packet(&mut codec).await {
        VariablePacket::PubrecPacket(pubrec) => assert_eq!(pubrec.packet_identifier(), 7),
        other => panic!("expected PUBREC, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_pubrel_tolerated() {
    let (addrs, _broker) = start_server(CONFIG).await;
    let (mut codec, _connack) = raw_connect(addrs[0], connect_packet("dup-rel", true, 0)).await;

    // A PUBREL for an id that was never seen still gets its PUBCOMP.
    codec
        .send(&VariablePacket::PubrelPacket(PubrelPacket::new(11)))
        .await
        .unwrap();
    match recv_packet(&mut codec).await {
        VariablePacket::PubcompPacket(pubcomp) => assert_eq!(pubcomp.packet_identifier(), 11),
        other => panic!("expected PUBCOMP, got {other:?}"),
    }
}

#[tokio::test]
async fn test_qos2_duplicate_publish_delivered_once() {
    let (addrs, _broker) = start_server(CONFIG).await;

    let subscriber = client(addrs[0], "q2-dup-sub").await;
    subscriber
        .subscribe(&[("q2/dup", QualityOfService::Level0)])
        .await
        .unwrap();
    let mut messages = subscriber.messages();

    let (mut codec, _connack) = raw_connect(addrs[0], connect_packet("q2-dup-pub", true, 0)).await;
    let publish = PublishPacket::new(
        TopicName::new("q2/dup").unwrap(),
        QoSWithPacketIdentifier::Level2(9),
        b"once".to_vec(),
    );
    codec
        .send(&VariablePacket::PublishPacket(publish.clone()))
        .await
        .unwrap();
    match recv_packet(&mut codec).await {
        VariablePacket::PubrecPacket(_pubrec) => {}
        other => panic!("expected PUBREC, got {other:?}"),
    }

    // Retransmission before PUBREL: acknowledged again, fanned out once.
    let mut dup = publish;
    dup.set_dup(true);
    codec
        .send(&VariablePacket::PublishPacket(dup))
        .await
        .unwrap();
    match recv_packet(&mut codec).await {
        VariablePacket::PubrecPacket(_pubrec) => {}
        other => panic!("expected PUBREC, got {other:?}"),
    }

    codec
        .send(&VariablePacket::PubrelPacket(PubrelPacket::new(9)))
        .await
        .unwrap();
    match recv_packet(&mut codec).await {
        VariablePacket::PubcompPacket(_pubcomp) => {}
        other => panic!("expected PUBCOMP, got {other:?}"),
    }

    let message = timeout(common::RECV_TIMEOUT, messages.next())
        .await
        .expect("no delivery")
        .unwrap();
    assert_eq!(message.payload(), b"once");
    assert!(
        timeout(Duration::from_millis(300), messages.next())
            .await
            .is_err(),
        "duplicate QoS-2 publish was fanned out twice"
    );
}

#[tokio::test]
async fn test_qos2_end_to_end() {
    let (addrs, _broker) = start_server(CONFIG).await;

    let subscriber = client(addrs[0], "q2-e2e-sub").await;
    subscriber
        .subscribe(&[("q2/e2e", QualityOfService::Level2)])
        .await
        .unwrap();
    let mut messages = subscriber.messages();

    let publisher = client(addrs[0], "q2-e2e-pub").await;
    // Resolves only once the broker sent PUBCOMP.
    publisher
        .publish("q2/e2e", QualityOfService::Level2, false, b"exact".to_vec())
        .await
        .unwrap();

    let message = timeout(common::RECV_TIMEOUT, messages.next())
        .await
        .expect("subscriber got nothing")
        .unwrap();
    assert_eq!(message.payload(), b"exact");
    assert_eq!(message.qos(), QualityOfService::Level2);
    assert!(
        timeout(Duration::from_millis(300), messages.next())
            .await
            .is_err(),
        "exactly-once delivery happened twice"
    );
}
