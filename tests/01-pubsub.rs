// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::time::Duration;

use mqtt::QualityOfService;
use tokio::time::timeout;

use minato::client::{AsyncClient, ConnectOptions, ConnectType, WsConnect};
use minato::message::Message;

mod common;
use common::start_server;

const CONFIG: &str = r#"
[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:0"
"#;

const WS_CONFIG: &str = r#"
[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:0"

[[listeners]]
protocol = "ws"
address = "127.0.0.1:0"
path = "/mqtt"
"#;

async fn client(addr: std::net::SocketAddr, client_id: &str) -> AsyncClient {
    let mut options = ConnectOptions::new(&addr.to_string());
    options.set_client_id(client_id);
    AsyncClient::connect(options).await.expect("client connect")
}

#[tokio::test]
async fn test_qos0_fanout() {
    let (addrs, _broker) = start_server(CONFIG).await;

    let s1 = client(addrs[0], "fanout-s1").await;
    let s2 = client(addrs[0], "fanout-s2").await;
    s1.subscribe(&[("a/+", QualityOfService::Level0)])
        .await
        .unwrap();
    s2.subscribe(&[("#", QualityOfService::Level0)]).await.unwrap();
    let mut m1 = s1.messages();
    let mut m2 = s2.messages();

    let publisher = client(addrs[0], "fanout-pub").await;
    publisher
        .publish("a/b", QualityOfService::Level0, false, b"hi".to_vec())
        .await
        .unwrap();

    for stream in [&mut m1, &mut m2] {
        let message = timeout(common::RECV_TIMEOUT, stream.next())
            .await
            .expect("no publish arrived")
            .unwrap();
        assert_eq!(message.topic(), "a/b");
        assert_eq!(message.payload(), b"hi");
        assert_eq!(message.qos(), QualityOfService::Level0);
    }

    // Exactly one delivery per subscriber.
    assert!(timeout(Duration::from_millis(300), m1.next()).await.is_err());
    assert!(timeout(Duration::from_millis(300), m2.next()).await.is_err());
}

#[tokio::test]
async fn test_internal_topics_skip_root_wildcards() {
    let (addrs, broker) = start_server(CONFIG).await;

    let plain = client(addrs[0], "sys-plain").await;
    let system = client(addrs[0], "sys-system").await;
    plain
        .subscribe(&[("#", QualityOfService::Level0)])
        .await
        .unwrap();
    system
        .subscribe(&[("$SYS/#", QualityOfService::Level0)])
        .await
        .unwrap();
    let mut plain_messages = plain.messages();
    let mut system_messages = system.messages();

    broker
        .publish(Message::new("$SYS/info", QualityOfService::Level0, b"sys".to_vec()).unwrap())
        .await;
    // A follow-up on a normal topic doubles as a flush marker for the
    // `#` subscriber.
    broker
        .publish(Message::new("info", QualityOfService::Level0, b"plain".to_vec()).unwrap())
        .await;

    let message = timeout(common::RECV_TIMEOUT, system_messages.next())
        .await
        .expect("$SYS subscriber got nothing")
        .unwrap();
    assert_eq!(message.topic(), "$SYS/info");

    let message = timeout(common::RECV_TIMEOUT, plain_messages.next())
        .await
        .expect("# subscriber got nothing")
        .unwrap();
    assert_eq!(message.topic(), "info", "# must not match $SYS topics");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (addrs, _broker) = start_server(CONFIG).await;

    let subscriber = client(addrs[0], "unsub-s").await;
    subscriber
        .subscribe(&[("u/t", QualityOfService::Level0)])
        .await
        .unwrap();
    let mut messages = subscriber.messages();

    let publisher = client(addrs[0], "unsub-p").await;
    publisher
        .publish("u/t", QualityOfService::Level0, false, b"one".to_vec())
        .await
        .unwrap();
    let message = timeout(common::RECV_TIMEOUT, messages.next())
        .await
        .expect("first publish missing")
        .unwrap();
    assert_eq!(message.payload(), b"one");

    subscriber.unsubscribe(&["u/t"]).await.unwrap();
    publisher
        .publish("u/t", QualityOfService::Level0, false, b"two".to_vec())
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(300), messages.next())
            .await
            .is_err(),
        "message delivered after unsubscribe"
    );
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let (addrs, _broker) = start_server(WS_CONFIG).await;

    let mut options = ConnectOptions::new(&addrs[1].to_string());
    options
        .set_client_id("ws-client")
        .set_connect_type(ConnectType::Ws(WsConnect {
            path: "/mqtt".to_owned(),
        }));
    let ws_client = AsyncClient::connect(options).await.expect("ws connect");

    ws_client
        .subscribe(&[("ws/t", QualityOfService::Level1)])
        .await
        .unwrap();
    let mut messages = ws_client.messages();

    let tcp_client = client(addrs[0], "ws-peer").await;
    tcp_client
        .publish("ws/t", QualityOfService::Level1, false, b"over-ws".to_vec())
        .await
        .unwrap();

    let message = timeout(common::RECV_TIMEOUT, messages.next())
        .await
        .expect("no message over websocket")
        .unwrap();
    assert_eq!(message.topic(), "ws/t");
    assert_eq!(message.payload(), b"over-ws");
}
