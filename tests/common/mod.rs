// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use mqtt::packet::{ConnackPacket, ConnectPacket, VariablePacket};
use mqtt::TopicName;
use tokio::net::TcpStream;
use tokio::time::timeout;

use minato::broker::Broker;
use minato::client::Stream;
use minato::codec::PacketCodec;
use minato::config::Config;
use minato::server::ServerContext;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_log() {
    let _ret = env_logger::builder().is_test(true).try_init();
}

/// Bind a broker from a toml snippet (use port 0 for ephemeral ports) and
/// run it in the background.
pub async fn start_server(content: &str) -> (Vec<SocketAddr>, Broker) {
    init_log();
    let config: Config = toml::from_str(content).expect("invalid test config");
    config.validate().expect("invalid test config");
    let server = ServerContext::bind(config).await.expect("failed to bind");
    let addrs = server.local_addrs().expect("no local addrs");
    let broker = server.broker();
    tokio::spawn(server.run_loop());
    (addrs, broker)
}

/// A plain TCP packet pipe, for driving the broker below the client API.
pub async fn raw_codec(addr: SocketAddr) -> PacketCodec<Stream> {
    let tcp_stream = TcpStream::connect(addr).await.expect("tcp connect");
    PacketCodec::new(Stream::Mqtt(tcp_stream))
}

pub fn connect_packet(client_id: &str, clean_session: bool, keep_alive: u16) -> ConnectPacket {
    let mut packet = ConnectPacket::new(client_id);
    packet.set_clean_session(clean_session);
    packet.set_keep_alive(keep_alive);
    packet
}

pub fn with_will(mut packet: ConnectPacket, topic: &str, payload: &[u8]) -> ConnectPacket {
    packet.set_will(Some((
        TopicName::new(topic.to_owned()).expect("invalid will topic"),
        payload.to_vec(),
    )));
    packet
}

/// Send CONNECT over a raw pipe and return the CONNACK.
pub async fn raw_connect(
    addr: SocketAddr,
    packet: ConnectPacket,
) -> (PacketCodec<Stream>, ConnackPacket) {
    let mut codec = raw_codec(addr).await;
    codec
        .send(&VariablePacket::ConnectPacket(packet))
        .await
        .expect("send CONNECT");
    let reply = recv_packet(&mut codec).await;
    match reply {
        VariablePacket::ConnackPacket(connack) => (codec, connack),
        other => panic!("expected CONNACK, got {other:?}"),
    }
}

/// Receive one packet, panicking on close or timeout.
pub async fn recv_packet(codec: &mut PacketCodec<Stream>) -> VariablePacket {
    timeout(RECV_TIMEOUT, codec.recv())
        .await
        .expect("timed out waiting for a packet")
        .expect("stream error")
        .expect("stream closed")
}
