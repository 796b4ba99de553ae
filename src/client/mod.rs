// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Asynchronous MQTT client.
//!
//! The public handle talks to a background connection task over a request
//! channel. Packet identifiers are assigned inside that task, at the single
//! point where requests turn into packets, so submitters cannot race over
//! them. The task reconnects on connection loss; QoS 1/2 handshakes of a
//! non-clean session survive the reconnect and are retransmitted.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::suback::SubscribeReturnCode;
use mqtt::packet::{
    ConnectPacket, DisconnectPacket, PingreqPacket, PubackPacket, PubcompPacket, PubrecPacket,
    PubrelPacket, PublishPacket, SubscribePacket, UnsubscribePacket, VariablePacket,
};
use mqtt::{QualityOfService, TopicFilter, TopicName};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{interval, timeout};

use crate::codec::PacketCodec;
use crate::error::{Error, ErrorKind};
use crate::message::Message;
use crate::packet_id::PacketIdAllocator;
use crate::session::OutboundInFlight;
use crate::types::PacketId;

mod options;
mod stream;

pub use options::{ConnectOptions, ConnectType, MqttsConnect, TlsType, WsConnect, WssConnect};
pub use stream::Stream;

fn abandoned() -> Error {
    Error::new(
        ErrorKind::AbandonedError,
        "client: Connection ended before the operation completed",
    )
}

enum ClientRequest {
    Publish {
        message: Message,
        done: Option<oneshot::Sender<()>>,
    },
    Subscribe {
        topics: Vec<(String, QualityOfService)>,
        done: oneshot::Sender<Result<Vec<SubscribeReturnCode>, Error>>,
    },
    Unsubscribe {
        topics: Vec<String>,
        done: oneshot::Sender<Result<(), Error>>,
    },
    Disconnect,
}

/// Stream of inbound publish messages.
///
/// Every stream obtained from [`AsyncClient::messages`] observes the full
/// message flow from its creation on, with its own cursor; a slow consumer
/// only grows its own backlog.
pub struct MessageStream {
    receiver: UnboundedReceiver<Message>,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

type Observers = Arc<Mutex<Vec<UnboundedSender<Message>>>>;

/// Handle to a connected MQTT client.
///
/// Cloning is cheap; dropping the last handle sends DISCONNECT and stops
/// the background task.
#[derive(Clone)]
pub struct AsyncClient {
    requests: UnboundedSender<ClientRequest>,
    observers: Observers,
    session_present: bool,
}

impl AsyncClient {
    /// Establish the first connection and spawn the background task.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot connect or the broker refuses
    /// the CONNECT packet.
    pub async fn connect(options: ConnectOptions) -> Result<Self, Error> {
        let connection = Stream::connect(&options).await?;
        let mut codec = PacketCodec::new(connection);
        let session_present = send_connect(&mut codec, &options).await?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let observers: Observers = Arc::new(Mutex::new(Vec::new()));
        let worker = ClientWorker {
            options,
            requests: requests_rx,
            observers: Arc::clone(&observers),
            packet_ids: PacketIdAllocator::new(),
            publishes: HashMap::new(),
            subscribes: HashMap::new(),
            unsubscribes: HashMap::new(),
            inbound: HashSet::new(),
            active: false,
        };
        tokio::spawn(worker.run(codec));

        Ok(Self {
            requests: requests_tx,
            observers,
            session_present,
        })
    }

    /// Whether the broker resumed prior session state on connect.
    #[must_use]
    pub const fn session_present(&self) -> bool {
        self.session_present
    }

    /// Publish a message.
    ///
    /// QoS 0 returns once the request is handed to the connection task;
    /// QoS 1 and 2 wait for the PUBACK or PUBCOMP of the broker.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is invalid or the connection ended before
    /// the acknowledgement arrived.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        let mut message = Message::new(topic, qos, payload)?;
        message.set_retain(retain);

        if qos == QualityOfService::Level0 {
            return self.request(ClientRequest::Publish {
                message,
                done: None,
            });
        }
        let (done, ack) = oneshot::channel();
        self.request(ClientRequest::Publish {
            message,
            done: Some(done),
        })?;
        ack.await.map_err(|_closed| abandoned())
    }

    /// Subscribe to topic filters; resolves with the per-filter grants from
    /// the SUBACK.
    ///
    /// # Errors
    ///
    /// Returns error if a filter is invalid or the connection ended first.
    pub async fn subscribe(
        &self,
        topics: &[(&str, QualityOfService)],
    ) -> Result<Vec<SubscribeReturnCode>, Error> {
        let topics = topics
            .iter()
            .map(|(filter, qos)| ((*filter).to_owned(), *qos))
            .collect();
        let (done, ack) = oneshot::channel();
        self.request(ClientRequest::Subscribe { topics, done })?;
        ack.await.map_err(|_closed| abandoned())?
    }

    /// Unsubscribe from topic filters; resolves on UNSUBACK.
    ///
    /// # Errors
    ///
    /// Returns error if the connection ended first.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<(), Error> {
        let topics = topics.iter().map(|filter| (*filter).to_owned()).collect();
        let (done, ack) = oneshot::channel();
        self.request(ClientRequest::Unsubscribe { topics, done })?;
        ack.await.map_err(|_closed| abandoned())?
    }

    /// A new independent observer of inbound publish messages.
    #[must_use]
    pub fn messages(&self) -> MessageStream {
        let (observer_tx, receiver) = mpsc::unbounded_channel();
        self.observers.lock().unwrap().push(observer_tx);
        MessageStream { receiver }
    }

    /// Send DISCONNECT and stop the background task.
    ///
    /// # Errors
    ///
    /// Returns error if the task is already gone.
    pub fn disconnect(&self) -> Result<(), Error> {
        self.request(ClientRequest::Disconnect)
    }

    fn request(&self, request: ClientRequest) -> Result<(), Error> {
        self.requests
            .send(request)
            .map_err(|_closed| abandoned())
    }
}

/// Send CONNECT and wait for CONNACK, returning the session present flag.
async fn send_connect(
    codec: &mut PacketCodec<Stream>,
    options: &ConnectOptions,
) -> Result<bool, Error> {
    let mut connect = ConnectPacket::new(options.client_id());
    connect.set_clean_session(options.clean_session());
    connect.set_keep_alive(options.keep_alive());
    if let Some(username) = options.username() {
        connect.set_user_name(Some(username.to_owned()));
    }
    if let Some(password) = options.password() {
        connect.set_password(Some(password.to_owned()));
    }
    if let Some(will) = options.will() {
        let topic = TopicName::new(will.topic().to_owned()).map_err(|err| {
            Error::from_string(
                ErrorKind::EncodeError,
                format!("client: Invalid will topic: {err:?}"),
            )
        })?;
        connect.set_will(Some((topic, will.payload().to_vec())));
        connect.set_will_qos(will.qos() as u8);
        connect.set_will_retain(will.retain());
    }
    codec
        .send(&VariablePacket::ConnectPacket(connect))
        .await?;

    let reply = timeout(options.connect_timeout(), codec.recv()).await??;
    match reply {
        Some(VariablePacket::ConnackPacket(connack)) => {
            match connack.connect_return_code() {
                ConnectReturnCode::ConnectionAccepted => {
                    Ok(connack.connack_flags().session_present)
                }
                code => Err(Error::from_string(
                    ErrorKind::AuthError,
                    format!("client: Connection refused: {code:?}"),
                )),
            }
        }
        Some(other) => Err(Error::from_string(
            ErrorKind::ProtocolError,
            format!("client: Expected CONNACK, got: {other:?}"),
        )),
        None => Err(Error::new(
            ErrorKind::SocketError,
            "client: Connection closed before CONNACK",
        )),
    }
}

enum ServeExit {
    /// DISCONNECT was requested or every handle was dropped.
    Finished,

    /// The transport failed or the broker went away.
    ConnectionLost,
}

struct ClientWorker {
    options: ConnectOptions,
    requests: UnboundedReceiver<ClientRequest>,
    observers: Observers,
    packet_ids: PacketIdAllocator,
    publishes: HashMap<PacketId, OutboundInFlight>,
    subscribes: HashMap<PacketId, oneshot::Sender<Result<Vec<SubscribeReturnCode>, Error>>>,
    unsubscribes: HashMap<PacketId, oneshot::Sender<Result<(), Error>>>,
    inbound: HashSet<PacketId>,
    active: bool,
}

impl ClientWorker {
    async fn run(mut self, codec: PacketCodec<Stream>) {
        let mut live_codec = Some(codec);
        loop {
            let codec = match live_codec.take() {
                Some(codec) => codec,
                None => {
                    tokio::time::sleep(self.options.reconnect_delay()).await;
                    match self.reconnect().await {
                        Ok(codec) => codec,
                        Err(err) => {
                            log::warn!("client: Reconnect failed: {err}");
                            continue;
                        }
                    }
                }
            };

            match self.serve(codec).await {
                ServeExit::Finished => break,
                ServeExit::ConnectionLost => {
                    if self.options.clean_session() {
                        self.abandon_pending();
                    } else {
                        self.abandon_control();
                    }
                    if !self.options.reconnect() {
                        self.abandon_pending();
                        break;
                    }
                    log::warn!(
                        "client: Connection lost, reconnecting {}",
                        self.options.client_id()
                    );
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<PacketCodec<Stream>, Error> {
        let connection = Stream::connect(&self.options).await?;
        let mut codec = PacketCodec::new(connection);
        let _session_present = send_connect(&mut codec, &self.options).await?;
        if !self.options.clean_session() {
            self.resend_in_flight(&mut codec).await?;
        }
        Ok(codec)
    }

    /// Retransmit the surviving half of every open QoS handshake, in packet
    /// id order, before new requests are serviced.
    async fn resend_in_flight(&mut self, codec: &mut PacketCodec<Stream>) -> Result<(), Error> {
        let mut ids: Vec<PacketId> = self.publishes.keys().copied().collect();
        ids.sort_unstable();
        let mut packets = Vec::with_capacity(ids.len());
        for id in ids {
            packets.push(match &self.publishes[&id] {
                OutboundInFlight::AwaitingPuback { message, .. }
                | OutboundInFlight::AwaitingPubrec { message, .. } => {
                    let mut dup = message.clone();
                    dup.set_dup(true);
                    VariablePacket::PublishPacket(dup.to_publish(Some(id))?)
                }
                OutboundInFlight::AwaitingPubcomp { .. } => {
                    VariablePacket::PubrelPacket(PubrelPacket::new(id))
                }
            });
        }
        codec.send_batch(&packets).await
    }

    /// Fail waiting SUBSCRIBE/UNSUBSCRIBE submitters; those packets are not
    /// retransmitted after a reconnect.
    fn abandon_control(&mut self) {
        // Dropping the completion senders surfaces an abandoned error on
        // every waiting submitter.
        for (id, _done) in self.subscribes.drain() {
            self.packet_ids.release(id);
        }
        for (id, _done) in self.unsubscribes.drain() {
            self.packet_ids.release(id);
        }
    }

    fn abandon_pending(&mut self) {
        for (id, _in_flight) in self.publishes.drain() {
            self.packet_ids.release(id);
        }
        self.abandon_control();
        self.inbound.clear();
    }

    async fn serve(&mut self, mut codec: PacketCodec<Stream>) -> ServeExit {
        let keep_alive = self.options.keep_alive();
        let tick_period = if keep_alive == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_millis(u64::from(keep_alive) * 500)
        };
        let mut ticker = interval(tick_period);
        // The CONNECT just sent counts as outbound activity.
        self.active = true;

        loop {
            tokio::select! {
                ret = codec.recv() => match ret {
                    Ok(Some(packet)) => {
                        if let Err(err) = self.on_packet(packet, &mut codec).await {
                            log::error!("client: {err}");
                            return ServeExit::ConnectionLost;
                        }
                    }
                    Ok(None) => return ServeExit::ConnectionLost,
                    Err(err) => {
                        log::error!("client: Receive failed: {err}");
                        return ServeExit::ConnectionLost;
                    }
                },

                request = self.requests.recv() => match request {
                    Some(ClientRequest::Disconnect) | None => {
                        let _ret = codec
                            .send(&VariablePacket::DisconnectPacket(DisconnectPacket::new()))
                            .await;
                        let _ret = codec.close().await;
                        return ServeExit::Finished;
                    }
                    Some(request) => {
                        if let Err(err) = self.on_request(request, &mut codec).await {
                            log::error!("client: Send failed: {err}");
                            return ServeExit::ConnectionLost;
                        }
                    }
                },

                // Half the keep alive period per tick: a PINGREQ goes out
                // once no packet was sent for a whole check window.
                _ = ticker.tick() => {
                    if keep_alive > 0 && !mem::replace(&mut self.active, false) {
                        if let Err(err) = codec
                            .send(&VariablePacket::PingreqPacket(PingreqPacket::new()))
                            .await
                        {
                            log::error!("client: Ping failed: {err}");
                            return ServeExit::ConnectionLost;
                        }
                    }
                }
            }
        }
    }

    async fn on_request(
        &mut self,
        request: ClientRequest,
        codec: &mut PacketCodec<Stream>,
    ) -> Result<(), Error> {
        match request {
            ClientRequest::Publish { message, done } => {
                let packet = match message.qos() {
                    QualityOfService::Level0 => {
                        let packet = message.to_publish(None)?;
                        if let Some(done) = done {
                            let _ret = done.send(());
                        }
                        packet
                    }
                    QualityOfService::Level1 => {
                        let id = self.packet_ids.allocate().await;
                        let packet = message.to_publish(Some(id))?;
                        self.publishes
                            .insert(id, OutboundInFlight::AwaitingPuback { message, done });
                        packet
                    }
                    QualityOfService::Level2 => {
                        let id = self.packet_ids.allocate().await;
                        let packet = message.to_publish(Some(id))?;
                        self.publishes
                            .insert(id, OutboundInFlight::AwaitingPubrec { message, done });
                        packet
                    }
                };
                codec.send(&VariablePacket::PublishPacket(packet)).await?;
            }
            ClientRequest::Subscribe { topics, done } => {
                let mut subscribes = Vec::with_capacity(topics.len());
                for (filter, qos) in topics {
                    match TopicFilter::new(filter.clone()) {
                        Ok(filter) => subscribes.push((filter, qos)),
                        Err(err) => {
                            let _ret = done.send(Err(Error::from_string(
                                ErrorKind::ProtocolError,
                                format!("client: Invalid topic filter {filter:?}: {err:?}"),
                            )));
                            return Ok(());
                        }
                    }
                }
                let id = self.packet_ids.allocate().await;
                self.subscribes.insert(id, done);
                codec
                    .send(&VariablePacket::SubscribePacket(SubscribePacket::new(
                        id, subscribes,
                    )))
                    .await?;
            }
            ClientRequest::Unsubscribe { topics, done } => {
                let mut filters = Vec::with_capacity(topics.len());
                for filter in topics {
                    match TopicFilter::new(filter.clone()) {
                        Ok(filter) => filters.push(filter),
                        Err(err) => {
                            let _ret = done.send(Err(Error::from_string(
                                ErrorKind::ProtocolError,
                                format!("client: Invalid topic filter {filter:?}: {err:?}"),
                            )));
                            return Ok(());
                        }
                    }
                }
                let id = self.packet_ids.allocate().await;
                self.unsubscribes.insert(id, done);
                codec
                    .send(&VariablePacket::UnsubscribePacket(UnsubscribePacket::new(
                        id, filters,
                    )))
                    .await?;
            }
            // Handled in the serve loop.
            ClientRequest::Disconnect => {}
        }
        self.active = true;
        Ok(())
    }

    async fn on_packet(
        &mut self,
        packet: VariablePacket,
        codec: &mut PacketCodec<Stream>,
    ) -> Result<(), Error> {
        match packet {
            VariablePacket::PublishPacket(publish) => {
                self.on_publish(&publish, codec).await?;
            }
            VariablePacket::PubackPacket(puback) => {
                let id = puback.packet_identifier();
                match self.publishes.remove(&id) {
                    Some(entry @ OutboundInFlight::AwaitingPuback { .. }) => {
                        entry.complete();
                        self.packet_ids.release(id);
                    }
                    _ => {
                        return Err(Error::from_string(
                            ErrorKind::ProtocolError,
                            format!("client: Unexpected PUBACK for id: {id}"),
                        ));
                    }
                }
            }
            VariablePacket::PubrecPacket(pubrec) => {
                let id = pubrec.packet_identifier();
                match self.publishes.remove(&id) {
                    Some(OutboundInFlight::AwaitingPubrec { done, .. }) => {
                        self.publishes
                            .insert(id, OutboundInFlight::AwaitingPubcomp { done });
                        codec
                            .send(&VariablePacket::PubrelPacket(PubrelPacket::new(id)))
                            .await?;
                        self.active = true;
                    }
                    _ => {
                        return Err(Error::from_string(
                            ErrorKind::ProtocolError,
                            format!("client: Unexpected PUBREC for id: {id}"),
                        ));
                    }
                }
            }
            VariablePacket::PubcompPacket(pubcomp) => {
                let id = pubcomp.packet_identifier();
                match self.publishes.remove(&id) {
                    Some(entry @ OutboundInFlight::AwaitingPubcomp { .. }) => {
                        entry.complete();
                        self.packet_ids.release(id);
                    }
                    // Duplicate after the id was already released.
                    None => {}
                    Some(_) => {
                        return Err(Error::from_string(
                            ErrorKind::ProtocolError,
                            format!("client: Unexpected PUBCOMP for id: {id}"),
                        ));
                    }
                }
            }
            VariablePacket::PubrelPacket(pubrel) => {
                let id = pubrel.packet_identifier();
                self.inbound.remove(&id);
                codec
                    .send(&VariablePacket::PubcompPacket(PubcompPacket::new(id)))
                    .await?;
                self.active = true;
            }
            VariablePacket::SubackPacket(suback) => {
                let id = suback.packet_identifier();
                if let Some(done) = self.subscribes.remove(&id) {
                    let _ret = done.send(Ok(suback.subscribes().to_vec()));
                    self.packet_ids.release(id);
                } else {
                    log::warn!("client: SUBACK for unknown id: {id}");
                }
            }
            VariablePacket::UnsubackPacket(unsuback) => {
                let id = unsuback.packet_identifier();
                if let Some(done) = self.unsubscribes.remove(&id) {
                    let _ret = done.send(Ok(()));
                    self.packet_ids.release(id);
                } else {
                    log::warn!("client: UNSUBACK for unknown id: {id}");
                }
            }
            VariablePacket::PingrespPacket(_pingresp) => {}
            other => {
                return Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!("client: Unexpected packet: {other:?}"),
                ));
            }
        }
        Ok(())
    }

    async fn on_publish(
        &mut self,
        publish: &PublishPacket,
        codec: &mut PacketCodec<Stream>,
    ) -> Result<(), Error> {
        let message = Message::from_publish(publish);
        match publish.qos() {
            QoSWithPacketIdentifier::Level0 => self.deliver(message),
            QoSWithPacketIdentifier::Level1(id) => {
                self.deliver(message);
                codec
                    .send(&VariablePacket::PubackPacket(PubackPacket::new(id)))
                    .await?;
                self.active = true;
            }
            QoSWithPacketIdentifier::Level2(id) => {
                if self.inbound.insert(id) {
                    self.deliver(message);
                }
                codec
                    .send(&VariablePacket::PubrecPacket(PubrecPacket::new(id)))
                    .await?;
                self.active = true;
            }
        }
        Ok(())
    }

    fn deliver(&self, message: Message) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|observer| observer.send(message.clone()).is_ok());
    }
}
