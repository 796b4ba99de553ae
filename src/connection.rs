// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-connection task group on the broker side.
//!
//! One task runs the input, output and keep-alive arms as a `select!` race;
//! the two queue drains are spawned as sibling tasks so that a stalled
//! output path exerts backpressure on the guaranteed queue instead of
//! deadlocking the packet loop. The first arm to fail cancels the rest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mqtt::control::variable_header::{ConnectReturnCode, ProtocolLevel};
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::{
    ConnackPacket, PingrespPacket, PubackPacket, PubcompPacket, PubrecPacket, PubrelPacket,
    PublishPacket, SubackPacket, UnsubackPacket, VariablePacket,
};
use mqtt::QualityOfService;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{watch, Notify};
use tokio::time::{interval, timeout};

use crate::auth::{AuthRequest, Authenticator};
use crate::broker::Broker;
use crate::codec::PacketCodec;
use crate::error::{Error, ErrorKind};
use crate::message::Message;
use crate::session::{ConnectionHandle, OutboundInFlight, Session};
use crate::stream::{ConnectInfo, Stream};
use crate::types::{qos_from_u8, random_client_id, ConnectionId};

/// Outbound mailbox depth; the wire sees packets strictly in mailbox order.
const MAILBOX_CAPACITY: usize = 64;

/// Settings a listener hands to each of its connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub keep_alive: u16,
    pub connect_timeout: u16,
    pub allow_empty_client_id: bool,
}

#[derive(Debug)]
enum Exit {
    /// The client sent DISCONNECT; the will is dropped.
    Disconnect,

    /// Another connection bound the session; registry already updated.
    Takeover,

    /// The transport closed without DISCONNECT; the will fires.
    Dropped,

    /// Protocol violation, transport error or keep-alive timeout; the will
    /// fires.
    Failed(Error),
}

pub struct Connection {
    id: ConnectionId,
    codec: PacketCodec<Stream>,
    info: ConnectInfo,
    config: ConnectionConfig,
    broker: Broker,
    auth: Arc<dyn Authenticator>,
}

/// Everything the packet loop needs once a session is bound.
struct Attached {
    session: Arc<Session>,
    broker: Broker,
    mailbox: Sender<VariablePacket>,
}

enum Flow {
    Continue,
    Disconnect,
}

impl Connection {
    #[must_use]
    pub fn new(
        id: ConnectionId,
        codec: PacketCodec<Stream>,
        info: ConnectInfo,
        config: ConnectionConfig,
        broker: Broker,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            id,
            codec,
            info,
            config,
            broker,
            auth,
        }
    }

    pub async fn run(mut self) {
        match self.handshake().await {
            Ok(Some(bound)) => bound.serve(self.codec).await,
            Ok(None) => {
                let _ret = self.codec.close().await;
            }
            Err(err) => {
                log::error!("connection: Handshake failed for {:?}: {err}", self.id);
                let _ret = self.codec.close().await;
            }
        }
    }

    /// Drive the connection up to a bound session: first packet must be
    /// CONNECT [MQTT-3.1.0-1], then authentication, session binding and
    /// CONNACK.
    ///
    /// `Ok(None)` means the connect was refused and a CONNACK with the
    /// refusal code was already sent; an error closes the stream without
    /// any response [MQTT-3.1.4-1].
    async fn handshake(&mut self) -> Result<Option<Bound>, Error> {
        let connect_timeout = Duration::from_secs(u64::from(self.config.connect_timeout.max(1)));
        let first = timeout(connect_timeout, self.codec.recv()).await??;
        let packet = match first {
            None => return Ok(None),
            Some(VariablePacket::ConnectPacket(packet)) => packet,
            Some(other) => {
                return Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!("connection: Expected CONNECT, got: {other:?}"),
                ));
            }
        };

        // The Server MUST respond with CONNACK return code 0x01 and then
        // disconnect if the protocol level is not supported [MQTT-3.1.2-2].
        if packet.protocol_level() != ProtocolLevel::Version311 {
            self.reject(ConnectReturnCode::UnacceptableProtocolVersion)
                .await?;
            return Ok(None);
        }

        let clean_session = packet.clean_session();
        let mut client_id = packet.client_identifier().to_owned();
        if client_id.is_empty() {
            // A zero-byte client id with CleanSession 0 gets return code
            // 0x02 [MQTT-3.1.3-8]; with CleanSession 1 the server may assign
            // a unique id instead [MQTT-3.1.3-6].
            if self.config.allow_empty_client_id && clean_session {
                client_id = random_client_id();
            } else {
                self.reject(ConnectReturnCode::IdentifierRejected).await?;
                return Ok(None);
            }
        }

        let request = AuthRequest {
            client_id: &client_id,
            clean_session,
            username: packet.user_name(),
            password: packet.password(),
            http_request: self.info.http_request(),
            tls: self.info.tls(),
            peer_certs: self.info.peer_certs(),
        };
        match self.auth.authenticate(&request).await {
            Ok(Some(principal)) => {
                log::info!("connection: {client_id} authenticated as {principal}");
            }
            Ok(None) => {
                self.reject(ConnectReturnCode::NotAuthorized).await?;
                return Ok(None);
            }
            Err(err) => {
                // Internal failure; never leaks to the peer as a CONNACK.
                return Err(Error::from_string(
                    ErrorKind::AuthError,
                    format!("connection: Authenticator failed: {err}"),
                ));
            }
        }

        let will = match packet.will() {
            Some((topic, payload)) => {
                let mut message =
                    Message::new(&topic[..], qos_from_u8(packet.will_qos()), payload.to_vec())?;
                message.set_retain(packet.will_retain());
                Some(message)
            }
            None => None,
        };

        let keep_alive = if packet.keep_alive() > 0 {
            packet.keep_alive()
        } else {
            self.config.keep_alive
        };

        let stop = Arc::new(Notify::new());
        let (done_tx, done_rx) = watch::channel(false);
        let handle = ConnectionHandle::new(self.id, Arc::clone(&stop), done_rx);
        let (session, session_present) = self
            .broker
            .open_session(&client_id, clean_session, will, handle)
            .await?;

        if let Err(err) = self.finish_bind(session_present, &session).await {
            // Undo the binding so the registry does not keep a corpse.
            let mut state = session.state().await;
            if state
                .connection
                .as_ref()
                .is_some_and(|handle| handle.id() == self.id)
            {
                state.connection = None;
            }
            drop(state);
            if session.clean_session() {
                self.broker.close_session(session.key()).await;
            }
            return Err(err);
        }

        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        Ok(Some(Bound {
            conn_id: self.id,
            keep_alive,
            broker: self.broker.clone(),
            session,
            stop,
            done_tx,
            mailbox_tx,
            mailbox_rx,
        }))
    }

    /// Send CONNACK and retransmit any surviving in-flight handshakes.
    async fn finish_bind(
        &mut self,
        session_present: bool,
        session: &Arc<Session>,
    ) -> Result<(), Error> {
        // The first packet sent to the client MUST be CONNACK [MQTT-3.2.0-1].
        self.codec
            .send(&VariablePacket::ConnackPacket(ConnackPacket::new(
                session_present,
                ConnectReturnCode::ConnectionAccepted,
            )))
            .await?;

        if session_present {
            self.resend_in_flight(session).await?;
        }
        Ok(())
    }

    async fn reject(&mut self, code: ConnectReturnCode) -> Result<(), Error> {
        // A CONNACK with a non-zero return code MUST have session present
        // set to 0, and the connection is closed right after [MQTT-3.2.2-4].
        self.codec
            .send(&VariablePacket::ConnackPacket(ConnackPacket::new(
                false, code,
            )))
            .await
    }

    /// Retransmit the unacknowledged half-open QoS handshakes of a resumed
    /// session, in packet id order, before any new traffic [MQTT-4.4.0-1].
    async fn resend_in_flight(&mut self, session: &Arc<Session>) -> Result<(), Error> {
        let mut packets: Vec<(u16, VariablePacket)> = Vec::new();
        {
            let state = session.state().await;
            for (&id, in_flight) in &state.outbound {
                let packet = match in_flight {
                    OutboundInFlight::AwaitingPuback { message, .. }
                    | OutboundInFlight::AwaitingPubrec { message, .. } => {
                        let mut dup = message.clone();
                        dup.set_dup(true);
                        VariablePacket::PublishPacket(dup.to_publish(Some(id))?)
                    }
                    OutboundInFlight::AwaitingPubcomp { .. } => {
                        VariablePacket::PubrelPacket(PubrelPacket::new(id))
                    }
                };
                packets.push((id, packet));
            }
        }
        packets.sort_by_key(|(id, _packet)| *id);
        let packets: Vec<VariablePacket> =
            packets.into_iter().map(|(_id, packet)| packet).collect();
        self.codec.send_batch(&packets).await
    }
}

/// State handed from the handshake to the long-running loop.
struct Bound {
    conn_id: ConnectionId,
    keep_alive: u16,
    broker: Broker,
    session: Arc<Session>,
    stop: Arc<Notify>,
    done_tx: watch::Sender<bool>,
    mailbox_tx: Sender<VariablePacket>,
    mailbox_rx: Receiver<VariablePacket>,
}

impl Bound {
    async fn serve(self, mut codec: PacketCodec<Stream>) {
        let Self {
            conn_id,
            keep_alive,
            broker,
            session,
            stop,
            done_tx,
            mailbox_tx,
            mut mailbox_rx,
        } = self;

        let (best_effort_rx, guaranteed_rx) = {
            let mut state = session.state().await;
            (
                state.best_effort_rx.take(),
                state.guaranteed_rx.take(),
            )
        };

        let (drain_stop_tx, drain_stop_rx) = watch::channel(false);
        let best_effort_task = best_effort_rx.map(|rx| {
            tokio::spawn(best_effort_drain(
                rx,
                mailbox_tx.clone(),
                drain_stop_rx.clone(),
            ))
        });
        let guaranteed_task = guaranteed_rx.map(|rx| {
            tokio::spawn(guaranteed_drain(
                rx,
                Arc::clone(&session),
                mailbox_tx.clone(),
                drain_stop_rx,
            ))
        });

        let attached = Attached {
            session: Arc::clone(&session),
            broker: broker.clone(),
            mailbox: mailbox_tx,
        };

        let tick_period = if keep_alive == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_millis(u64::from(keep_alive) * 500)
        };
        let mut ticker = interval(tick_period);
        let mut last_inbound = Instant::now();

        let exit = loop {
            tokio::select! {
                _ = stop.notified() => break Exit::Takeover,

                ret = codec.recv() => match ret {
                    Ok(Some(packet)) => {
                        last_inbound = Instant::now();
                        match attached.dispatch(packet).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Disconnect) => break Exit::Disconnect,
                            Err(err) => break Exit::Failed(err),
                        }
                    }
                    Ok(None) => break Exit::Dropped,
                    Err(err) => break Exit::Failed(err),
                },

                packet = mailbox_rx.recv() => match packet {
                    Some(packet) => {
                        if let Err(err) = codec.send(&packet).await {
                            break Exit::Failed(err);
                        }
                    }
                    None => break Exit::Failed(Error::new(
                        ErrorKind::ChannelError,
                        "connection: Output mailbox closed",
                    )),
                },

                // A connection with no control packet for more than the keep
                // alive period is treated as dead [MQTT-3.1.2-24]; checking
                // every half period keeps teardown within one and a half
                // keep-alive intervals.
                _ = ticker.tick() => {
                    if keep_alive > 0
                        && last_inbound.elapsed() > Duration::from_secs(u64::from(keep_alive))
                    {
                        break Exit::Failed(Error::from_string(
                            ErrorKind::TimeoutError,
                            format!("connection: Keep alive expired for {conn_id:?}"),
                        ));
                    }
                }
            }
        };

        match &exit {
            Exit::Failed(err) => {
                log::warn!("connection: {conn_id:?} failed: {err}");
            }
            _ => log::info!("connection: {conn_id:?} closed: {exit:?}"),
        }

        // Wind-down: stop the drains and park the queue ends back into the
        // session so a later binding can pick them up. Dropping the mailbox
        // receiver first unblocks a drain parked on a full mailbox; the
        // session lock is taken only after both drains joined.
        let _ret = drain_stop_tx.send(true);
        drop(mailbox_rx);
        let returned_best_effort = match best_effort_task {
            Some(task) => task.await.ok(),
            None => None,
        };
        let returned_guaranteed = match guaranteed_task {
            Some(task) => task.await.ok(),
            None => None,
        };
        let will = {
            let mut state = session.state().await;
            if let Some(rx) = returned_best_effort {
                state.best_effort_rx = Some(rx);
            }
            if let Some(rx) = returned_guaranteed {
                state.guaranteed_rx = Some(rx);
            }
            if state
                .connection
                .as_ref()
                .is_some_and(|handle| handle.id() == conn_id)
            {
                state.connection = None;
            }
            match exit {
                Exit::Disconnect => {
                    // A DISCONNECT tells the server to discard the will
                    // [MQTT-3.14.4-3].
                    state.will = None;
                    None
                }
                Exit::Takeover => None,
                Exit::Dropped | Exit::Failed(_) => state.will.clone(),
            }
        };

        let _ret = codec.close().await;

        if let Some(will) = will {
            broker.publish(will).await;
        }

        if !matches!(exit, Exit::Takeover) {
            if session.clean_session() {
                broker.close_session(session.key()).await;
            } else if !session.state().await.terminated {
                broker.save_session(&session).await;
            }
        }

        let _ret = done_tx.send(true);
    }
}

impl Attached {
    fn respond(&self, packet: VariablePacket) -> Result<(), Error> {
        match self.mailbox.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_packet)) => Err(Error::new(
                ErrorKind::QueueError,
                "connection: Output mailbox overflowed",
            )),
            Err(TrySendError::Closed(_packet)) => Err(Error::new(
                ErrorKind::ChannelError,
                "connection: Output mailbox closed",
            )),
        }
    }

    async fn dispatch(&self, packet: VariablePacket) -> Result<Flow, Error> {
        match packet {
            VariablePacket::PublishPacket(publish) => self.on_publish(publish).await,
            VariablePacket::PubrelPacket(pubrel) => {
                let id = pubrel.packet_identifier();
                // A duplicate PUBREL for an id already released is answered
                // again; the removal is idempotent.
                self.session.state().await.inbound.remove(&id);
                self.respond(VariablePacket::PubcompPacket(PubcompPacket::new(id)))?;
                Ok(Flow::Continue)
            }
            VariablePacket::PubackPacket(puback) => {
                let id = puback.packet_identifier();
                let entry = self.session.state().await.outbound.remove(&id);
                match entry {
                    Some(entry @ OutboundInFlight::AwaitingPuback { .. }) => {
                        entry.complete();
                        self.session.packet_ids().release(id);
                        Ok(Flow::Continue)
                    }
                    _ => Err(Error::from_string(
                        ErrorKind::ProtocolError,
                        format!("connection: Unexpected PUBACK for id: {id}"),
                    )),
                }
            }
            VariablePacket::PubrecPacket(pubrec) => {
                let id = pubrec.packet_identifier();
                let mut state = self.session.state().await;
                match state.outbound.remove(&id) {
                    Some(OutboundInFlight::AwaitingPubrec { done, .. }) => {
                        state
                            .outbound
                            .insert(id, OutboundInFlight::AwaitingPubcomp { done });
                        drop(state);
                        self.respond(VariablePacket::PubrelPacket(PubrelPacket::new(id)))?;
                        Ok(Flow::Continue)
                    }
                    _ => Err(Error::from_string(
                        ErrorKind::ProtocolError,
                        format!("connection: Unexpected PUBREC for id: {id}"),
                    )),
                }
            }
            VariablePacket::PubcompPacket(pubcomp) => {
                let id = pubcomp.packet_identifier();
                let entry = self.session.state().await.outbound.remove(&id);
                match entry {
                    Some(entry @ OutboundInFlight::AwaitingPubcomp { .. }) => {
                        entry.complete();
                        self.session.packet_ids().release(id);
                        Ok(Flow::Continue)
                    }
                    // A duplicate PUBCOMP after the id was released.
                    None => Ok(Flow::Continue),
                    Some(_) => Err(Error::from_string(
                        ErrorKind::ProtocolError,
                        format!("connection: Unexpected PUBCOMP for id: {id}"),
                    )),
                }
            }
            VariablePacket::SubscribePacket(subscribe) => {
                let id = subscribe.packet_identifier();
                let grants = self
                    .broker
                    .subscribe(&self.session, subscribe.subscribes())
                    .await;
                self.respond(VariablePacket::SubackPacket(SubackPacket::new(id, grants)))?;
                Ok(Flow::Continue)
            }
            VariablePacket::UnsubscribePacket(unsubscribe) => {
                let id = unsubscribe.packet_identifier();
                self.broker
                    .unsubscribe(&self.session, unsubscribe.subscribes())
                    .await;
                self.respond(VariablePacket::UnsubackPacket(UnsubackPacket::new(id)))?;
                Ok(Flow::Continue)
            }
            VariablePacket::PingreqPacket(_pingreq) => {
                self.respond(VariablePacket::PingrespPacket(PingrespPacket::new()))?;
                Ok(Flow::Continue)
            }
            VariablePacket::DisconnectPacket(_disconnect) => Ok(Flow::Disconnect),
            // A second CONNECT on a live connection is a protocol violation
            // [MQTT-3.1.0-2], and server-bound packets never include the
            // acknowledgement family.
            other => Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!("connection: Unexpected packet: {other:?}"),
            )),
        }
    }

    async fn on_publish(&self, publish: PublishPacket) -> Result<Flow, Error> {
        let message = Message::from_publish(&publish);
        match publish.qos() {
            QoSWithPacketIdentifier::Level0 => {
                self.broker.publish(message).await;
            }
            QoSWithPacketIdentifier::Level1(id) => {
                self.broker.publish(message).await;
                self.respond(VariablePacket::PubackPacket(PubackPacket::new(id)))?;
            }
            QoSWithPacketIdentifier::Level2(id) => {
                // Redelivered packets with the same id are acknowledged but
                // fanned out only once [MQTT-4.3.3-2].
                let fresh = self.session.state().await.inbound.insert(id);
                if fresh {
                    self.broker.publish(message).await;
                }
                self.respond(VariablePacket::PubrecPacket(PubrecPacket::new(id)))?;
            }
        }
        Ok(Flow::Continue)
    }
}

async fn best_effort_drain(
    mut queue: Receiver<Message>,
    mailbox: Sender<VariablePacket>,
    mut stop: watch::Receiver<bool>,
) -> Receiver<Message> {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            message = queue.recv() => {
                let Some(message) = message else { break };
                let packet = match message.to_publish(None) {
                    Ok(packet) => packet,
                    Err(err) => {
                        log::error!("connection: Dropping undeliverable message: {err}");
                        continue;
                    }
                };
                if mailbox
                    .send(VariablePacket::PublishPacket(packet))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    queue
}

async fn guaranteed_drain(
    mut queue: Receiver<Message>,
    session: Arc<Session>,
    mailbox: Sender<VariablePacket>,
    mut stop: watch::Receiver<bool>,
) -> Receiver<Message> {
    loop {
        let message = tokio::select! {
            _ = stop.changed() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        // Identifier assignment happens here, at the single point where
        // guaranteed messages turn into packets, so ids cannot race.
        let packet_id = tokio::select! {
            _ = stop.changed() => break,
            id = session.packet_ids().allocate() => id,
        };

        let in_flight = match message.qos() {
            QualityOfService::Level1 => OutboundInFlight::AwaitingPuback {
                message: message.clone(),
                done: None,
            },
            QualityOfService::Level2 => OutboundInFlight::AwaitingPubrec {
                message: message.clone(),
                done: None,
            },
            QualityOfService::Level0 => {
                // Queues are split by QoS upstream; a stray QoS-0 message
                // still goes out, just without bookkeeping.
                session.packet_ids().release(packet_id);
                if let Ok(packet) = message.to_publish(None) {
                    let _ret = mailbox.send(VariablePacket::PublishPacket(packet)).await;
                }
                continue;
            }
        };

        let packet = match message.to_publish(Some(packet_id)) {
            Ok(packet) => packet,
            Err(err) => {
                log::error!("connection: Dropping undeliverable message: {err}");
                session.packet_ids().release(packet_id);
                continue;
            }
        };
        session.state().await.outbound.insert(packet_id, in_flight);
        if mailbox
            .send(VariablePacket::PublishPacket(packet))
            .await
            .is_err()
        {
            break;
        }
    }
    queue
}
