// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::{HashMap, HashSet};

use mqtt::QualityOfService;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, watch, Mutex, MutexGuard, Notify};

use crate::error::{Error, ErrorKind};
use crate::message::Message;
use crate::packet_id::PacketIdAllocator;
use crate::types::{ConnectionId, PacketId, SessionKey};

/// Outbound QoS bookkeeping for one packet identifier.
///
/// `AwaitingPuback` and `AwaitingPubrec` keep the message so it can be
/// retransmitted with the dup flag when a persistent session reattaches.
/// The optional sender completes the submitter once the handshake ends.
#[derive(Debug)]
pub enum OutboundInFlight {
    AwaitingPuback {
        message: Message,
        done: Option<oneshot::Sender<()>>,
    },
    AwaitingPubrec {
        message: Message,
        done: Option<oneshot::Sender<()>>,
    },
    AwaitingPubcomp {
        done: Option<oneshot::Sender<()>>,
    },
}

impl OutboundInFlight {
    pub fn complete(self) {
        let done = match self {
            Self::AwaitingPuback { done, .. }
            | Self::AwaitingPubrec { done, .. }
            | Self::AwaitingPubcomp { done } => done,
        };
        if let Some(done) = done {
            let _ret = done.send(());
        }
    }
}

/// Cancellation handle of the connection task group currently bound to a
/// session. Takeover notifies `stop` and then waits for `done` to flip.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    stop: std::sync::Arc<Notify>,
    done: watch::Receiver<bool>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(id: ConnectionId, stop: std::sync::Arc<Notify>, done: watch::Receiver<bool>) -> Self {
        Self { id, stop, done }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Cancel the connection task group and wait until it wound down.
    pub async fn cancel(mut self) {
        self.stop.notify_one();
        // An error here means the group is already gone, which is fine.
        let _ret = self.done.wait_for(|finished| *finished).await;
    }

    /// Cancel without waiting, used when the caller may be running inside
    /// the very task group being cancelled.
    pub fn cancel_detached(self) {
        self.stop.notify_one();
    }
}

#[derive(Debug)]
pub struct SessionState {
    /// Filter -> granted QoS, mirrored in the broker trie.
    pub subscriptions: HashMap<String, QualityOfService>,

    /// Packet id -> outbound QoS state machine.
    pub outbound: HashMap<PacketId, OutboundInFlight>,

    /// Unreleased inbound QoS-2 publishes, for deduplication.
    pub inbound: HashSet<PacketId>,

    /// Message published on behalf of the client when its connection dies
    /// without a DISCONNECT packet.
    pub will: Option<Message>,

    /// The connection task group currently bound, if any.
    pub connection: Option<ConnectionHandle>,

    /// Queue ends parked here while the session is detached; the bound
    /// connection takes them and puts them back on wind-down.
    pub best_effort_rx: Option<Receiver<Message>>,
    pub guaranteed_rx: Option<Receiver<Message>>,

    /// Set when the guaranteed queue overflowed; the session is dead and
    /// must not be reattached.
    pub terminated: bool,
}

/// Per-client state which outlives any single network connection.
///
/// The broker and at most one connection task group share a session; this
/// mutex serializes all state mutation. Queue senders sit outside the mutex
/// so publish fan-out does not contend with packet dispatch.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    client_id: String,
    clean_session: bool,
    packet_ids: PacketIdAllocator,
    best_effort_tx: Sender<Message>,
    guaranteed_tx: Sender<Message>,
    state: Mutex<SessionState>,
}

impl Session {
    #[must_use]
    pub fn new(
        key: SessionKey,
        client_id: &str,
        clean_session: bool,
        best_effort_capacity: usize,
        guaranteed_capacity: usize,
    ) -> Self {
        let (best_effort_tx, best_effort_rx) = mpsc::channel(best_effort_capacity);
        let (guaranteed_tx, guaranteed_rx) = mpsc::channel(guaranteed_capacity);
        Self {
            key,
            client_id: client_id.to_owned(),
            clean_session,
            packet_ids: PacketIdAllocator::new(),
            best_effort_tx,
            guaranteed_tx,
            state: Mutex::new(SessionState {
                subscriptions: HashMap::new(),
                outbound: HashMap::new(),
                inbound: HashSet::new(),
                will: None,
                connection: None,
                best_effort_rx: Some(best_effort_rx),
                guaranteed_rx: Some(guaranteed_rx),
                terminated: false,
            }),
        }
    }

    #[must_use]
    pub const fn key(&self) -> SessionKey {
        self.key
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn packet_ids(&self) -> &PacketIdAllocator {
        &self.packet_ids
    }

    pub async fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Route a message copy to this session per its effective QoS.
    ///
    /// A full best-effort queue silently drops the message; the publisher
    /// never blocks here.
    ///
    /// # Errors
    ///
    /// Returns error if the guaranteed queue is full, which is fatal to the
    /// session.
    pub fn enqueue(&self, message: Message) -> Result<(), Error> {
        let queue = if message.qos() == QualityOfService::Level0 {
            &self.best_effort_tx
        } else {
            &self.guaranteed_tx
        };
        match queue.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                if message.qos() == QualityOfService::Level0 {
                    log::debug!(
                        "session: Dropped QoS-0 message to slow session {}, topic: {}",
                        self.key,
                        message.topic()
                    );
                    Ok(())
                } else {
                    Err(Error::from_string(
                        ErrorKind::QueueError,
                        format!("session: Guaranteed queue of {} overflowed", self.key),
                    ))
                }
            }
            // The receivers live inside the session state, so the channel
            // can only close when the session itself is being dropped.
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }
}
