// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::PublishPacket;
use mqtt::{QualityOfService, TopicName};

use crate::error::{Error, ErrorKind};
use crate::types::PacketId;

/// An application message, decoupled from its wire representation.
///
/// Queues and the subscription trie move these around; a `PublishPacket` is
/// only produced at the moment the message is handed to the output task,
/// because the packet identifier is assigned there.
#[derive(Debug, Clone)]
pub struct Message {
    topic: String,
    payload: Bytes,
    qos: QualityOfService,
    retain: bool,
    dup: bool,
}

impl Message {
    /// Create a new message with a validated topic name.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is empty or contains wildcard characters.
    pub fn new(topic: &str, qos: QualityOfService, payload: impl Into<Bytes>) -> Result<Self, Error> {
        let _check = TopicName::new(topic.to_owned()).map_err(|err| {
            Error::from_string(
                ErrorKind::ProtocolError,
                format!("Invalid topic name: {topic:?}, err: {err:?}"),
            )
        })?;
        Ok(Self {
            topic: topic.to_owned(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
        })
    }

    #[must_use]
    pub fn from_publish(packet: &PublishPacket) -> Self {
        let qos = match packet.qos() {
            QoSWithPacketIdentifier::Level0 => QualityOfService::Level0,
            QoSWithPacketIdentifier::Level1(_) => QualityOfService::Level1,
            QoSWithPacketIdentifier::Level2(_) => QualityOfService::Level2,
        };
        Self {
            topic: packet.topic_name().to_owned(),
            payload: Bytes::copy_from_slice(packet.payload()),
            qos,
            retain: packet.retain(),
            dup: packet.dup(),
        }
    }

    /// Wrap this message into a publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if QoS is greater than zero and no packet id is given.
    pub fn to_publish(&self, packet_id: Option<PacketId>) -> Result<PublishPacket, Error> {
        let topic = TopicName::new(self.topic.clone()).map_err(|err| {
            Error::from_string(
                ErrorKind::EncodeError,
                format!("Invalid topic name: {:?}, err: {err:?}", self.topic),
            )
        })?;
        let qos = match (self.qos, packet_id) {
            (QualityOfService::Level0, _) => QoSWithPacketIdentifier::Level0,
            (QualityOfService::Level1, Some(id)) => QoSWithPacketIdentifier::Level1(id),
            (QualityOfService::Level2, Some(id)) => QoSWithPacketIdentifier::Level2(id),
            (_, None) => {
                return Err(Error::new(
                    ErrorKind::EncodeError,
                    "Packet id is required for QoS > 0",
                ));
            }
        };
        let mut packet = PublishPacket::new(topic, qos, self.payload.to_vec());
        packet.set_retain(self.retain);
        packet.set_dup(self.dup);
        Ok(packet)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn qos(&self) -> QualityOfService {
        self.qos
    }

    pub const fn set_qos(&mut self, qos: QualityOfService) {
        self.qos = qos;
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    pub const fn set_retain(&mut self, retain: bool) {
        self.retain = retain;
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    pub const fn set_dup(&mut self, dup: bool) {
        self.dup = dup;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_wildcard_topic() {
        assert!(Message::new("a/b", QualityOfService::Level0, "hi".as_bytes().to_vec()).is_ok());
        assert!(Message::new("a/+", QualityOfService::Level0, Vec::new()).is_err());
        assert!(Message::new("a/#", QualityOfService::Level0, Vec::new()).is_err());
    }

    #[test]
    fn test_publish_round_trip() {
        let mut message =
            Message::new("sensor/temp", QualityOfService::Level1, b"21.5".to_vec()).unwrap();
        message.set_retain(true);
        let packet = message.to_publish(Some(7)).unwrap();
        assert_eq!(packet.topic_name(), "sensor/temp");
        assert!(packet.retain());

        let back = Message::from_publish(&packet);
        assert_eq!(back.topic(), "sensor/temp");
        assert_eq!(back.payload(), b"21.5");
        assert_eq!(back.qos(), QualityOfService::Level1);
    }

    #[test]
    fn test_qos_needs_packet_id() {
        let message = Message::new("a", QualityOfService::Level2, Vec::new()).unwrap();
        assert!(message.to_publish(None).is_err());
        assert!(message.to_publish(Some(1)).is_ok());
    }
}
