// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Framed packet send/receive over any byte-stream.
//!
//! The wire format itself belongs to the `mqtt` crate; this module only
//! accumulates bytes until the remaining-length field of the fixed header is
//! satisfied and hands complete frames to the codec.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use mqtt::packet::VariablePacket;
use mqtt::{Decodable, Encodable};

use crate::error::{Error, ErrorKind};
use crate::stream::ByteStream;

const READ_BUF_CAPACITY: usize = 4096;

/// Longest legal encoding of the remaining-length field.
const MAX_REMAINING_LENGTH_BYTES: usize = 4;

pub struct PacketCodec<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: ByteStream> PacketCodec<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
        }
    }

    /// Receive the next control packet.
    ///
    /// Returns `Ok(None)` on an orderly close at a packet boundary.
    ///
    /// # Errors
    ///
    /// Returns error if the stream fails, the peer closes mid-packet, or the
    /// frame does not decode as an MQTT control packet.
    pub async fn recv(&mut self) -> Result<Option<VariablePacket>, Error> {
        loop {
            if let Some(frame_len) = frame_length(&self.buf)? {
                if self.buf.len() >= frame_len {
                    let frame = self.buf.split_to(frame_len);
                    let packet =
                        VariablePacket::decode(&mut Cursor::new(&frame[..])).map_err(|err| {
                            Error::from_string(
                                ErrorKind::DecodeError,
                                format!("Invalid packet: {err:?}"),
                            )
                        })?;
                    return Ok(Some(packet));
                }
            }

            let n_recv = self.stream.read_buf(&mut self.buf).await?;
            if n_recv == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::new(
                    ErrorKind::DecodeError,
                    "Stream closed with a partial packet in the buffer",
                ));
            }
        }
    }

    /// Encode and send one control packet.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails or the stream write fails.
    pub async fn send(&mut self, packet: &VariablePacket) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet
            .encode(&mut buf)
            .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
        self.stream.write_all(&buf).await
    }

    /// Encode and send a batch of packets in order, flushing them to the
    /// transport as one sequence of chunks.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails or the stream write fails.
    pub async fn send_batch(&mut self, packets: &[VariablePacket]) -> Result<(), Error> {
        let mut chunks = Vec::with_capacity(packets.len());
        for packet in packets {
            let mut buf = Vec::new();
            packet
                .encode(&mut buf)
                .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
            chunks.push(buf);
        }
        self.stream.write_all_batch(&chunks).await
    }

    /// Close the underlying transport gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the close handshake of a transport layer fails.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.stream.close().await
    }
}

/// Total length of the first frame in `buf`, or `None` if more bytes are
/// needed to tell.
fn frame_length(buf: &impl Buf) -> Result<Option<usize>, Error> {
    let chunk = buf.chunk();
    if chunk.len() < 2 {
        return Ok(None);
    }
    let mut remaining: usize = 0;
    let mut shift = 0;
    for (index, byte) in chunk[1..].iter().enumerate() {
        if index >= MAX_REMAINING_LENGTH_BYTES {
            return Err(Error::new(
                ErrorKind::DecodeError,
                "Malformed remaining-length field",
            ));
        }
        remaining |= usize::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(Some(1 + index + 1 + remaining));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use mqtt::packet::{ConnectPacket, PingreqPacket, PublishPacket, VariablePacket};
    use mqtt::packet::publish::QoSWithPacketIdentifier;
    use mqtt::TopicName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    struct PipeStream(DuplexStream);

    #[async_trait]
    impl ByteStream for PipeStream {
        async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
            Ok(self.0.read_buf(buf).await?)
        }

        async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
            Ok(self.0.write_all(buf).await?)
        }

        async fn close(&mut self) -> Result<(), Error> {
            Ok(self.0.shutdown().await?)
        }
    }

    fn codec_pair() -> (PacketCodec<PipeStream>, PacketCodec<PipeStream>) {
        let (client, server) = tokio::io::duplex(4096);
        (
            PacketCodec::new(PipeStream(client)),
            PacketCodec::new(PipeStream(server)),
        )
    }

    #[test]
    fn test_frame_length() {
        // PINGREQ: type byte + zero remaining length.
        assert_eq!(frame_length(&&[0xc0_u8, 0x00][..]).unwrap(), Some(2));
        // Two byte remaining-length: 321 = 0xc1 0x02.
        assert_eq!(
            frame_length(&&[0x30_u8, 0xc1, 0x02][..]).unwrap(),
            Some(3 + 321)
        );
        // Not enough bytes to finish the varint yet.
        assert_eq!(frame_length(&&[0x30_u8, 0x80][..]).unwrap(), None);
        assert_eq!(frame_length(&&[0x30_u8][..]).unwrap(), None);
        // Five continuation bytes are malformed.
        assert!(frame_length(&&[0x30_u8, 0x80, 0x80, 0x80, 0x80, 0x01][..]).is_err());
    }

    #[tokio::test]
    async fn test_send_recv_round_trip() {
        let (mut tx, mut rx) = codec_pair();

        let connect = VariablePacket::ConnectPacket(ConnectPacket::new("round-trip"));
        tx.send(&connect).await.unwrap();
        let publish = VariablePacket::PublishPacket(PublishPacket::new(
            TopicName::new("a/b").unwrap(),
            QoSWithPacketIdentifier::Level1(9),
            b"payload".to_vec(),
        ));
        tx.send(&publish).await.unwrap();

        match rx.recv().await.unwrap() {
            Some(VariablePacket::ConnectPacket(packet)) => {
                assert_eq!(packet.client_identifier(), "round-trip");
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Some(VariablePacket::PublishPacket(packet)) => {
                assert_eq!(packet.topic_name(), "a/b");
                assert_eq!(packet.payload(), b"payload");
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recv_across_split_writes() {
        let (client, server) = tokio::io::duplex(4096);
        let mut rx = PacketCodec::new(PipeStream(server));

        let mut encoded = Vec::new();
        VariablePacket::PingreqPacket(PingreqPacket::new())
            .encode(&mut encoded)
            .unwrap();

        let mut raw = client;
        let (head, tail) = encoded.split_at(1);
        raw.write_all(head).await.unwrap();
        let recv = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        raw.write_all(tail).await.unwrap();

        match recv.await.unwrap().unwrap() {
            Some(VariablePacket::PingreqPacket(_)) => {}
            other => panic!("expected PINGREQ, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_orderly_close() {
        let (mut tx, mut rx) = codec_pair();
        tx.close().await.unwrap();
        assert!(rx.recv().await.unwrap().is_none());
    }
}
