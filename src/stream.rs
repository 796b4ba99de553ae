// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

use crate::error::Error;

/// Uniform byte-stream contract shared by every transport composition.
///
/// A zero return from `read_buf` signals an orderly close of the peer.
#[async_trait]
pub trait ByteStream: Send {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, Error>;

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Write a batch of chunks, each preserving its framing boundary on
    /// frame-oriented transports.
    async fn write_all_batch(&mut self, chunks: &[Vec<u8>]) -> Result<(), Error> {
        for chunk in chunks {
            self.write_all(chunk).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error>;
}

/// Each Stream represents a duplex socket connection to a client, with the
/// TLS and WebSocket layers already stacked on top of the raw stream.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
    Ws(Box<WebSocketStream<TcpStream>>),
    Wss(Box<WebSocketStream<TlsStream<TcpStream>>>),
}

/// Read one binary frame into `buf`.
///
/// Text, ping and pong frames are skipped; a close frame or the end of the
/// stream maps to an orderly close.
async fn read_ws_frame<S>(
    ws_stream: &mut WebSocketStream<S>,
    buf: &mut BytesMut,
) -> Result<usize, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    loop {
        match ws_stream.next().await {
            Some(msg) => match msg? {
                Message::Binary(data) if !data.is_empty() => {
                    buf.extend_from_slice(&data);
                    return Ok(data.len());
                }
                Message::Close(_) => return Ok(0),
                _ => {}
            },
            None => return Ok(0),
        }
    }
}

#[async_trait]
impl ByteStream for Stream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.read_buf(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.read_buf(buf).await?),
            Self::Ws(ws_stream) => read_ws_frame(ws_stream, buf).await,
            Self::Wss(wss_stream) => read_ws_frame(wss_stream, buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.write_all(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.write_all(buf).await?),
            Self::Ws(ws_stream) => {
                let msg = Message::binary(buf.to_vec());
                ws_stream.send(msg).await?;
                Ok(())
            }
            Self::Wss(wss_stream) => {
                let msg = Message::binary(buf.to_vec());
                wss_stream.send(msg).await?;
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        // Close the outer layer first: the websocket close frame and the TLS
        // close_notify both travel over the stream below them.
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.shutdown().await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.shutdown().await?),
            Self::Ws(ws_stream) => Ok(ws_stream.close(None).await?),
            Self::Wss(wss_stream) => Ok(wss_stream.close(None).await?),
        }
    }
}

/// Facts about a connection gathered while the transport layers were
/// stacked, handed to the authenticator later on.
#[derive(Debug, Default)]
pub struct ConnectInfo {
    tls: bool,
    peer_certs: Option<Vec<CertificateDer<'static>>>,
    http_request: Option<http::Request<()>>,
}

impl ConnectInfo {
    #[must_use]
    pub const fn new(
        tls: bool,
        peer_certs: Option<Vec<CertificateDer<'static>>>,
        http_request: Option<http::Request<()>>,
    ) -> Self {
        Self {
            tls,
            peer_certs,
            http_request,
        }
    }

    #[must_use]
    pub const fn tls(&self) -> bool {
        self.tls
    }

    #[must_use]
    pub fn peer_certs(&self) -> Option<&[CertificateDer<'static>]> {
        self.peer_certs.as_deref()
    }

    #[must_use]
    pub const fn http_request(&self) -> Option<&http::Request<()>> {
        self.http_request.as_ref()
    }
}
