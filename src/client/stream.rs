// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{rustls, TlsConnector};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

use super::options::{ConnectOptions, ConnectType, TlsType};
use crate::error::{Error, ErrorKind};
use crate::stream::ByteStream;

const WS_SUBPROTOCOL: &str = "mqtt";
const WS_PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Client side transport stack.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
    Ws(Box<WebSocketStream<TcpStream>>),
    Wss(Box<WebSocketStream<TlsStream<TcpStream>>>),
}

impl Stream {
    /// Open the transport described by `options`, performing the TLS and
    /// websocket handshakes as needed.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot connect or a handshake fails.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, Error> {
        let tcp_stream = TcpStream::connect(options.address()).await?;
        match options.connect_type() {
            ConnectType::Mqtt => Ok(Self::Mqtt(tcp_stream)),
            ConnectType::Mqtts(mqtts) => {
                let tls_stream =
                    connect_tls(tcp_stream, &mqtts.domain, &mqtts.tls_type).await?;
                Ok(Self::Mqtts(Box::new(tls_stream)))
            }
            ConnectType::Ws(ws) => {
                let url = format!("ws://{}{}", options.address(), ws.path);
                let request = websocket_request(&url)?;
                let (ws_stream, _response) =
                    tokio_tungstenite::client_async(request, tcp_stream).await?;
                Ok(Self::Ws(Box::new(ws_stream)))
            }
            ConnectType::Wss(wss) => {
                let tls_stream = connect_tls(tcp_stream, &wss.domain, &wss.tls_type).await?;
                let url = format!("wss://{}{}", wss.domain, wss.path);
                let request = websocket_request(&url)?;
                let (wss_stream, _response) =
                    tokio_tungstenite::client_async(request, tls_stream).await?;
                Ok(Self::Wss(Box::new(wss_stream)))
            }
        }
    }
}

fn websocket_request(url: &str) -> Result<http::Request<()>, Error> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .append(WS_PROTOCOL_HEADER, HeaderValue::from_static(WS_SUBPROTOCOL));
    Ok(request)
}

async fn connect_tls(
    tcp_stream: TcpStream,
    domain: &str,
    tls_type: &TlsType,
) -> Result<TlsStream<TcpStream>, Error> {
    let mut root_store = rustls::RootCertStore::empty();
    match tls_type {
        TlsType::CaSigned => {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TlsType::SelfSigned(root_ca) => {
            let mut reader = BufReader::new(File::open(root_ca)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                root_store.add(cert?)?;
            }
        }
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(domain.to_owned()).map_err(|err| {
        Error::from_string(
            ErrorKind::CertError,
            format!("Invalid TLS domain name: {domain:?}, err: {err}"),
        )
    })?;
    Ok(connector.connect(server_name, tcp_stream).await?)
}

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
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.shutdown().await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.shutdown().await?),
            Self::Ws(ws_stream) => Ok(ws_stream.close(None).await?),
            Self::Wss(wss_stream) => Ok(wss_stream.close(None).await?),
        }
    }
}
