// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Accepts client sockets and stacks the upper transport layers.
//!
//! The accept loop itself never performs a handshake: TLS and websocket
//! upgrades run in a task spawned per connection, so one slow or broken
//! client cannot stall the listener.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use http::HeaderValue;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_tungstenite::tungstenite::handshake::server as ws_server;
use tokio_tungstenite::WebSocketStream;

use crate::auth::Authenticator;
use crate::broker::Broker;
use crate::codec::PacketCodec;
use crate::config;
use crate::connection::Connection;
use crate::error::{Error, ErrorKind};
use crate::stream::{ConnectInfo, Stream};
use crate::types::{ConnectionId, ListenerId};

const WS_SUBPROTOCOL: &str = "mqtt";
const WS_PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Each Listener binds to a specific port with one protocol stack.
pub struct Listener {
    id: ListenerId,
    config: config::Listener,
    acceptor: Acceptor,
    broker: Broker,
    auth: Arc<dyn Authenticator>,
    next_conn_seq: u64,
}

enum Acceptor {
    Mqtt(TcpListener),
    Mqtts(TcpListener, TlsAcceptor),
    Ws(TcpListener),
    Wss(TcpListener, TlsAcceptor),
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::Mqtt(..) => "Mqtt",
            Self::Mqtts(..) => "Mqtts",
            Self::Ws(..) => "Ws",
            Self::Wss(..) => "Wss",
        };
        write!(f, "{msg}")
    }
}

impl Listener {
    /// Bind to the address in `listener_config`.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound or the TLS material does
    /// not load.
    pub async fn bind(
        id: ListenerId,
        listener_config: config::Listener,
        broker: Broker,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, Error> {
        let address = listener_config.address();
        let acceptor = match listener_config.protocol() {
            config::Protocol::Mqtt => {
                log::info!("bind mqtt://{address}");
                Acceptor::Mqtt(TcpListener::bind(address).await?)
            }
            config::Protocol::Mqtts => {
                log::info!("bind mqtts://{address}");
                let tls_acceptor = get_tls_acceptor(&listener_config)?;
                Acceptor::Mqtts(TcpListener::bind(address).await?, tls_acceptor)
            }
            config::Protocol::Ws => {
                log::info!("bind ws://{address}");
                Acceptor::Ws(TcpListener::bind(address).await?)
            }
            config::Protocol::Wss => {
                log::info!("bind wss://{address}");
                let tls_acceptor = get_tls_acceptor(&listener_config)?;
                Acceptor::Wss(TcpListener::bind(address).await?, tls_acceptor)
            }
        };
        Ok(Self {
            id,
            config: listener_config,
            acceptor,
            broker,
            auth,
            next_conn_seq: 0,
        })
    }

    /// The address the listener actually bound, useful with port 0.
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let listener = match &self.acceptor {
            Acceptor::Mqtt(listener)
            | Acceptor::Mqtts(listener, ..)
            | Acceptor::Ws(listener)
            | Acceptor::Wss(listener, ..) => listener,
        };
        Ok(listener.local_addr()?)
    }

    /// Accept connections forever, in arrival order.
    pub async fn run_loop(mut self) -> ! {
        loop {
            let (tcp_stream, peer_addr) = match self.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    log::error!("listener: Failed to accept on {}: {err}", self.id);
                    continue;
                }
            };
            self.next_conn_seq += 1;
            let conn_id = ConnectionId::new(self.id, self.next_conn_seq);

            let protocol = self.config.protocol();
            let tls_acceptor = match &self.acceptor {
                Acceptor::Mqtts(_listener, tls_acceptor)
                | Acceptor::Wss(_listener, tls_acceptor) => Some(tls_acceptor.clone()),
                _ => None,
            };
            let path = self.config.path().map(str::to_owned);
            let conn_config = self.config.connection_config();
            let broker = self.broker.clone();
            let auth = Arc::clone(&self.auth);

            tokio::spawn(async move {
                match stack_layers(protocol, tcp_stream, tls_acceptor, path).await {
                    Ok((stream, info)) => {
                        log::info!("listener: New connection {conn_id:?} from {peer_addr}");
                        let connection = Connection::new(
                            conn_id,
                            PacketCodec::new(stream),
                            info,
                            conn_config,
                            broker,
                            auth,
                        );
                        connection.run().await;
                    }
                    Err(err) => {
                        log::error!("listener: Handshake with {peer_addr} failed: {err}");
                    }
                }
            });
        }
    }

    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), Error> {
        let listener = match &self.acceptor {
            Acceptor::Mqtt(listener)
            | Acceptor::Mqtts(listener, ..)
            | Acceptor::Ws(listener)
            | Acceptor::Wss(listener, ..) => listener,
        };
        Ok(listener.accept().await?)
    }
}

/// Perform the TLS and websocket handshakes for one accepted socket.
async fn stack_layers(
    protocol: config::Protocol,
    tcp_stream: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
    path: Option<String>,
) -> Result<(Stream, ConnectInfo), Error> {
    match protocol {
        config::Protocol::Mqtt => Ok((Stream::Mqtt(tcp_stream), ConnectInfo::default())),
        config::Protocol::Mqtts => {
            let tls_stream = accept_tls(tcp_stream, tls_acceptor).await?;
            let peer_certs = peer_certificates(&tls_stream);
            Ok((
                Stream::Mqtts(Box::new(tls_stream)),
                ConnectInfo::new(true, peer_certs, None),
            ))
        }
        config::Protocol::Ws => {
            let (ws_stream, head) = accept_websocket(tcp_stream, path).await?;
            Ok((
                Stream::Ws(Box::new(ws_stream)),
                ConnectInfo::new(false, None, head),
            ))
        }
        config::Protocol::Wss => {
            let tls_stream = accept_tls(tcp_stream, tls_acceptor).await?;
            let peer_certs = peer_certificates(&tls_stream);
            let (wss_stream, head) = accept_websocket(tls_stream, path).await?;
            Ok((
                Stream::Wss(Box::new(wss_stream)),
                ConnectInfo::new(true, peer_certs, head),
            ))
        }
    }
}

async fn accept_tls(
    tcp_stream: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<TlsStream<TcpStream>, Error> {
    let tls_acceptor = tls_acceptor.ok_or_else(|| {
        Error::new(ErrorKind::CertError, "listener: TLS acceptor not configured")
    })?;
    Ok(tls_acceptor.accept(tcp_stream).await?)
}

fn peer_certificates(
    tls_stream: &TlsStream<TcpStream>,
) -> Option<Vec<CertificateDer<'static>>> {
    tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .map(|certs| certs.iter().map(|cert| cert.clone().into_owned()).collect())
}

/// Upgrade the stream to a websocket, enforcing the configured url path,
/// answering the `mqtt` subprotocol when offered and keeping the request
/// head for the authenticator.
async fn accept_websocket<S>(
    stream: S,
    path: Option<String>,
) -> Result<(WebSocketStream<S>, Option<http::Request<()>>), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut head = None;
    let callback = |request: &ws_server::Request,
                    mut response: ws_server::Response|
     -> Result<ws_server::Response, ws_server::ErrorResponse> {
        if let Some(path) = &path {
            if request.uri().path() != path {
                let mut resp = http::Response::new(None);
                *resp.status_mut() = http::StatusCode::NOT_FOUND;
                return Err(resp);
            }
        }
        let offers_mqtt = request
            .headers()
            .get(WS_PROTOCOL_HEADER)
            .and_then(|protocols| protocols.to_str().ok())
            .is_some_and(|protocols| {
                protocols
                    .split(',')
                    .any(|protocol| protocol.trim() == WS_SUBPROTOCOL)
            });
        if offers_mqtt {
            response
                .headers_mut()
                .append(WS_PROTOCOL_HEADER, HeaderValue::from_static(WS_SUBPROTOCOL));
        }
        head = Some(clone_request_head(request));
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    Ok((ws_stream, head))
}

fn clone_request_head(request: &ws_server::Request) -> http::Request<()> {
    let mut head = http::Request::new(());
    *head.method_mut() = request.method().clone();
    *head.uri_mut() = request.uri().clone();
    *head.version_mut() = request.version();
    *head.headers_mut() = request.headers().clone();
    head
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            Error::from_string(
                ErrorKind::CertError,
                format!("Failed to load cert file at {path:?}, got: {err:?}"),
            )
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        Error::from_string(
            ErrorKind::CertError,
            format!("Failed to load key file at {path:?}"),
        )
    })
}

fn get_tls_acceptor(listener_config: &config::Listener) -> Result<TlsAcceptor, Error> {
    let cert_file = listener_config
        .cert_file()
        .ok_or_else(|| Error::new(ErrorKind::CertError, "cert_file is required"))?;
    let key_file = listener_config
        .key_file()
        .ok_or_else(|| Error::new(ErrorKind::CertError, "key_file is required"))?;

    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
