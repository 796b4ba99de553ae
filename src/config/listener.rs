// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

use crate::connection::ConnectionConfig;
use crate::error::{Error, ErrorKind};

/// Binding protocol types.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Raw Mqtt protocol, in TCP.
    #[serde(alias = "mqtt")]
    Mqtt,

    /// Raw Mqtt protocol, in TCP with TLS encryption.
    #[serde(alias = "mqtts")]
    Mqtts,

    /// Websocket protocol.
    #[serde(alias = "ws")]
    Ws,

    /// Secure Websocket protocol.
    #[serde(alias = "wss")]
    Wss,
}

/// Listener represents a unique address/port combination and mqtt connection
/// protocol.
#[derive(Debug, Deserialize, Clone)]
pub struct Listener {
    /// Binding protocol.
    ///
    /// Default is mqtt.
    #[serde(default = "Listener::default_protocol")]
    protocol: Protocol,

    /// Binding address, including domain name and port.
    ///
    /// Common addresses are:
    /// - 0.0.0.0:1883, for mqtt
    /// - 0.0.0.0:8883, for mqtts
    /// - 0.0.0.0:8083, for mqtt over WebSocket
    /// - 0.0.0.0:8084, for mqtt over secure WebSocket
    ///
    /// Default is 0.0.0.0:1883.
    #[serde(default = "Listener::default_address")]
    address: String,

    /// Url path to bind to, only used for websocket protocols.
    ///
    /// Default is None, which means do not check url path.
    #[serde(default = "Listener::default_path")]
    path: Option<String>,

    /// Path to TLS cert file.
    ///
    /// Default is None.
    #[serde(default = "Listener::default_cert_file")]
    cert_file: Option<PathBuf>,

    /// Path to TLS private key file.
    ///
    /// Default is None.
    #[serde(default = "Listener::default_key_file")]
    key_file: Option<PathBuf>,

    /// Connection keep alive timeout in seconds.
    ///
    /// Used when the client sets no keep alive value of its own in the
    /// ConnectPacket. Zero disables the check.
    ///
    /// Default is 60.
    #[serde(default = "Listener::default_keep_alive")]
    keep_alive: u16,

    /// Timeout value in seconds before receiving a Connect Packet from the
    /// client.
    ///
    /// The timer is triggered when the client stream is connected.
    ///
    /// Default is 60.
    #[serde(default = "Listener::default_connect_timeout")]
    connect_timeout: u16,

    /// MAY allow a Client to supply a ClientId that has a length of zero
    /// bytes; the broker then assigns a unique ClientId to that Client.
    ///
    /// With this flag off such clients get an IdentifierRejected
    /// ConnectAckPacket instead.
    ///
    /// Default is false.
    #[serde(default = "Listener::default_allow_empty_client_id")]
    allow_empty_client_id: bool,
}

impl Listener {
    #[must_use]
    pub fn default_listeners() -> Vec<Self> {
        Vec::new()
    }

    #[must_use]
    pub const fn default_protocol() -> Protocol {
        Protocol::Mqtt
    }

    #[must_use]
    pub fn default_address() -> String {
        "0.0.0.0:1883".to_string()
    }

    #[must_use]
    pub const fn default_path() -> Option<String> {
        None
    }

    #[must_use]
    pub const fn default_cert_file() -> Option<PathBuf> {
        None
    }

    #[must_use]
    pub const fn default_key_file() -> Option<PathBuf> {
        None
    }

    #[must_use]
    pub const fn default_keep_alive() -> u16 {
        60
    }

    #[must_use]
    pub const fn default_connect_timeout() -> u16 {
        60
    }

    #[must_use]
    pub const fn default_allow_empty_client_id() -> bool {
        false
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    #[must_use]
    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> u16 {
        self.connect_timeout
    }

    #[must_use]
    pub const fn allow_empty_client_id(&self) -> bool {
        self.allow_empty_client_id
    }

    #[must_use]
    pub const fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            allow_empty_client_id: self.allow_empty_client_id,
        }
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if the socket address is invalid or the TLS material is
    /// missing for a secure protocol.
    pub fn validate(&self) -> Result<(), Error> {
        let _addr = self.address.to_socket_addrs().map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("Invalid socket address: {}, err: {:?}", &self.address, err),
            )
        })?;

        if matches!(self.protocol, Protocol::Mqtts | Protocol::Wss) {
            if self.cert_file.is_none() {
                return Err(Error::new(
                    ErrorKind::ConfigError,
                    "cert_file is required for mqtts/wss listeners",
                ));
            }
            if self.key_file.is_none() {
                return Err(Error::new(
                    ErrorKind::ConfigError,
                    "key_file is required for mqtts/wss listeners",
                ));
            }
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            protocol: Self::default_protocol(),
            address: Self::default_address(),
            path: Self::default_path(),
            cert_file: Self::default_cert_file(),
            key_file: Self::default_key_file(),
            keep_alive: Self::default_keep_alive(),
            connect_timeout: Self::default_connect_timeout(),
            allow_empty_client_id: Self::default_allow_empty_client_id(),
        }
    }
}
