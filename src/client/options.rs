// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::path::PathBuf;
use std::time::Duration;

use crate::message::Message;
use crate::types::random_client_id;

#[derive(Clone, Debug)]
pub enum TlsType {
    /// Signed by a root CA the system trusts, like `Let's Encrypt`.
    CaSigned,

    /// Self signed certificate; path to the root ca file in pem format.
    SelfSigned(PathBuf),
}

#[derive(Clone, Debug)]
pub struct MqttsConnect {
    pub domain: String,
    pub tls_type: TlsType,
}

#[derive(Clone, Debug)]
pub struct WsConnect {
    pub path: String,
}

#[derive(Clone, Debug)]
pub struct WssConnect {
    pub domain: String,
    pub path: String,
    pub tls_type: TlsType,
}

#[derive(Clone, Debug)]
pub enum ConnectType {
    Mqtt,
    Mqtts(MqttsConnect),
    Ws(WsConnect),
    Wss(WssConnect),
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    address: String,
    connect_type: ConnectType,
    client_id: String,
    clean_session: bool,
    keep_alive: u16,
    connect_timeout: Duration,
    reconnect: bool,
    reconnect_delay: Duration,
    username: Option<String>,
    password: Option<String>,
    will: Option<Message>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:1883".to_string(),
            connect_type: ConnectType::Mqtt,
            client_id: random_client_id(),
            clean_session: true,
            keep_alive: 30,
            connect_timeout: Duration::from_secs(10),
            reconnect: true,
            reconnect_delay: Duration::from_secs(2),
            username: None,
            password: None,
            will: None,
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_connect_type(&mut self, connect_type: ConnectType) -> &mut Self {
        self.connect_type = connect_type;
        self
    }

    #[must_use]
    pub const fn connect_type(&self) -> &ConnectType {
        &self.connect_type
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Keep alive interval in seconds; zero disables the ping timer.
    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Whether the background task re-establishes a dropped connection.
    pub fn set_reconnect(&mut self, reconnect: bool) -> &mut Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub const fn reconnect(&self) -> bool {
        self.reconnect
    }

    pub fn set_reconnect_delay(&mut self, reconnect_delay: Duration) -> &mut Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn set_credentials(&mut self, username: &str, password: Option<&str>) -> &mut Self {
        self.username = Some(username.to_owned());
        self.password = password.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Message the broker publishes for us if the connection dies without a
    /// DISCONNECT packet.
    pub fn set_will(&mut self, will: Message) -> &mut Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub const fn will(&self) -> Option<&Message> {
        self.will.as_ref()
    }
}
