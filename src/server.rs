// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::{Arg, ArgAction};
use std::net::SocketAddr;
use std::path::Path;
use tokio::runtime::Runtime;

use crate::auth;
use crate::broker::Broker;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::listener::Listener;
use crate::log::init_log;

pub const DEFAULT_CONFIG: &str = "/etc/minato/minato.toml";
const OPT_CONFIG: &str = "config";
const OPT_TEST: &str = "test";

/// Owns the broker and its listeners for one server run.
pub struct ServerContext {
    broker: Broker,
    listeners: Vec<Listener>,
}

impl ServerContext {
    /// Build the broker and bind every listener in `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the authenticator cannot be built or a listener
    /// fails to bind.
    pub async fn bind(config: Config) -> Result<Self, Error> {
        let authenticator = auth::from_security(config.security())?;
        let broker = Broker::new(config.general().broker_config());

        let mut listeners = Vec::with_capacity(config.listeners().len());
        for (listener_id, listener_config) in (0_u32..).zip(config.listeners().iter()) {
            let listener = Listener::bind(
                listener_id,
                listener_config.clone(),
                broker.clone(),
                authenticator.clone(),
            )
            .await?;
            listeners.push(listener);
        }
        Ok(Self { broker, listeners })
    }

    /// Handle to the broker, e.g. for server-originated publishes.
    #[must_use]
    pub fn broker(&self) -> Broker {
        self.broker.clone()
    }

    /// The bound address of each listener, in config order.
    ///
    /// # Errors
    ///
    /// Returns error if a listener socket has no local address.
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>, Error> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }

    /// Run all listeners until the process receives ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns error if the shutdown signal handler cannot be installed.
    pub async fn run_loop(self) -> Result<(), Error> {
        let mut handles = Vec::with_capacity(self.listeners.len());
        for listener in self.listeners {
            handles.push(tokio::spawn(listener.run_loop()));
        }

        tokio::signal::ctrl_c().await?;
        log::info!("server: Got shutdown signal");
        for handle in &handles {
            handle.abort();
        }
        Ok(())
    }
}

/// Entry point of server.
///
/// # Errors
///
/// Returns error if the config file is invalid or the server fails to start.
pub fn run_server() -> Result<(), Error> {
    let matches = clap::Command::new("Minato")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Xu Shaohua <shaohua@biofan.org>")
        .about("Embeddable MQTT broker")
        .arg(
            Arg::new(OPT_CONFIG)
                .short('c')
                .long(OPT_CONFIG)
                .value_name("config_file")
                .help("Specify config file path"),
        )
        .arg(
            Arg::new(OPT_TEST)
                .short('t')
                .long(OPT_TEST)
                .action(ArgAction::SetTrue)
                .help("Test config file and exit"),
        )
        .get_matches();

    let config_file = match matches.get_one::<String>(OPT_CONFIG) {
        Some(config_file) => Some(config_file.clone()),
        None if Path::new(DEFAULT_CONFIG).exists() => Some(DEFAULT_CONFIG.to_owned()),
        None => None,
    };

    let config = if let Some(config_file) = config_file {
        let config_content = std::fs::read_to_string(&config_file).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("Failed to read config file {config_file}, err: {err}"),
            )
        })?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;

        if matches.get_flag(OPT_TEST) {
            println!("The configuration file {config_file} syntax is Ok");
            return Ok(());
        }
        config
    } else {
        Config::default()
    };

    init_log(config.log())?;

    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        let server = ServerContext::bind(config).await?;
        server.run_loop().await
    })
}
