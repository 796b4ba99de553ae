// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

mod general;
mod listener;
mod log;
mod security;

pub use self::log::{Log, LogLevel};
pub use general::General;
pub use listener::{Listener, Protocol};
pub use security::Security;

/// Server main config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "General::default")]
    general: General,

    #[serde(default = "Listener::default_listeners")]
    listeners: Vec<Listener>,

    #[serde(default = "Security::default")]
    security: Security,

    #[serde(default = "Log::default")]
    log: Log,
}

impl Config {
    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    #[must_use]
    pub const fn security(&self) -> &Security {
        &self.security
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some option in the config is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        self.general.validate()?;
        for listener in &self.listeners {
            listener.validate()?;
        }
        self.log.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.listeners().is_empty());
        assert!(config.security().allow_anonymous());
    }

    #[test]
    fn test_parse_toml() {
        let content = r#"
[general]
maximum_qos = 1
guaranteed_queue_capacity = 16

[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:1883"
keep_alive = 30

[[listeners]]
protocol = "ws"
address = "127.0.0.1:8083"
path = "/mqtt"

[security]
allow_anonymous = false

[log]
log_level = "debug"
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.general().maximum_qos(), 1);
        assert_eq!(config.general().guaranteed_queue_capacity(), 16);
        assert_eq!(config.listeners().len(), 2);
        assert_eq!(config.listeners()[0].protocol(), Protocol::Mqtt);
        assert_eq!(config.listeners()[0].keep_alive(), 30);
        assert_eq!(config.listeners()[1].protocol(), Protocol::Ws);
        assert_eq!(config.listeners()[1].path(), Some("/mqtt"));
        assert!(!config.security().allow_anonymous());
        config.validate().unwrap();
    }
}
