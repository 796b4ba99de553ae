// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use mqtt::QualityOfService;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::error::{Error, ErrorKind};
use crate::types::qos_from_u8;

#[derive(Debug, Deserialize, Clone)]
pub struct General {
    /// The highest QoS level granted to subscribers.
    ///
    /// Subscription requests above this level are downgraded in the SUBACK.
    ///
    /// Default is 2.
    #[serde(default = "General::default_maximum_qos")]
    maximum_qos: u8,

    /// Per-session bound of the QoS-0 delivery queue.
    ///
    /// A slow subscriber whose queue is full loses the overflowing QoS-0
    /// messages; publishers are never blocked by it.
    ///
    /// Default is 1000.
    #[serde(default = "General::default_best_effort_queue_capacity")]
    best_effort_queue_capacity: usize,

    /// Per-session bound of the QoS 1/2 delivery queue.
    ///
    /// Overflowing this queue kills the session, so it should cover the
    /// expected burst size of guaranteed traffic.
    ///
    /// Default is 1000.
    #[serde(default = "General::default_guaranteed_queue_capacity")]
    guaranteed_queue_capacity: usize,
}

impl General {
    #[must_use]
    pub const fn default_maximum_qos() -> u8 {
        2
    }

    #[must_use]
    pub const fn default_best_effort_queue_capacity() -> usize {
        1000
    }

    #[must_use]
    pub const fn default_guaranteed_queue_capacity() -> usize {
        1000
    }

    #[must_use]
    pub const fn maximum_qos(&self) -> u8 {
        self.maximum_qos
    }

    #[must_use]
    pub const fn best_effort_queue_capacity(&self) -> usize {
        self.best_effort_queue_capacity
    }

    #[must_use]
    pub const fn guaranteed_queue_capacity(&self) -> usize {
        self.guaranteed_queue_capacity
    }

    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            maximum_qos: self.maximum_qos_level(),
            best_effort_queue_capacity: self.best_effort_queue_capacity,
            guaranteed_queue_capacity: self.guaranteed_queue_capacity,
        }
    }

    #[must_use]
    pub fn maximum_qos_level(&self) -> QualityOfService {
        qos_from_u8(self.maximum_qos)
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some option is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.maximum_qos > 2 {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("Invalid maximum_qos: {}", self.maximum_qos),
            ));
        }
        if self.best_effort_queue_capacity == 0 || self.guaranteed_queue_capacity == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "Queue capacities must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            maximum_qos: Self::default_maximum_qos(),
            best_effort_queue_capacity: Self::default_best_effort_queue_capacity(),
            guaranteed_queue_capacity: Self::default_guaranteed_queue_capacity(),
        }
    }
}
