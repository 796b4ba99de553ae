// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use mqtt::QualityOfService;
use rand::Rng;

pub type ListenerId = u32;
pub type SessionKey = u64;
pub type PacketId = u16;

/// Global connection id.
///
/// Basically it is a (listener_id, sequence) pair, so that ids stay unique
/// when multiple listeners hand connections to the same broker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    listener_id: ListenerId,
    seq: u64,
}

impl ConnectionId {
    #[must_use]
    pub const fn new(listener_id: ListenerId, seq: u64) -> Self {
        Self { listener_id, seq }
    }

    #[must_use]
    pub const fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

/// The smaller of two QoS levels.
#[must_use]
pub fn min_qos(lhs: QualityOfService, rhs: QualityOfService) -> QualityOfService {
    if (lhs as u8) <= (rhs as u8) { lhs } else { rhs }
}

#[must_use]
pub fn qos_from_u8(qos: u8) -> QualityOfService {
    match qos {
        1 => QualityOfService::Level1,
        2 => QualityOfService::Level2,
        _ => QualityOfService::Level0,
    }
}

/// Generate a random client id for clients which connect with an empty one.
#[must_use]
pub fn random_client_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..12)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect();
    format!("minato-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_qos() {
        assert_eq!(
            min_qos(QualityOfService::Level2, QualityOfService::Level1),
            QualityOfService::Level1
        );
        assert_eq!(
            min_qos(QualityOfService::Level0, QualityOfService::Level2),
            QualityOfService::Level0
        );
        assert_eq!(
            min_qos(QualityOfService::Level1, QualityOfService::Level1),
            QualityOfService::Level1
        );
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id();
        assert!(id.starts_with("minato-"));
        assert_ne!(id, random_client_id());
    }
}
