// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Durability seam for persistent sessions.
//!
//! Only the in-memory store ships; the trait is the hook for real backends.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use mqtt::QualityOfService;

use crate::error::Error;

/// Snapshot of the restorable part of a persistent session.
///
/// In-flight maps and queues stay inside the live registry; what a store
/// keeps is the part which must survive a broker process, which for MQTT
/// 3.1.1 is the subscription set.
#[derive(Debug, Clone)]
pub struct CachedSession {
    client_id: String,
    subscriptions: Vec<(String, QualityOfService)>,
}

impl CachedSession {
    #[must_use]
    pub const fn new(client_id: String, subscriptions: Vec<(String, QualityOfService)>) -> Self {
        Self {
            client_id,
            subscriptions,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn subscriptions(&self) -> &[(String, QualityOfService)] {
        &self.subscriptions
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the stored session for `client_id`, if any.
    async fn load(&self, client_id: &str) -> Result<Option<CachedSession>, Error>;

    /// Persist a snapshot, replacing any previous one for the client id.
    async fn save(&self, session: CachedSession) -> Result<(), Error>;

    /// Forget the stored session for `client_id`.
    async fn delete(&self, client_id: &str) -> Result<(), Error>;
}

/// Process-local store; contents die with the broker.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, CachedSession>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, client_id: &str) -> Result<Option<CachedSession>, Error> {
        Ok(self.sessions.lock().unwrap().get(client_id).cloned())
    }

    async fn save(&self, session: CachedSession) -> Result<(), Error> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.client_id().to_owned(), session);
        Ok(())
    }

    async fn delete(&self, client_id: &str) -> Result<(), Error> {
        self.sessions.lock().unwrap().remove(client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load("c").await.unwrap().is_none());

        let cached = CachedSession::new(
            "c".to_owned(),
            vec![("a/#".to_owned(), QualityOfService::Level1)],
        );
        store.save(cached).await.unwrap();
        let loaded = store.load("c").await.unwrap().unwrap();
        assert_eq!(loaded.subscriptions().len(), 1);

        store.delete("c").await.unwrap();
        assert!(store.load("c").await.unwrap().is_none());
    }
}
