// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Session registry and publish routing.

use std::collections::HashMap;
use std::sync::Arc;

use mqtt::packet::suback::SubscribeReturnCode;
use mqtt::{QualityOfService, TopicFilter};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::message::Message;
use crate::session::{ConnectionHandle, Session};
use crate::store::{CachedSession, MemoryStore, SessionStore};
use crate::trie::SubTrie;
use crate::types::{min_qos, SessionKey};

/// Knobs the registry needs from the `[general]` config table.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub maximum_qos: QualityOfService,
    pub best_effort_queue_capacity: usize,
    pub guaranteed_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            maximum_qos: QualityOfService::Level2,
            best_effort_queue_capacity: 1000,
            guaranteed_queue_capacity: 1000,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_key: SessionKey,
    sessions: HashMap<SessionKey, Arc<Session>>,
    client_ids: HashMap<String, SessionKey>,
    trie: SubTrie,
}

/// Cheaply cloneable handle to the broker state.
///
/// The registry mutex is held briefly and never across an await; anything
/// which must wait (connection wind-down, queue drains) happens outside it.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    registry: Mutex<Registry>,
    store: Arc<dyn SessionStore>,
}

impl Broker {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    #[must_use]
    pub fn with_store(config: BrokerConfig, store: Arc<dyn SessionStore>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                registry: Mutex::new(Registry::default()),
                store,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Locate or create the session for `client_id` and bind `handle` to it.
    ///
    /// A clean-session connect destroys any prior session for the id first.
    /// Any connection group previously bound to the surviving session is
    /// cancelled and its wind-down awaited before this returns, so the
    /// caller holds the only live binding.
    ///
    /// # Errors
    ///
    /// Returns error if the session store fails.
    pub async fn open_session(
        &self,
        client_id: &str,
        clean_session: bool,
        will: Option<Message>,
        handle: ConnectionHandle,
    ) -> Result<(Arc<Session>, bool), Error> {
        let cached = if clean_session {
            self.inner.store.delete(client_id).await?;
            None
        } else {
            self.inner.store.load(client_id).await?
        };

        let mut evicted = None;
        let (session, session_present) = {
            let mut registry = self.inner.registry.lock().await;

            if clean_session {
                if let Some(old_key) = registry.client_ids.remove(client_id) {
                    registry.trie.remove_session(old_key);
                    if let Some(old) = registry.sessions.remove(&old_key) {
                        evicted = old.state().await.connection.take();
                    }
                }
            }

            match registry.client_ids.get(client_id).copied() {
                Some(key) => {
                    let session = Arc::clone(&registry.sessions[&key]);
                    let mut state = session.state().await;
                    state.will = will;
                    evicted = state.connection.replace(handle);
                    drop(state);
                    (session, true)
                }
                None => {
                    registry.next_key += 1;
                    let key = registry.next_key;
                    let session = Arc::new(Session::new(
                        key,
                        client_id,
                        clean_session,
                        self.inner.config.best_effort_queue_capacity,
                        self.inner.config.guaranteed_queue_capacity,
                    ));
                    let mut session_present = false;
                    let mut state = session.state().await;
                    state.will = will;
                    state.connection = Some(handle);
                    if let Some(cached) = cached {
                        for (filter, qos) in cached.subscriptions() {
                            state.subscriptions.insert(filter.clone(), *qos);
                            registry.trie.subscribe(filter, key, *qos);
                        }
                        session_present = true;
                    }
                    drop(state);
                    registry.sessions.insert(key, Arc::clone(&session));
                    registry.client_ids.insert(client_id.to_owned(), key);
                    (session, session_present)
                }
            }
        };

        if let Some(old) = evicted {
            log::info!(
                "broker: Session takeover for client id: {client_id}, cancelling connection {:?}",
                old.id()
            );
            old.cancel().await;
        }

        Ok((session, session_present))
    }

    /// Remove a session from the registry and the trie, and drop its stored
    /// snapshot.
    pub async fn close_session(&self, key: SessionKey) {
        let session = {
            let mut registry = self.inner.registry.lock().await;
            registry.trie.remove_session(key);
            let session = registry.sessions.remove(&key);
            if let Some(session) = &session {
                registry.client_ids.remove(session.client_id());
            }
            session
        };
        if let Some(session) = session {
            if let Err(err) = self.inner.store.delete(session.client_id()).await {
                log::error!("broker: Failed to delete stored session: {err}");
            }
        }
    }

    /// Snapshot a detached persistent session into the store.
    pub async fn save_session(&self, session: &Session) {
        let subscriptions: Vec<(String, QualityOfService)> = {
            let state = session.state().await;
            state
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter.clone(), *qos))
                .collect()
        };
        let cached = CachedSession::new(session.client_id().to_owned(), subscriptions);
        if let Err(err) = self.inner.store.save(cached).await {
            log::error!("broker: Failed to save session snapshot: {err}");
        }
    }

    /// Kill a session whose guaranteed queue overflowed: drop it from the
    /// registry and cancel its connection group without waiting, since the
    /// caller may be running inside that very group.
    pub async fn terminate_session(&self, session: &Arc<Session>) {
        log::warn!(
            "broker: Terminating session {} of client id: {}",
            session.key(),
            session.client_id()
        );
        self.close_session(session.key()).await;
        let mut state = session.state().await;
        state.terminated = true;
        if let Some(handle) = state.connection.take() {
            handle.cancel_detached();
        }
    }

    /// Record subscriptions in the trie and the session, granting at most
    /// the broker maximum per filter.
    pub async fn subscribe(
        &self,
        session: &Arc<Session>,
        topics: &[(TopicFilter, QualityOfService)],
    ) -> Vec<SubscribeReturnCode> {
        let mut registry = self.inner.registry.lock().await;
        let mut state = session.state().await;
        let mut grants = Vec::with_capacity(topics.len());
        for (filter, qos) in topics {
            let granted = min_qos(*qos, self.inner.config.maximum_qos);
            registry.trie.subscribe(filter, session.key(), granted);
            state.subscriptions.insert(filter.to_string(), granted);
            grants.push(match granted {
                QualityOfService::Level0 => SubscribeReturnCode::MaximumQoSLevel0,
                QualityOfService::Level1 => SubscribeReturnCode::MaximumQoSLevel1,
                QualityOfService::Level2 => SubscribeReturnCode::MaximumQoSLevel2,
            });
        }
        grants
    }

    /// Drop subscriptions from the trie and the session.
    pub async fn unsubscribe(&self, session: &Arc<Session>, topics: &[TopicFilter]) {
        let mut registry = self.inner.registry.lock().await;
        let mut state = session.state().await;
        for filter in topics {
            registry.trie.unsubscribe(filter, session.key());
            state.subscriptions.remove(&filter.to_string());
        }
    }

    /// Fan a message out to every matching session.
    ///
    /// Best-effort and non-atomic: a full best-effort queue drops the copy
    /// for that session only, a full guaranteed queue terminates that
    /// session only.
    pub async fn publish(&self, message: Message) {
        let targets: Vec<(Arc<Session>, QualityOfService)> = {
            let registry = self.inner.registry.lock().await;
            registry
                .trie
                .matches(message.topic())
                .into_iter()
                .filter_map(|(key, granted)| {
                    registry
                        .sessions
                        .get(&key)
                        .map(|session| (Arc::clone(session), granted))
                })
                .collect()
        };

        let mut doomed = Vec::new();
        for (session, granted) in targets {
            let mut copy = message.clone();
            copy.set_qos(min_qos(message.qos(), granted));
            copy.set_dup(false);
            // The retain flag is zero on packets forwarded to an
            // established subscription [MQTT-3.3.1-9].
            copy.set_retain(false);
            if session.enqueue(copy).is_err() {
                doomed.push(session);
            }
        }
        for session in doomed {
            self.terminate_session(&session).await;
        }
    }

    /// Whether a session for `client_id` currently exists.
    pub async fn has_session(&self, client_id: &str) -> bool {
        self.inner
            .registry
            .lock()
            .await
            .client_ids
            .contains_key(client_id)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.registry.lock().await.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, tokio::sync::watch::Sender<bool>) {
        let stop = std::sync::Arc::new(tokio::sync::Notify::new());
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        (
            ConnectionHandle::new(crate::types::ConnectionId::new(0, 1), stop, done_rx),
            done_tx,
        )
    }

    #[tokio::test]
    async fn test_clean_session_destroys_prior_state() {
        let broker = Broker::new(BrokerConfig::default());
        let (first, _guard1) = handle();
        let (session, present) = broker.open_session("c", false, None, first).await.unwrap();
        assert!(!present);
        let filter = TopicFilter::new("a/#".to_owned()).unwrap();
        broker
            .subscribe(&session, &[(filter, QualityOfService::Level1)])
            .await;
        session.state().await.connection = None;

        let (second, _guard2) = handle();
        let (_session, present) = broker.open_session("c", true, None, second).await.unwrap();
        assert!(!present);
        broker
            .publish(Message::new("a/b", QualityOfService::Level0, Vec::new()).unwrap())
            .await;
        assert_eq!(broker.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_persistent_session_resumes() {
        let broker = Broker::new(BrokerConfig::default());
        let (first, _guard1) = handle();
        let (session, present) = broker.open_session("c", false, None, first).await.unwrap();
        assert!(!present);
        session.state().await.connection = None;

        let (second, _guard2) = handle();
        let (resumed, present) = broker.open_session("c", false, None, second).await.unwrap();
        assert!(present);
        assert_eq!(resumed.key(), session.key());
    }

    #[tokio::test]
    async fn test_subscribe_grants_broker_maximum() {
        let config = BrokerConfig {
            maximum_qos: QualityOfService::Level1,
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config);
        let (first, _guard) = handle();
        let (session, _present) = broker.open_session("c", true, None, first).await.unwrap();
        let filter = TopicFilter::new("a".to_owned()).unwrap();
        let grants = broker
            .subscribe(&session, &[(filter, QualityOfService::Level2)])
            .await;
        assert!(matches!(grants[0], SubscribeReturnCode::MaximumQoSLevel1));
    }

    #[tokio::test]
    async fn test_overflow_terminates_only_the_full_session() {
        let config = BrokerConfig {
            guaranteed_queue_capacity: 1,
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config);
        let (first, _guard1) = handle();
        let (slow, _present) = broker.open_session("slow", false, None, first).await.unwrap();
        let (second, _guard2) = handle();
        let (healthy, _present) = broker
            .open_session("healthy", false, None, second)
            .await
            .unwrap();
        let filter = TopicFilter::new("t".to_owned()).unwrap();
        broker
            .subscribe(&slow, &[(filter.clone(), QualityOfService::Level1)])
            .await;
        broker
            .subscribe(&healthy, &[(filter, QualityOfService::Level1)])
            .await;

        for _ in 0..3 {
            broker
                .publish(Message::new("t", QualityOfService::Level1, Vec::new()).unwrap())
                .await;
            // Keep the healthy session draining.
            let mut state = healthy.state().await;
            let rx = state.guaranteed_rx.as_mut().unwrap();
            let _drained = rx.try_recv();
        }

        assert!(!broker.has_session("slow").await);
        assert!(broker.has_session("healthy").await);
        assert!(slow.state().await.terminated);
    }
}
