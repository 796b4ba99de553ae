// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Manage subscription trie.

use std::collections::HashMap;

use mqtt::QualityOfService;

use crate::types::SessionKey;

const MULTI_WILDCARD: &str = "#";
const SINGLE_WILDCARD: &str = "+";

/// Topics whose first level starts with `$` are reserved for the server and
/// are only matched by filters naming that level literally.
const INTERNAL_PREFIX: char = '$';

/// Maps topic filters to the sessions subscribed to them.
///
/// Filter levels become trie nodes; the `+` and `#` wildcards are ordinary
/// child keys since neither may appear in a topic name. Each node carries the
/// sessions whose filter terminates there, together with the granted QoS.
#[derive(Debug, Default, Clone)]
pub struct SubTrie {
    root: TrieNode,
}

#[derive(Debug, Default, Clone)]
struct TrieNode {
    subscribers: HashMap<SessionKey, QualityOfService>,
    children: HashMap<String, TrieNode>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty()
    }
}

impl SubTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription of `key` to `filter` with the granted QoS.
    ///
    /// Subscribing twice to the same filter collapses to one entry carrying
    /// the most recently granted QoS [MQTT-3.8.4-3].
    pub fn subscribe(&mut self, filter: &str, key: SessionKey, qos: QualityOfService) {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.children.entry(level.to_owned()).or_default();
        }
        node.subscribers.insert(key, qos);
    }

    /// Drop the subscription of `key` to `filter`, pruning nodes which became
    /// empty and childless. Returns false if no such subscription existed.
    pub fn unsubscribe(&mut self, filter: &str, key: SessionKey) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        remove_at(&mut self.root, &levels, key)
    }

    /// Drop every subscription of `key`, used when its session dies.
    pub fn remove_session(&mut self, key: SessionKey) {
        purge(&mut self.root, key);
    }

    /// Collect all sessions whose filters match `topic`, with the granted
    /// QoS. When several filters of one session match, the highest grant
    /// wins. No ordering guarantee.
    #[must_use]
    pub fn matches(&self, topic: &str) -> HashMap<SessionKey, QualityOfService> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut found = HashMap::new();
        collect(&self.root, &levels, 0, &mut found);
        found
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

fn remove_at(node: &mut TrieNode, levels: &[&str], key: SessionKey) -> bool {
    match levels.split_first() {
        None => node.subscribers.remove(&key).is_some(),
        Some((level, rest)) => {
            let Some(child) = node.children.get_mut(*level) else {
                return false;
            };
            let removed = remove_at(child, rest, key);
            if child.is_empty() {
                node.children.remove(*level);
            }
            removed
        }
    }
}

fn purge(node: &mut TrieNode, key: SessionKey) {
    node.subscribers.remove(&key);
    node.children.retain(|_level, child| {
        purge(child, key);
        !child.is_empty()
    });
}

fn grant(found: &mut HashMap<SessionKey, QualityOfService>, node: &TrieNode) {
    for (key, qos) in &node.subscribers {
        found
            .entry(*key)
            .and_modify(|granted| {
                if (*qos as u8) > (*granted as u8) {
                    *granted = *qos;
                }
            })
            .or_insert(*qos);
    }
}

fn collect(
    node: &TrieNode,
    levels: &[&str],
    index: usize,
    found: &mut HashMap<SessionKey, QualityOfService>,
) {
    // Wildcards never match an internal topic at the root [MQTT-4.7.2-1].
    let internal = index == 0
        && levels
            .first()
            .is_some_and(|level| level.starts_with(INTERNAL_PREFIX));

    if !internal {
        // `sport/#` also matches `sport` itself: the parent of a `#` node is
        // part of the filter's coverage [MQTT-4.7.1-2].
        if let Some(multi) = node.children.get(MULTI_WILDCARD) {
            grant(found, multi);
        }
    }

    let Some(level) = levels.get(index) else {
        grant(found, node);
        return;
    };

    if let Some(child) = node.children.get(*level) {
        collect(child, levels, index + 1, found);
    }
    if !internal {
        if let Some(single) = node.children.get(SINGLE_WILDCARD) {
            collect(single, levels, index + 1, found);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q0: QualityOfService = QualityOfService::Level0;
    const Q1: QualityOfService = QualityOfService::Level1;
    const Q2: QualityOfService = QualityOfService::Level2;

    fn keys(trie: &SubTrie, topic: &str) -> Vec<SessionKey> {
        let mut found: Vec<SessionKey> = trie.matches(topic).into_keys().collect();
        found.sort_unstable();
        found
    }

    #[test]
    fn test_literal_match() {
        let mut trie = SubTrie::new();
        trie.subscribe("sport/tennis", 1, Q0);
        assert_eq!(keys(&trie, "sport/tennis"), vec![1]);
        assert!(keys(&trie, "sport").is_empty());
        assert!(keys(&trie, "sport/tennis/player").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = SubTrie::new();
        trie.subscribe("a/+", 1, Q0);
        trie.subscribe("+/b", 2, Q0);
        assert_eq!(keys(&trie, "a/b"), vec![1, 2]);
        assert_eq!(keys(&trie, "a/c"), vec![1]);
        assert_eq!(keys(&trie, "x/b"), vec![2]);
        assert!(keys(&trie, "a/b/c").is_empty());
        assert!(keys(&trie, "a").is_empty());
    }

    #[test]
    fn test_multi_wildcard() {
        let mut trie = SubTrie::new();
        trie.subscribe("#", 1, Q0);
        trie.subscribe("sport/#", 2, Q0);
        assert_eq!(keys(&trie, "sport/tennis/player"), vec![1, 2]);
        // The level preceding `#` is matched by the filter as well.
        assert_eq!(keys(&trie, "sport"), vec![1, 2]);
        assert_eq!(keys(&trie, "other"), vec![1]);
    }

    #[test]
    fn test_internal_topics_excluded_from_root_wildcards() {
        let mut trie = SubTrie::new();
        trie.subscribe("#", 1, Q0);
        trie.subscribe("+/info", 2, Q0);
        trie.subscribe("$SYS/#", 3, Q0);
        trie.subscribe("$SYS/info", 4, Q0);

        assert_eq!(keys(&trie, "$SYS/info"), vec![3, 4]);
        // Non-root levels of an internal topic still match wildcards.
        assert_eq!(keys(&trie, "$SYS/broker/uptime"), vec![3]);
        assert_eq!(keys(&trie, "host/info"), vec![1, 2]);
    }

    #[test]
    fn test_empty_levels_are_distinct() {
        let mut trie = SubTrie::new();
        trie.subscribe("a//b", 1, Q0);
        assert_eq!(keys(&trie, "a//b"), vec![1]);
        assert!(keys(&trie, "a/b").is_empty());
    }

    #[test]
    fn test_resubscribe_updates_grant() {
        let mut trie = SubTrie::new();
        trie.subscribe("a/b", 1, Q0);
        trie.subscribe("a/b", 1, Q2);
        let found = trie.matches("a/b");
        assert_eq!(found.len(), 1);
        assert_eq!(found[&1], Q2);
    }

    #[test]
    fn test_overlapping_filters_grant_highest() {
        let mut trie = SubTrie::new();
        trie.subscribe("a/#", 1, Q1);
        trie.subscribe("a/b", 1, Q2);
        assert_eq!(trie.matches("a/b")[&1], Q2);
        assert_eq!(trie.matches("a/c")[&1], Q1);
    }

    #[test]
    fn test_unsubscribe_prunes() {
        let mut trie = SubTrie::new();
        trie.subscribe("a/b/c", 1, Q0);
        assert!(trie.unsubscribe("a/b/c", 1));
        assert!(!trie.unsubscribe("a/b/c", 1));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_unsubscribe_keeps_other_sessions() {
        let mut trie = SubTrie::new();
        trie.subscribe("a/b", 1, Q0);
        trie.subscribe("a/b", 2, Q0);
        trie.subscribe("a", 1, Q0);
        assert!(trie.unsubscribe("a/b", 1));
        assert_eq!(keys(&trie, "a/b"), vec![2]);
        assert_eq!(keys(&trie, "a"), vec![1]);
    }

    #[test]
    fn test_remove_session() {
        let mut trie = SubTrie::new();
        trie.subscribe("a/b", 1, Q0);
        trie.subscribe("c/#", 1, Q1);
        trie.subscribe("c/#", 2, Q1);
        trie.remove_session(1);
        assert!(keys(&trie, "a/b").is_empty());
        assert_eq!(keys(&trie, "c/d"), vec![2]);
        trie.remove_session(2);
        assert!(trie.is_empty());
    }
}
