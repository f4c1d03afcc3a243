//! # Subscription Table
//!
//! Tracks which topics the local node is subscribed to and which remote
//! peers have announced subscriptions for each topic. A topic record exists
//! only while someone is interested in it: it is created on the first local
//! subscribe or remote announcement and dropped when the last interest goes
//! away.

use std::collections::{HashMap, HashSet};

use crate::identity::Identity;

#[derive(Default)]
pub struct SubscriptionTable {
    /// Topics the local node is subscribed to.
    local: HashSet<String>,
    /// Per-topic remote subscribers.
    topics: HashMap<String, HashSet<Identity>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark local interest in a topic. Returns false if already subscribed.
    pub fn subscribe(&mut self, topic: &str) -> bool {
        let changed = self.local.insert(topic.to_string());
        if changed {
            self.topics.entry(topic.to_string()).or_default();
        }
        changed
    }

    /// Drop local interest in a topic. Returns false if not subscribed.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        let changed = self.local.remove(topic);
        if changed {
            self.gc_topic(topic);
        }
        changed
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.local.contains(topic)
    }

    pub fn local_topics(&self) -> impl Iterator<Item = &str> {
        self.local.iter().map(String::as_str)
    }

    /// Record a remote peer's subscription announcement.
    /// Returns true if the peer's state for the topic actually changed.
    pub fn on_peer_announcement(&mut self, peer: Identity, topic: &str, subscribed: bool) -> bool {
        if subscribed {
            self.topics
                .entry(topic.to_string())
                .or_default()
                .insert(peer)
        } else {
            let changed = match self.topics.get_mut(topic) {
                Some(subscribers) => subscribers.remove(&peer),
                None => false,
            };
            if changed {
                self.gc_topic(topic);
            }
            changed
        }
    }

    /// Remote subscribers of a topic.
    pub fn subscribers(&self, topic: &str) -> impl Iterator<Item = &Identity> {
        self.topics.get(topic).into_iter().flatten()
    }

    pub fn is_subscriber(&self, topic: &str, peer: &Identity) -> bool {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.contains(peer))
            .unwrap_or(false)
    }

    /// Remove a departed peer from every topic. Returns the topics it was
    /// subscribed to.
    pub fn remove_peer(&mut self, peer: &Identity) -> Vec<String> {
        let mut affected = Vec::new();
        for (topic, subscribers) in &mut self.topics {
            if subscribers.remove(peer) {
                affected.push(topic.clone());
            }
        }
        for topic in &affected {
            self.gc_topic(topic);
        }
        affected
    }

    /// Drop the topic record once nobody local or remote is interested.
    fn gc_topic(&mut self, topic: &str) {
        if self.local.contains(topic) {
            return;
        }
        let empty = self
            .topics
            .get(topic)
            .map(|subscribers| subscribers.is_empty())
            .unwrap_or(false);
        if empty {
            self.topics.remove(topic);
        }
    }

    #[cfg(test)]
    fn has_topic_record(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> Identity {
        Identity::from([byte; 32])
    }

    #[test]
    fn local_subscribe_is_idempotent() {
        let mut table = SubscriptionTable::new();
        assert!(table.subscribe("news"));
        assert!(!table.subscribe("news"));
        assert!(table.is_subscribed("news"));

        assert!(table.unsubscribe("news"));
        assert!(!table.unsubscribe("news"));
        assert!(!table.is_subscribed("news"));
    }

    #[test]
    fn peer_announcements_update_subscribers() {
        let mut table = SubscriptionTable::new();
        assert!(table.on_peer_announcement(peer(1), "news", true));
        assert!(!table.on_peer_announcement(peer(1), "news", true));
        assert!(table.is_subscriber("news", &peer(1)));

        assert!(table.on_peer_announcement(peer(1), "news", false));
        assert!(!table.on_peer_announcement(peer(1), "news", false));
        assert!(!table.is_subscriber("news", &peer(1)));
    }

    #[test]
    fn topic_record_lifecycle() {
        let mut table = SubscriptionTable::new();

        // Created by a remote announcement, destroyed when the peer leaves.
        table.on_peer_announcement(peer(1), "news", true);
        assert!(table.has_topic_record("news"));
        table.on_peer_announcement(peer(1), "news", false);
        assert!(!table.has_topic_record("news"));

        // A local subscription keeps the record alive without subscribers.
        table.subscribe("news");
        table.on_peer_announcement(peer(1), "news", true);
        table.on_peer_announcement(peer(1), "news", false);
        assert!(table.has_topic_record("news"));
        table.unsubscribe("news");
        assert!(!table.has_topic_record("news"));
    }

    #[test]
    fn remove_peer_reports_affected_topics() {
        let mut table = SubscriptionTable::new();
        table.on_peer_announcement(peer(1), "a", true);
        table.on_peer_announcement(peer(1), "b", true);
        table.on_peer_announcement(peer(2), "b", true);

        let mut affected = table.remove_peer(&peer(1));
        affected.sort();
        assert_eq!(affected, vec!["a".to_string(), "b".to_string()]);

        assert!(!table.has_topic_record("a"));
        assert!(table.is_subscriber("b", &peer(2)));
    }

    #[test]
    fn subscribers_iterates_current_set() {
        let mut table = SubscriptionTable::new();
        table.on_peer_announcement(peer(1), "news", true);
        table.on_peer_announcement(peer(2), "news", true);

        let subs: HashSet<Identity> = table.subscribers("news").copied().collect();
        assert_eq!(subs.len(), 2);
        assert!(subs.contains(&peer(1)));
        assert!(subs.contains(&peer(2)));

        assert_eq!(table.subscribers("absent").count(), 0);
    }
}
