//! Subscription table and routing snapshots.
//!
//! Maps exact-match topic strings to subscriber identities and back.
//! Both directions live under one lock so they can never disagree:
//! a client is in a topic's subscriber set exactly when the topic is in
//! that client's topic set.
//!
//! The lock is only ever held for map mutation or snapshotting - never
//! across a network write. Fan-out callers take a snapshot of the
//! subscriber set, release the lock, and deliver from the snapshot.

use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    /// Topic -> subscribed client identities. A key exists only while
    /// its set is non-empty.
    by_topic: HashMap<String, HashSet<String>>,
    /// Client identity -> subscribed topics.
    by_client: HashMap<String, HashSet<String>>,
}

/// Shared topic -> subscribers routing structure.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    inner: Mutex<Tables>,
}

impl SubscriptionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently subscribe a client to a topic.
    ///
    /// Returns `true` if the membership was newly added.
    pub async fn subscribe(&self, client_id: &str, topic: &str) -> bool {
        let mut tables = self.inner.lock().await;
        let newly_added = tables
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .insert(client_id.to_string());
        tables
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(topic.to_string());

        if newly_added {
            debug!(
                target: "relay.topics",
                client_id = %client_id,
                topic = %topic,
                "Subscription added"
            );
        }
        newly_added
    }

    /// Snapshot the subscribers of a topic, excluding the origin.
    ///
    /// The returned identities are a point-in-time copy; the lock is
    /// released before the caller delivers anything.
    pub async fn subscribers_excluding(&self, topic: &str, origin: &str) -> Vec<String> {
        let tables = self.inner.lock().await;
        tables
            .by_topic
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|id| id.as_str() != origin)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot all subscribers of a topic.
    pub async fn subscribers(&self, topic: &str) -> Vec<String> {
        let tables = self.inner.lock().await;
        tables
            .by_topic
            .get(topic)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a client from every topic it subscribed to, deleting
    /// topics whose subscriber set becomes empty.
    ///
    /// Called exactly once per session, from its Closed transition.
    pub async fn remove_session(&self, client_id: &str) {
        let mut tables = self.inner.lock().await;
        let Some(topics) = tables.by_client.remove(client_id) else {
            return;
        };

        for topic in &topics {
            let emptied = match tables.by_topic.get_mut(topic) {
                Some(subscribers) => {
                    subscribers.remove(client_id);
                    subscribers.is_empty()
                }
                None => false,
            };
            if emptied {
                tables.by_topic.remove(topic);
                debug!(
                    target: "relay.topics",
                    topic = %topic,
                    "Topic removed, last subscriber gone"
                );
            }
        }
    }

    /// All topics with at least one subscriber.
    pub async fn topics(&self) -> Vec<String> {
        let tables = self.inner.lock().await;
        tables.by_topic.keys().cloned().collect()
    }

    /// Number of subscribers of a topic (0 if the topic is unknown).
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let tables = self.inner.lock().await;
        tables.by_topic.get(topic).map_or(0, HashSet::len)
    }

    /// Verify bidirectional consistency between the two maps.
    #[cfg(test)]
    pub async fn is_consistent(&self) -> bool {
        let tables = self.inner.lock().await;

        let forward_holds = tables.by_topic.iter().all(|(topic, subscribers)| {
            !subscribers.is_empty()
                && subscribers.iter().all(|client| {
                    tables
                        .by_client
                        .get(client)
                        .is_some_and(|topics| topics.contains(topic))
                })
        });

        let reverse_holds = tables.by_client.iter().all(|(client, topics)| {
            topics.iter().all(|topic| {
                tables
                    .by_topic
                    .get(topic)
                    .is_some_and(|subscribers| subscribers.contains(client))
            })
        });

        forward_holds && reverse_holds
    }
}
