//! Destination registry and per-topic fan-out.
//!
//! The registry is a `DashMap` so lookups for different destinations do not
//! contend; each [`Topic`] guards its own subscriber set. Nothing ever holds
//! two topic locks at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use wsstomp_core::{ConnectionId, Frame};

use crate::request::{Outbox, Subscription};

/// What happens to topics nobody is subscribed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicRetention {
    /// Topics live as long as the process.
    #[default]
    Forever,
    /// A periodic sweep drops topics with no subscribers.
    ReclaimEmpty,
}

type SubscriptionKey = (ConnectionId, String);

/// Subscribers of exactly one destination.
#[derive(Debug)]
pub struct Topic {
    name: String,
    subscribers: Mutex<HashMap<SubscriptionKey, Subscription>>,
}

impl Topic {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Destination name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `sub`, replacing any subscription with the same connection and id.
    /// Returns the replaced subscription.
    pub fn subscribe(&self, sub: Subscription) -> Option<Subscription> {
        let key = (sub.connection.clone(), sub.id.clone());
        self.subscribers.lock().insert(key, sub)
    }

    /// Remove by connection and id. Absent subscriptions are a no-op.
    pub fn unsubscribe(&self, sub: &Subscription) -> Option<Subscription> {
        self.subscribers
            .lock()
            .remove(&(sub.connection.clone(), sub.id.clone()))
    }

    /// Drop every subscription belonging to `connection`; returns how many.
    pub fn remove_connection(&self, connection: &ConnectionId) -> usize {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(conn, _), _| conn != connection);
        before - subscribers.len()
    }

    /// Whether `connection` holds subscription `id` here.
    pub fn is_subscribed(&self, connection: &ConnectionId, id: &str) -> bool {
        self.subscribers
            .lock()
            .contains_key(&(connection.clone(), id.to_owned()))
    }

    /// Current number of subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `frame` as a MESSAGE to every current subscriber.
    ///
    /// Subscribers are snapshotted under the lock and delivered to outside
    /// it, so a slow subscriber stalls this publisher but never the topic.
    /// Subscribers whose session already stopped are skipped. Returns the
    /// number of successful deliveries.
    pub async fn enqueue(&self, frame: &Frame) -> usize {
        let targets: Vec<(String, Outbox)> = self
            .subscribers
            .lock()
            .values()
            .map(|sub| (sub.id.clone(), sub.outbox.clone()))
            .collect();

        let mut delivered = 0;
        for (id, outbox) in targets {
            match outbox.deliver(Frame::message_for(frame, &id)).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::debug!(destination = %self.name, subscription = %id, "skipping closed subscriber");
                }
            }
        }
        delivered
    }
}

/// Shared map from destination name to [`Topic`].
#[derive(Debug, Default)]
pub struct DestinationRouter {
    topics: DashMap<String, Arc<Topic>>,
    retention: TopicRetention,
}

impl DestinationRouter {
    /// Empty router with the given retention policy.
    pub fn new(retention: TopicRetention) -> Self {
        Self {
            topics: DashMap::new(),
            retention,
        }
    }

    /// Topic for `destination`, created empty on first use.
    pub fn find(&self, destination: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.get(destination) {
            return Arc::clone(topic.value());
        }
        let topic = self
            .topics
            .entry(destination.to_owned())
            .or_insert_with(|| Arc::new(Topic::new(destination)));
        Arc::clone(topic.value())
    }

    /// Topic for `destination` if it already exists.
    pub fn get(&self, destination: &str) -> Option<Arc<Topic>> {
        self.topics.get(destination).map(|t| Arc::clone(t.value()))
    }

    /// Number of registered topics.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Total subscriptions across all topics.
    pub fn subscription_count(&self) -> usize {
        self.topics.iter().map(|t| t.subscriber_count()).sum()
    }

    /// Configured retention policy.
    pub fn retention(&self) -> TopicRetention {
        self.retention
    }

    /// Drop topics with no subscribers that nobody else holds a handle to.
    /// Returns how many were removed.
    pub fn reclaim_empty(&self) -> usize {
        let before = self.topics.len();
        self.topics
            .retain(|_, topic| Arc::strong_count(topic) > 1 || topic.subscriber_count() > 0);
        before.saturating_sub(self.topics.len())
    }

    /// Periodically reclaim empty topics until `cancel` fires.
    ///
    /// Returns `None` under [`TopicRetention::Forever`].
    pub fn start_reclaim_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.retention != TopicRetention::ReclaimEmpty {
            return None;
        }
        let router = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = router.reclaim_empty();
                        if removed > 0 {
                            tracing::info!(removed, "reclaimed empty topics");
                        }
                    }
                }
            }
        }))
    }
}
