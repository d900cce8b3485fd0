//! Per-connection request loop: applies a session's requests to the router.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace};
use wsstomp_core::ConnectionId;

use crate::request::Request;
use crate::router::{DestinationRouter, Topic};

/// Counters for one connection's dispatch loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Subscribe requests applied.
    pub subscribed: usize,
    /// Unsubscribe requests applied.
    pub unsubscribed: usize,
    /// Enqueue requests that named a destination.
    pub enqueued: usize,
    /// MESSAGE frames handed to subscriber outboxes.
    pub delivered: usize,
    /// Enqueue requests dropped for lack of a destination.
    pub dropped: usize,
    /// Subscriptions removed when the connection went away.
    pub cleaned_up: usize,
}

/// Consumes one connection's requests strictly in order.
pub struct Dispatcher {
    connection: ConnectionId,
    router: Arc<DestinationRouter>,
    /// Topic joined under each live subscription id.
    joined: HashMap<String, Arc<Topic>>,
    summary: DispatchSummary,
}

impl Dispatcher {
    /// Dispatcher for `connection` over the shared `router`.
    pub fn new(connection: ConnectionId, router: Arc<DestinationRouter>) -> Self {
        Self {
            connection,
            router,
            joined: HashMap::new(),
            summary: DispatchSummary::default(),
        }
    }

    /// Apply requests until the session drops its sender, then remove every
    /// subscription the connection still holds.
    #[instrument(skip_all, fields(connection_id = %self.connection))]
    pub async fn run(mut self, mut requests: mpsc::Receiver<Request>) -> DispatchSummary {
        while let Some(request) = requests.recv().await {
            self.apply(request).await;
        }
        self.teardown();
        self.summary
    }

    /// Apply a single request.
    pub async fn apply(&mut self, request: Request) {
        trace!(request = request.kind(), "applying request");
        match request {
            Request::Subscribe(sub) => {
                let topic = self.router.find(&sub.destination);
                let id = sub.id.clone();
                let _ = topic.subscribe(sub);
                let _ = self.joined.insert(id, topic);
                self.summary.subscribed += 1;
            }
            Request::Unsubscribe(sub) => {
                let topic = self.router.find(&sub.destination);
                let _ = topic.unsubscribe(&sub);
                if self
                    .joined
                    .get(&sub.id)
                    .is_some_and(|joined| Arc::ptr_eq(joined, &topic))
                {
                    let _ = self.joined.remove(&sub.id);
                }
                self.summary.unsubscribed += 1;
            }
            Request::Enqueue(frame) => {
                let Some(destination) = frame.destination() else {
                    debug!("dropping SEND without destination");
                    self.summary.dropped += 1;
                    return;
                };
                let delivered = self.router.find(destination).enqueue(&frame).await;
                debug!(destination, delivered, "published");
                self.summary.enqueued += 1;
                self.summary.delivered += delivered;
            }
        }
    }

    /// Counters so far.
    pub fn summary(&self) -> DispatchSummary {
        self.summary
    }

    fn teardown(&mut self) {
        for (_, topic) in self.joined.drain() {
            self.summary.cleaned_up += topic.remove_connection(&self.connection);
        }
        if self.summary.cleaned_up > 0 {
            debug!(removed = self.summary.cleaned_up, "removed subscriptions on disconnect");
        }
    }
}
