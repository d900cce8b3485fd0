//! Connection assembly: one duplex channel, one session, one dispatcher.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wsstomp_core::{ConnectionId, DEFAULT_MAX_FRAME_BYTES, StompCodec};

use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::duplex::{self, DEFAULT_QUEUE_CAPACITY, TransportEnd};
use crate::policy::SessionPolicy;
use crate::router::DestinationRouter;
use crate::session::{DEFAULT_OUTBOX_CAPACITY, Session, SessionOutcome};

/// Queue sizes and limits applied to every connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Chunks buffered in each direction of the duplex channel.
    pub queue_capacity: usize,
    /// Requests buffered between a session and its dispatcher.
    pub request_capacity: usize,
    /// Frames buffered for a session's writer.
    pub outbox_capacity: usize,
    /// Largest accepted frame in bytes.
    pub max_frame_bytes: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_capacity: 128,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// What happened to a connection, available once it has fully torn down.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionReport {
    /// Connection identity.
    pub id: ConnectionId,
    /// How the session ended.
    #[serde(serialize_with = "serialize_outcome")]
    pub outcome: SessionOutcome,
    /// Dispatcher counters.
    pub summary: DispatchSummary,
}

fn serialize_outcome<S: serde::Serializer>(outcome: &SessionOutcome, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(outcome.as_str())
}

/// A freshly accepted connection, seen from the transport side.
pub struct Connection {
    /// Connection identity.
    pub id: ConnectionId,
    /// Ends for the inbound and outbound pumps.
    pub transport: TransportEnd,
    /// Resolves when the session and dispatcher have both finished.
    pub task: JoinHandle<ConnectionReport>,
}

/// Shared broker state plus the recipe for new connections.
#[derive(Clone, Debug)]
pub struct Broker {
    router: Arc<DestinationRouter>,
    policy: SessionPolicy,
    settings: BrokerSettings,
    cancel: CancellationToken,
}

impl Broker {
    /// Broker routing through `router`.
    pub fn new(router: Arc<DestinationRouter>, policy: SessionPolicy, settings: BrokerSettings) -> Self {
        Self {
            router,
            policy,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel every session when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Shared destination router.
    pub fn router(&self) -> &Arc<DestinationRouter> {
        &self.router
    }

    /// Per-connection limits.
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Create a duplex channel and start a session on its stream end.
    pub fn connect(&self) -> Connection {
        let (stream, transport) = duplex::channel(self.settings.queue_capacity);
        let (id, task) = self.attach(stream);
        Connection { id, transport, task }
    }

    /// Start a session and dispatcher over an arbitrary byte stream.
    pub fn attach<S>(&self, stream: S) -> (ConnectionId, JoinHandle<ConnectionReport>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = ConnectionId::new();
        let (requests_tx, requests_rx) = mpsc::channel(self.settings.request_capacity.max(1));
        let session = Session::new(id.clone(), stream, self.policy.clone(), requests_tx)
            .with_codec(StompCodec::new(self.settings.max_frame_bytes))
            .with_outbox_capacity(self.settings.outbox_capacity)
            .with_cancellation(self.cancel.child_token());
        let dispatcher = Dispatcher::new(id.clone(), Arc::clone(&self.router));

        let report_id = id.clone();
        let task = tokio::spawn(async move {
            let dispatch = tokio::spawn(dispatcher.run(requests_rx));
            let outcome = session.run().await;
            let summary = dispatch.await.unwrap_or_else(|err| {
                warn!(connection_id = %report_id, error = %err, "dispatcher task failed");
                DispatchSummary::default()
            });
            info!(connection_id = %report_id, outcome = outcome.as_str(), "connection closed");
            ConnectionReport {
                id: report_id,
                outcome,
                summary,
            }
        });
        (id, task)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(
            Arc::new(DestinationRouter::default()),
            SessionPolicy::default(),
            BrokerSettings::default(),
        )
    }
}
