//! Requests a session hands to its dispatcher, and the outbox deliveries flow through.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::mpsc;
use wsstomp_core::{ConnectionId, Frame};

/// Acknowledgement mode requested on SUBSCRIBE.
///
/// Recorded but not acted upon: delivery is best-effort whatever the mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckMode {
    /// `auto`: a delivered MESSAGE counts as acknowledged.
    #[default]
    Auto,
    /// `client`: cumulative ACK of everything up to the acked message.
    Client,
    /// `client-individual`: each MESSAGE acknowledged on its own.
    ClientIndividual,
}

impl AckMode {
    /// Header spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "client" => Ok(Self::Client),
            "client-individual" => Ok(Self::ClientIndividual),
            other => Err(other.to_owned()),
        }
    }
}

/// Commands for a session's writer task.
#[derive(Debug)]
pub enum Outgoing {
    /// Encode and write a frame.
    Frame(Frame),
    /// Start sending heart-beats when idle for this long.
    EnableHeartBeat(Duration),
    /// Flush, shut the stream down and stop.
    Close,
}

/// The subscriber's session has stopped writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("subscriber outbox is closed")]
pub struct DeliveryError;

/// Handle for queueing frames onto one connection's writer.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Outgoing>,
}

impl Outbox {
    /// Bounded outbox and the receiver its writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a frame for the client, waiting while the outbox is full.
    pub async fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.send(Outgoing::Frame(frame)).await
    }

    pub(crate) async fn send(&self, item: Outgoing) -> Result<(), DeliveryError> {
        self.tx.send(item).await.map_err(|_| DeliveryError)
    }

    /// Whether the writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One client's interest in one destination.
#[derive(Clone, Debug)]
pub struct Subscription {
    /// Owning connection.
    pub connection: ConnectionId,
    /// Client-chosen id, unique per connection.
    pub id: String,
    /// Destination name.
    pub destination: String,
    /// Requested acknowledgement mode.
    pub ack: AckMode,
    /// Where MESSAGE frames for this subscription go.
    pub outbox: Outbox,
}

/// Work produced by a session, consumed in order by its dispatcher.
#[derive(Debug)]
pub enum Request {
    /// Register a subscription with its destination's topic.
    Subscribe(Subscription),
    /// Remove a subscription from its destination's topic.
    Unsubscribe(Subscription),
    /// Publish a SEND frame to the topic named by its `destination` header.
    Enqueue(Frame),
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Enqueue(_) => "enqueue",
        }
    }
}
