//! # wsstomp-broker
//!
//! The broker engine, coded against byte streams rather than sockets:
//!
//! - [`duplex`]: bounded in-memory queues presented as `AsyncRead + AsyncWrite`
//! - [`session`]: per-connection STOMP state machine producing [`Request`]s
//! - [`router`]: destination name → [`Topic`] registry and fan-out
//! - [`dispatcher`]: applies a connection's requests to the router in order
//! - [`connection`]: wires the pieces together for one client
//!
//! Nothing here knows about WebSockets; the server crate pumps socket
//! messages into a [`duplex::TransportEnd`].

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod duplex;
pub mod policy;
pub mod request;
pub mod router;
pub mod session;

pub use connection::{Broker, BrokerSettings, Connection, ConnectionReport};
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use policy::{AllowAll, Authenticator, FixedHeartBeat, HeartBeat, SessionPolicy, StaticCredentials};
pub use request::{AckMode, DeliveryError, Outbox, Outgoing, Request, Subscription};
pub use router::{DestinationRouter, Topic, TopicRetention};
pub use session::{Session, SessionError, SessionOutcome};
