//! Per-connection STOMP protocol session.
//!
//! A session is coded against any `AsyncRead + AsyncWrite` stream. The read
//! side runs inline in [`Session::run`]: it decodes frames, drives the
//! `AwaitingConnect → Connected` state machine and turns client frames into
//! [`Request`]s. Everything written back (CONNECTED, RECEIPT, ERROR, MESSAGE,
//! heart-beats) goes through one [`Outbox`] drained by a spawned writer task,
//! so deliveries from other connections and the session's own replies share a
//! single ordered path onto the stream.
//!
//! Returning from `run` is the terminated state: the request queue is dropped,
//! the writer flushes and shuts the stream down.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wsstomp_core::{Command, ConnectionId, Frame, FrameError, Packet, StompCodec, header};

use crate::policy::SessionPolicy;
use crate::request::{AckMode, Outbox, Outgoing, Request, Subscription};

/// Protocol versions this broker speaks, lowest first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1.0", "1.1", "1.2"];

/// Value of the `server` header on CONNECTED.
pub const SERVER_NAME: &str = concat!("wsstomp/", env!("CARGO_PKG_VERSION"));

/// Default number of frames queued for the writer.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Client sent DISCONNECT.
    Disconnected,
    /// The stream ended or failed.
    TransportClosed,
    /// The client broke the protocol; an ERROR frame was sent.
    ProtocolViolation,
    /// CONNECT credentials were rejected.
    AuthenticationFailed,
    /// Nothing arrived within the negotiated tolerance.
    HeartBeatTimeout,
    /// The server is shutting down.
    Cancelled,
}

impl SessionOutcome {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::TransportClosed => "transport_closed",
            Self::ProtocolViolation => "protocol_violation",
            Self::AuthenticationFailed => "authentication_failed",
            Self::HeartBeatTimeout => "heart_beat_timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the client ended the session on purpose.
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Reasons a session stops early.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Undecodable input or a failed read.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// A well-formed frame the session refuses.
    #[error("{message}: {detail}")]
    Protocol {
        /// Short text for the ERROR `message` header.
        message: &'static str,
        /// Longer text for the ERROR body.
        detail: String,
    },
    /// The authenticator said no.
    #[error("authentication failed for login '{login}'")]
    AuthenticationFailed {
        /// Login the client presented.
        login: String,
    },
    /// Nothing arrived within the read tolerance.
    #[error("no data received within {0:?}")]
    HeartBeatTimeout(Duration),
    /// The named half of the connection has gone away.
    #[error("{0} stopped")]
    Stopped(&'static str),
}

impl SessionError {
    fn protocol(message: &'static str, detail: impl Into<String>) -> Self {
        Self::Protocol {
            message,
            detail: detail.into(),
        }
    }

    fn missing_header(command: Command, name: &str) -> Self {
        Self::protocol(
            "missing header",
            format!("{command} frame requires a '{name}' header"),
        )
    }

    /// Outcome reported when the session ends with this error.
    pub fn outcome(&self) -> SessionOutcome {
        match self {
            Self::Frame(err) if !err.is_protocol_violation() => SessionOutcome::TransportClosed,
            Self::Frame(_) | Self::Protocol { .. } => SessionOutcome::ProtocolViolation,
            Self::AuthenticationFailed { .. } => SessionOutcome::AuthenticationFailed,
            Self::HeartBeatTimeout(_) => SessionOutcome::HeartBeatTimeout,
            Self::Stopped(_) => SessionOutcome::TransportClosed,
        }
    }

    /// ERROR frame to send the client, if the stream is still usable.
    pub fn error_frame(&self) -> Option<Frame> {
        let frame = match self {
            Self::Frame(err) if err.is_protocol_violation() => {
                Frame::error("malformed frame", &err.to_string())
            }
            Self::Protocol { message, detail } => Frame::error(message, detail),
            Self::AuthenticationFailed { .. } => {
                Frame::error("authentication failed", "invalid login or passcode")
            }
            Self::HeartBeatTimeout(limit) => Frame::error(
                "heart-beat timeout",
                &format!("no data received within {} ms", limit.as_millis()),
            ),
            Self::Frame(_) | Self::Stopped(_) => return None,
        };
        Some(frame)
    }
}

/// One client's protocol session over `stream`.
pub struct Session<S> {
    id: ConnectionId,
    stream: S,
    policy: SessionPolicy,
    requests: mpsc::Sender<Request>,
    codec: StompCodec,
    outbox_capacity: usize,
    cancel: CancellationToken,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Session that will emit its requests on `requests`.
    pub fn new(
        id: ConnectionId,
        stream: S,
        policy: SessionPolicy,
        requests: mpsc::Sender<Request>,
    ) -> Self {
        Self {
            id,
            stream,
            policy,
            requests,
            codec: StompCodec::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `codec` for both directions.
    #[must_use]
    pub fn with_codec(mut self, codec: StompCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Bound the writer queue.
    #[must_use]
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// End the session as [`SessionOutcome::Cancelled`] when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drive the session until it terminates.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn run(self) -> SessionOutcome {
        let (read_half, write_half) = tokio::io::split(self.stream);
        let mut frames = FramedRead::new(read_half, self.codec.clone());
        let sink = FramedWrite::new(write_half, self.codec);

        let (outbox, outgoing) = Outbox::channel(self.outbox_capacity);
        let writer = tokio::spawn(write_loop(sink, outgoing, self.id.clone()));

        let mut reader = Reader {
            id: self.id,
            policy: self.policy,
            requests: self.requests,
            outbox,
            state: State::AwaitingConnect,
            version: SUPPORTED_VERSIONS[0],
            read_timeout: None,
            subscriptions: HashMap::new(),
        };
        let outcome = reader.read_loop(&mut frames, &self.cancel).await;
        info!(outcome = outcome.as_str(), subscriptions = reader.subscriptions.len(), "session terminated");

        let Reader { outbox, .. } = reader;
        let _ = outbox.send(Outgoing::Close).await;
        drop(outbox);
        drop(frames);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "writer stopped with error"),
            Err(err) => warn!(error = %err, "writer task failed"),
        }
        outcome
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    AwaitingConnect,
    Connected,
}

enum Flow {
    Continue,
    Disconnect,
}

struct Reader {
    id: ConnectionId,
    policy: SessionPolicy,
    requests: mpsc::Sender<Request>,
    outbox: Outbox,
    state: State,
    version: &'static str,
    read_timeout: Option<Duration>,
    /// Live subscriptions by client id.
    subscriptions: HashMap<String, Subscription>,
}

impl Reader {
    async fn read_loop<R>(
        &mut self,
        frames: &mut FramedRead<R, StompCodec>,
        cancel: &CancellationToken,
    ) -> SessionOutcome
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let deadline = match self.state {
                State::AwaitingConnect => {
                    Some(self.policy.heart_beat.heart_beat()).filter(|d| !d.is_zero())
                }
                State::Connected => self.read_timeout,
            };
            let next = tokio::select! {
                () = cancel.cancelled() => return SessionOutcome::Cancelled,
                next = read_packet(frames, deadline) => next,
            };

            let (result, receipt) = match next {
                Ok(Some(Packet::HeartBeat)) => continue,
                Ok(Some(Packet::Frame(frame))) => {
                    let receipt = frame.receipt().map(str::to_owned);
                    (self.handle(frame, receipt.as_deref()).await, receipt)
                }
                Ok(None) => return SessionOutcome::TransportClosed,
                Err(err) => (Err(err), None),
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Disconnect) => return SessionOutcome::Disconnected,
                Err(err) => return self.fail(err, receipt.as_deref()).await,
            }
        }
    }

    async fn fail(&self, err: SessionError, receipt: Option<&str>) -> SessionOutcome {
        let outcome = err.outcome();
        warn!(error = %err, outcome = outcome.as_str(), "terminating session");
        if let Some(mut frame) = err.error_frame() {
            if let Some(receipt) = receipt {
                frame.headers.add(header::RECEIPT_ID, receipt);
            }
            let _ = self.outbox.deliver(frame).await;
        }
        outcome
    }

    async fn handle(&mut self, frame: Frame, receipt: Option<&str>) -> Result<Flow, SessionError> {
        let command = frame.command;
        let flow = match (self.state, command) {
            (_, cmd) if cmd.is_server_command() => {
                return Err(SessionError::protocol(
                    "unexpected frame",
                    format!("{command} frames are only sent by the server"),
                ));
            }
            (State::AwaitingConnect, Command::Connect | Command::Stomp) => {
                self.on_connect(&frame).await?;
                return Ok(Flow::Continue);
            }
            (State::AwaitingConnect, _) => {
                return Err(SessionError::protocol(
                    "not connected",
                    format!("expected CONNECT, received {command}"),
                ));
            }
            (State::Connected, Command::Connect | Command::Stomp) => {
                return Err(SessionError::protocol(
                    "already connected",
                    "CONNECT may only be sent once",
                ));
            }
            (State::Connected, Command::Subscribe) => {
                self.on_subscribe(&frame).await?;
                Flow::Continue
            }
            (State::Connected, Command::Unsubscribe) => {
                self.on_unsubscribe(&frame).await?;
                Flow::Continue
            }
            (State::Connected, Command::Send) => {
                self.submit(Request::Enqueue(frame)).await?;
                Flow::Continue
            }
            (State::Connected, Command::Ack | Command::Nack) => Flow::Continue,
            (State::Connected, Command::Begin | Command::Commit | Command::Abort) => {
                return Err(SessionError::protocol(
                    "transactions are not supported",
                    format!("{command} is not supported by this broker"),
                ));
            }
            (State::Connected, Command::Disconnect) => Flow::Disconnect,
            (
                State::Connected,
                Command::Connected | Command::Message | Command::Receipt | Command::Error,
            ) => unreachable!("server commands are rejected above"),
        };

        if let Some(receipt) = receipt {
            self.reply(Frame::receipt_for(receipt)).await?;
        }
        Ok(flow)
    }

    async fn on_connect(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let version = negotiate_version(frame.get(header::ACCEPT_VERSION)).ok_or_else(|| {
            SessionError::protocol(
                "unsupported protocol version",
                format!("supported versions are {}", SUPPORTED_VERSIONS.join(",")),
            )
        })?;

        let login = frame.get(header::LOGIN).unwrap_or_default();
        let passcode = frame.get(header::PASSCODE).unwrap_or_default();
        if !self.policy.authenticator.authenticate(login, passcode) {
            return Err(SessionError::AuthenticationFailed {
                login: login.to_owned(),
            });
        }

        let requested = parse_heart_beat(frame.get(header::HEART_BEAT))?;
        let (read, write) = negotiate_heart_beat(self.policy.heart_beat.heart_beat(), requested);
        self.read_timeout = read.map(|interval| interval + interval / 2);
        if let Some(interval) = write {
            self.outbox
                .send(Outgoing::EnableHeartBeat(interval))
                .await
                .map_err(|_| SessionError::Stopped("writer"))?;
        }

        let connected = Frame::new(Command::Connected)
            .header(header::VERSION, version)
            .header(header::HEART_BEAT, format!("{},{}", millis(write), millis(read)))
            .header(header::SERVER, SERVER_NAME)
            .header(header::SESSION, self.id.as_str());
        self.reply(connected).await?;

        self.state = State::Connected;
        self.version = version;
        info!(version, read_ms = millis(read), write_ms = millis(write), login, "session connected");
        Ok(())
    }

    async fn on_subscribe(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let destination = frame
            .destination()
            .ok_or_else(|| SessionError::missing_header(Command::Subscribe, header::DESTINATION))?;
        let id = self.subscription_id(frame, Command::Subscribe)?;
        let ack = match frame.get(header::ACK) {
            None => AckMode::default(),
            Some(raw) => raw.parse().map_err(|raw: String| {
                SessionError::protocol("invalid ack mode", format!("unsupported ack mode '{raw}'"))
            })?,
        };

        let subscription = Subscription {
            connection: self.id.clone(),
            id: id.clone(),
            destination: destination.to_owned(),
            ack,
            outbox: self.outbox.clone(),
        };
        debug!(subscription = %id, destination, ack = %ack, "subscribe");
        if let Some(previous) = self.subscriptions.insert(id, subscription.clone()) {
            self.submit(Request::Unsubscribe(previous)).await?;
        }
        self.submit(Request::Subscribe(subscription)).await
    }

    async fn on_unsubscribe(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let id = self.subscription_id(frame, Command::Unsubscribe)?;
        let subscription = self.subscriptions.remove(&id).ok_or_else(|| {
            SessionError::protocol("unknown subscription", format!("no subscription with id '{id}'"))
        })?;
        debug!(subscription = %id, destination = %subscription.destination, "unsubscribe");
        self.submit(Request::Unsubscribe(subscription)).await
    }

    /// The `id` header, falling back to `destination` under STOMP 1.0.
    fn subscription_id(&self, frame: &Frame, command: Command) -> Result<String, SessionError> {
        match frame.get(header::ID) {
            Some(id) => Ok(id.to_owned()),
            None if self.version == "1.0" => frame
                .destination()
                .map(str::to_owned)
                .ok_or_else(|| SessionError::missing_header(command, header::ID)),
            None => Err(SessionError::missing_header(command, header::ID)),
        }
    }

    async fn submit(&self, request: Request) -> Result<(), SessionError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| SessionError::Stopped("dispatcher"))
    }

    async fn reply(&self, frame: Frame) -> Result<(), SessionError> {
        self.outbox
            .deliver(frame)
            .await
            .map_err(|_| SessionError::Stopped("writer"))
    }
}

async fn read_packet<R>(
    frames: &mut FramedRead<R, StompCodec>,
    deadline: Option<Duration>,
) -> Result<Option<Packet>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let next = match deadline {
        Some(limit) => tokio::time::timeout(limit, frames.next())
            .await
            .map_err(|_| SessionError::HeartBeatTimeout(limit))?,
        None => frames.next().await,
    };
    next.transpose().map_err(SessionError::from)
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, StompCodec>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    connection: ConnectionId,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut heart_beat: Option<Duration> = None;
    let mut message_seq: u64 = 0;
    loop {
        let next = match heart_beat {
            Some(interval) => match tokio::time::timeout(interval, outgoing.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    sink.send(Packet::HeartBeat).await?;
                    continue;
                }
            },
            None => outgoing.recv().await,
        };
        match next {
            Some(Outgoing::Frame(mut frame)) => {
                if frame.command == Command::Message {
                    message_seq += 1;
                    frame
                        .headers
                        .set(header::MESSAGE_ID, format!("{connection}-{message_seq}"));
                }
                sink.send(Packet::Frame(frame)).await?;
            }
            Some(Outgoing::EnableHeartBeat(interval)) => heart_beat = Some(interval),
            Some(Outgoing::Close) | None => break,
        }
    }
    SinkExt::<Packet>::close(&mut sink).await
}

/// Highest version offered in `accept-version`; an absent header means 1.0.
fn negotiate_version(accept: Option<&str>) -> Option<&'static str> {
    let Some(accept) = accept else {
        return Some(SUPPORTED_VERSIONS[0]);
    };
    SUPPORTED_VERSIONS
        .iter()
        .rev()
        .find(|supported| accept.split(',').any(|v| v.trim() == **supported))
        .copied()
}

/// Parse `cx,cy`; absent means `0,0`.
fn parse_heart_beat(raw: Option<&str>) -> Result<(u64, u64), SessionError> {
    let Some(raw) = raw else {
        return Ok((0, 0));
    };
    let invalid = || SessionError::protocol("invalid heart-beat", format!("cannot parse '{raw}'"));
    let (cx, cy) = raw.split_once(',').ok_or_else(invalid)?;
    let cx = cx.trim().parse().map_err(|_| invalid())?;
    let cy = cy.trim().parse().map_err(|_| invalid())?;
    Ok((cx, cy))
}

/// `(read, write)` intervals for the server given its own interval and the
/// client's `cx,cy`. Non-zero client values are raised to at least `server`.
fn negotiate_heart_beat(server: Duration, (cx, cy): (u64, u64)) -> (Option<Duration>, Option<Duration>) {
    let floor = u64::try_from(server.as_millis()).unwrap_or(u64::MAX);
    if floor == 0 {
        return (None, None);
    }
    let raise = |ms: u64| (ms != 0).then(|| Duration::from_millis(ms.max(floor)));
    (raise(cx), raise(cy))
}

fn millis(interval: Option<Duration>) -> u64 {
    interval.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplex::{self, InboundSender, OutboundReceiver};
    use crate::policy::StaticCredentials;
    use assert_matches::assert_matches;
    use bytes::{Bytes, BytesMut};
    use tokio::task::JoinHandle;
    use tokio_util::codec::{Decoder, Encoder};

    struct Peer {
        inbound: InboundSender,
        outbound: OutboundReceiver,
        codec: StompCodec,
    }

    impl Peer {
        async fn send(&mut self, frame: Frame) {
            let mut buf = BytesMut::new();
            Encoder::<Frame>::encode(&mut self.codec, frame, &mut buf).unwrap();
            self.inbound.push(buf.freeze()).await.unwrap();
        }

        async fn send_raw(&self, raw: &'static [u8]) {
            self.inbound.push(Bytes::from_static(raw)).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Packet> {
            let chunk = self.outbound.pop().await?;
            let mut buf = BytesMut::from(&chunk[..]);
            self.codec.decode(&mut buf).unwrap()
        }

        async fn recv_frame(&mut self) -> Frame {
            loop {
                match self.recv().await {
                    Some(Packet::Frame(frame)) => return frame,
                    Some(Packet::HeartBeat) => {}
                    None => panic!("stream closed while waiting for a frame"),
                }
            }
        }

        async fn connect(&mut self, accept_version: &str) -> Frame {
            self.send(
                Frame::new(Command::Connect)
                    .header(header::ACCEPT_VERSION, accept_version)
                    .header(header::HOST, "localhost"),
            )
            .await;
            self.recv_frame().await
        }
    }

    struct Harness {
        peer: Peer,
        requests: mpsc::Receiver<Request>,
        session: JoinHandle<SessionOutcome>,
        id: ConnectionId,
    }

    fn start(policy: SessionPolicy) -> Harness {
        start_with(policy, CancellationToken::new())
    }

    fn start_with(policy: SessionPolicy, cancel: CancellationToken) -> Harness {
        let (stream, transport) = duplex::channel(64);
        let (inbound, outbound) = transport.split();
        let (tx, rx) = mpsc::channel(64);
        let id = ConnectionId::from_raw("conn_test");
        let session = Session::new(id.clone(), stream, policy, tx).with_cancellation(cancel);
        Harness {
            peer: Peer {
                inbound,
                outbound,
                codec: StompCodec::default(),
            },
            requests: rx,
            session: tokio::spawn(session.run()),
            id,
        }
    }

    fn no_heart_beat() -> SessionPolicy {
        SessionPolicy::default().with_heart_beat(Duration::ZERO)
    }

    #[test]
    fn version_negotiation_picks_highest_common() {
        assert_eq!(negotiate_version(None), Some("1.0"));
        assert_eq!(negotiate_version(Some("1.1,1.2")), Some("1.2"));
        assert_eq!(negotiate_version(Some("1.0, 1.1")), Some("1.1"));
        assert_eq!(negotiate_version(Some("2.0")), None);
    }

    #[test]
    fn heart_beat_header_parsing() {
        assert_eq!(parse_heart_beat(None).unwrap(), (0, 0));
        assert_eq!(parse_heart_beat(Some("100, 200")).unwrap(), (100, 200));
        assert_matches!(parse_heart_beat(Some("100")), Err(SessionError::Protocol { .. }));
        assert_matches!(parse_heart_beat(Some("a,b")), Err(SessionError::Protocol { .. }));
    }

    #[test]
    fn heart_beat_values_are_raised_to_server_interval() {
        let h = Duration::from_secs(5);
        assert_eq!(
            negotiate_heart_beat(h, (1000, 2000)),
            (Some(h), Some(h))
        );
        assert_eq!(
            negotiate_heart_beat(h, (0, 10_000)),
            (None, Some(Duration::from_secs(10)))
        );
        assert_eq!(negotiate_heart_beat(h, (0, 0)), (None, None));
        assert_eq!(negotiate_heart_beat(Duration::ZERO, (1000, 1000)), (None, None));
    }

    #[test]
    fn error_outcomes() {
        assert_eq!(
            SessionError::from(FrameError::MissingNul).outcome(),
            SessionOutcome::ProtocolViolation
        );
        let io = SessionError::from(FrameError::from(std::io::Error::other("reset")));
        assert_eq!(io.outcome(), SessionOutcome::TransportClosed);
        assert!(io.error_frame().is_none());
        assert_eq!(
            SessionError::HeartBeatTimeout(Duration::from_secs(1)).outcome(),
            SessionOutcome::HeartBeatTimeout
        );
    }

    #[tokio::test]
    async fn connect_negotiates_version_and_identifies_session() {
        let mut h = start(no_heart_beat());
        let connected = h.peer.connect("1.1,1.2").await;
        assert_eq!(connected.command, Command::Connected);
        assert_eq!(connected.get(header::VERSION), Some("1.2"));
        assert_eq!(connected.get(header::HEART_BEAT), Some("0,0"));
        assert_eq!(connected.get(header::SERVER), Some(SERVER_NAME));
        assert_eq!(connected.get(header::SESSION), Some(h.id.as_str()));
    }

    #[tokio::test]
    async fn connect_without_accept_version_is_1_0() {
        let mut h = start(no_heart_beat());
        h.peer.send(Frame::new(Command::Stomp)).await;
        let connected = h.peer.recv_frame().await;
        assert_eq!(connected.get(header::VERSION), Some("1.0"));
    }

    #[tokio::test]
    async fn connect_advertises_negotiated_heart_beat() {
        let mut h = start(SessionPolicy::default());
        h.peer
            .send(
                Frame::new(Command::Connect)
                    .header(header::ACCEPT_VERSION, "1.2")
                    .header(header::HEART_BEAT, "0,10000"),
            )
            .await;
        let connected = h.peer.recv_frame().await;
        assert_eq!(connected.get(header::HEART_BEAT), Some("10000,0"));
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let mut h = start(no_heart_beat());
        let error = h.peer.connect("2.0").await;
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.get(header::MESSAGE), Some("unsupported protocol version"));
        assert_eq!(h.session.await.unwrap(), SessionOutcome::ProtocolViolation);
        assert!(h.peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn bad_credentials_end_session_without_requests() {
        let policy = no_heart_beat().with_authenticator(StaticCredentials::new([("alice", "pw")]));
        let mut h = start(policy);
        h.peer
            .send(
                Frame::new(Command::Connect)
                    .header(header::ACCEPT_VERSION, "1.2")
                    .header(header::LOGIN, "alice")
                    .header(header::PASSCODE, "nope"),
            )
            .await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.get(header::MESSAGE), Some("authentication failed"));
        assert_eq!(h.session.await.unwrap(), SessionOutcome::AuthenticationFailed);
        assert!(h.requests.recv().await.is_none());
    }

    #[tokio::test]
    async fn good_credentials_are_accepted() {
        let policy = no_heart_beat().with_authenticator(StaticCredentials::new([("alice", "pw")]));
        let mut h = start(policy);
        h.peer
            .send(
                Frame::new(Command::Connect)
                    .header(header::ACCEPT_VERSION, "1.2")
                    .header(header::LOGIN, "alice")
                    .header(header::PASSCODE, "pw"),
            )
            .await;
        assert_eq!(h.peer.recv_frame().await.command, Command::Connected);
    }

    #[tokio::test]
    async fn frames_before_connect_are_rejected() {
        let mut h = start(no_heart_beat());
        h.peer
            .send(Frame::new(Command::Send).header(header::DESTINATION, "/q"))
            .await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.get(header::MESSAGE), Some("not connected"));
        assert_eq!(h.session.await.unwrap(), SessionOutcome::ProtocolViolation);
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        let error = h.peer.connect("1.2").await;
        assert_eq!(error.get(header::MESSAGE), Some("already connected"));
    }

    #[tokio::test]
    async fn subscribe_emits_request_with_outbox() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer
            .send(
                Frame::new(Command::Subscribe)
                    .header(header::DESTINATION, "/topic/x")
                    .header(header::ID, "0")
                    .header(header::ACK, "client-individual"),
            )
            .await;

        let sub = assert_matches!(h.requests.recv().await, Some(Request::Subscribe(s)) => s);
        assert_eq!(sub.id, "0");
        assert_eq!(sub.destination, "/topic/x");
        assert_eq!(sub.ack, AckMode::ClientIndividual);
        assert_eq!(sub.connection, h.id);

        let send = Frame::new(Command::Send)
            .header(header::DESTINATION, "/topic/x")
            .with_body("hi");
        sub.outbox
            .deliver(Frame::message_for(&send, &sub.id))
            .await
            .unwrap();
        let message = h.peer.recv_frame().await;
        assert_eq!(message.command, Command::Message);
        assert_eq!(message.get(header::SUBSCRIPTION), Some("0"));
        assert_eq!(message.get(header::MESSAGE_ID), Some("conn_test-1"));
        assert_eq!(&message.body[..], b"hi");
    }

    #[tokio::test]
    async fn subscribe_requires_id_after_1_0() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer
            .send(Frame::new(Command::Subscribe).header(header::DESTINATION, "/q"))
            .await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.get(header::MESSAGE), Some("missing header"));
        assert_eq!(h.session.await.unwrap(), SessionOutcome::ProtocolViolation);
    }

    #[tokio::test]
    async fn subscribe_id_defaults_to_destination_under_1_0() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.0").await;
        h.peer
            .send(Frame::new(Command::Subscribe).header(header::DESTINATION, "/q"))
            .await;
        let sub = assert_matches!(h.requests.recv().await, Some(Request::Subscribe(s)) => s);
        assert_eq!(sub.id, "/q");
    }

    #[tokio::test]
    async fn invalid_ack_mode_is_rejected() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer
            .send(
                Frame::new(Command::Subscribe)
                    .header(header::DESTINATION, "/q")
                    .header(header::ID, "1")
                    .header(header::ACK, "sometimes"),
            )
            .await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.get(header::MESSAGE), Some("invalid ack mode"));
    }

    #[tokio::test]
    async fn reused_subscription_id_replaces_previous() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        for destination in ["/a", "/b"] {
            h.peer
                .send(
                    Frame::new(Command::Subscribe)
                        .header(header::DESTINATION, destination)
                        .header(header::ID, "0"),
                )
                .await;
        }
        assert_matches!(h.requests.recv().await, Some(Request::Subscribe(s)) if s.destination == "/a");
        assert_matches!(h.requests.recv().await, Some(Request::Unsubscribe(s)) if s.destination == "/a");
        assert_matches!(h.requests.recv().await, Some(Request::Subscribe(s)) if s.destination == "/b");
    }

    #[tokio::test]
    async fn unsubscribe_known_and_unknown_ids() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer
            .send(
                Frame::new(Command::Subscribe)
                    .header(header::DESTINATION, "/q")
                    .header(header::ID, "7"),
            )
            .await;
        h.peer
            .send(Frame::new(Command::Unsubscribe).header(header::ID, "7"))
            .await;
        assert_matches!(h.requests.recv().await, Some(Request::Subscribe(_)));
        assert_matches!(h.requests.recv().await, Some(Request::Unsubscribe(s)) if s.id == "7" && s.destination == "/q");

        h.peer
            .send(
                Frame::new(Command::Unsubscribe)
                    .header(header::ID, "7")
                    .header(header::RECEIPT, "r-9"),
            )
            .await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.get(header::MESSAGE), Some("unknown subscription"));
        assert_eq!(error.get(header::RECEIPT_ID), Some("r-9"));
    }

    #[tokio::test]
    async fn send_is_forwarded_unchanged_and_receipted() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        let send = Frame::new(Command::Send)
            .header(header::DESTINATION, "/topic/x")
            .header(header::RECEIPT, "r-1")
            .header(header::CONTENT_LENGTH, "5")
            .with_body("hello");
        h.peer.send(send.clone()).await;

        let forwarded = assert_matches!(h.requests.recv().await, Some(Request::Enqueue(f)) => f);
        assert_eq!(forwarded, send);
        let receipt = h.peer.recv_frame().await;
        assert_eq!(receipt.command, Command::Receipt);
        assert_eq!(receipt.get(header::RECEIPT_ID), Some("r-1"));
    }

    #[tokio::test]
    async fn send_without_destination_is_still_forwarded() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer.send(Frame::new(Command::Send).with_body("x")).await;
        let forwarded = assert_matches!(h.requests.recv().await, Some(Request::Enqueue(f)) => f);
        assert_eq!(forwarded.destination(), None);
    }

    #[tokio::test]
    async fn ack_and_nack_are_ignored() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer.send(Frame::new(Command::Ack).header(header::ID, "m1")).await;
        h.peer
            .send(
                Frame::new(Command::Nack)
                    .header(header::ID, "m2")
                    .header(header::RECEIPT, "r"),
            )
            .await;
        assert_eq!(h.peer.recv_frame().await.command, Command::Receipt);
        assert!(h.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn transactions_are_rejected() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer
            .send(
                Frame::new(Command::Begin)
                    .header(header::TRANSACTION, "tx1")
                    .header(header::RECEIPT, "r-2"),
            )
            .await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.get(header::MESSAGE), Some("transactions are not supported"));
        assert_eq!(error.get(header::RECEIPT_ID), Some("r-2"));
        assert_eq!(h.session.await.unwrap(), SessionOutcome::ProtocolViolation);
    }

    #[tokio::test]
    async fn client_may_not_send_server_frames() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer.send(Frame::new(Command::Message)).await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.get(header::MESSAGE), Some("unexpected frame"));
    }

    #[tokio::test]
    async fn malformed_frame_is_a_protocol_violation() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer.send_raw(b"PUBLISH\n\n\0").await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.get(header::MESSAGE), Some("malformed frame"));
        assert_eq!(h.session.await.unwrap(), SessionOutcome::ProtocolViolation);
    }

    #[tokio::test]
    async fn overflowing_content_length_is_a_protocol_violation() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer
            .send_raw(b"SEND\ndestination:/q\ncontent-length:18446744073709551615\n\n\0")
            .await;
        let error = h.peer.recv_frame().await;
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.get(header::MESSAGE), Some("malformed frame"));
        assert_eq!(h.session.await.unwrap(), SessionOutcome::ProtocolViolation);
        assert!(h.requests.recv().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_sends_receipt_then_closes() {
        let mut h = start(no_heart_beat());
        let _ = h.peer.connect("1.2").await;
        h.peer
            .send(Frame::new(Command::Disconnect).header(header::RECEIPT, "bye"))
            .await;
        let receipt = h.peer.recv_frame().await;
        assert_eq!(receipt.get(header::RECEIPT_ID), Some("bye"));
        assert_eq!(h.session.await.unwrap(), SessionOutcome::Disconnected);
        assert!(h.peer.recv().await.is_none());
        assert!(h.requests.recv().await.is_none());
    }

    #[tokio::test]
    async fn transport_close_ends_session() {
        let h = start(no_heart_beat());
        let Harness { peer, session, .. } = h;
        drop(peer);
        assert_eq!(session.await.unwrap(), SessionOutcome::TransportClosed);
    }

    #[tokio::test]
    async fn cancellation_ends_session() {
        let cancel = CancellationToken::new();
        let mut h = start_with(no_heart_beat(), cancel.clone());
        let _ = h.peer.connect("1.2").await;
        cancel.cancel();
        assert_eq!(h.session.await.unwrap(), SessionOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let policy = SessionPolicy::default().with_heart_beat(Duration::from_secs(1));
        let mut h = start(policy);
        h.peer
            .send(
                Frame::new(Command::Connect)
                    .header(header::ACCEPT_VERSION, "1.2")
                    .header(header::HEART_BEAT, "1000,0"),
            )
            .await;
        let connected = h.peer.recv_frame().await;
        assert_eq!(connected.get(header::HEART_BEAT), Some("0,1000"));

        let started = tokio::time::Instant::now();
        assert_eq!(h.session.await.unwrap(), SessionOutcome::HeartBeatTimeout);
        assert!(started.elapsed() >= Duration::from_millis(1500));
        let error = h.peer.recv_frame().await;
        assert_eq!(error.get(header::MESSAGE), Some("heart-beat timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn heart_beats_keep_session_alive() {
        let policy = SessionPolicy::default().with_heart_beat(Duration::from_secs(1));
        let mut h = start(policy);
        h.peer
            .send(
                Frame::new(Command::Connect)
                    .header(header::ACCEPT_VERSION, "1.2")
                    .header(header::HEART_BEAT, "1000,0"),
            )
            .await;
        let _ = h.peer.recv_frame().await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.peer.send_raw(b"\n").await;
        }
        assert!(!h.session.is_finished());
        assert_eq!(h.session.await.unwrap(), SessionOutcome::HeartBeatTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn server_sends_heart_beats_when_idle() {
        let policy = SessionPolicy::default().with_heart_beat(Duration::from_secs(1));
        let mut h = start(policy);
        h.peer
            .send(
                Frame::new(Command::Connect)
                    .header(header::ACCEPT_VERSION, "1.2")
                    .header(header::HEART_BEAT, "0,1000"),
            )
            .await;
        assert_eq!(h.peer.recv_frame().await.command, Command::Connected);
        assert_eq!(h.peer.recv().await, Some(Packet::HeartBeat));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_connect_times_out() {
        let policy = SessionPolicy::default().with_heart_beat(Duration::from_secs(2));
        let h = start(policy);
        assert_eq!(h.session.await.unwrap(), SessionOutcome::HeartBeatTimeout);
    }
}
