//! # wsstomp-client
//!
//! A small STOMP client over `tokio-tungstenite`, used by the `wsstomp client`
//! subcommand and by the server's end-to-end tests.
//!
//! - [`StompClient::connect`] performs the WebSocket handshake and the
//!   CONNECT / CONNECTED exchange
//! - [`StompClient::subscribe`], [`StompClient::publish`] and
//!   [`StompClient::disconnect`] cover the demo flows
//! - [`StompClient::send_frame`] / [`StompClient::next_frame`] give raw access

#![deny(unsafe_code)]

pub mod errors;

pub use errors::{ClientError, Result};

use std::collections::VecDeque;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info};
use wsstomp_core::{Command, Frame, Packet, StompCodec, header};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Versions offered in CONNECT.
pub const ACCEPT_VERSIONS: &str = "1.0,1.1,1.2";

/// Login and passcode sent on CONNECT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Login header.
    pub login: String,
    /// Passcode header.
    pub passcode: String,
}

impl Credentials {
    /// Credentials from a login/passcode pair.
    pub fn new(login: impl Into<String>, passcode: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            passcode: passcode.into(),
        }
    }
}

/// A connected STOMP session over one WebSocket.
pub struct StompClient {
    ws: WsStream,
    codec: StompCodec,
    buffer: BytesMut,
    /// Frames that arrived while a RECEIPT was awaited.
    pending: VecDeque<Frame>,
    connected: Frame,
    next_receipt: u64,
}

impl StompClient {
    /// Open `url` and complete the CONNECT handshake.
    ///
    /// Heart-beating is not requested (`0,0`).
    pub async fn connect(url: &str, credentials: Option<&Credentials>) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        debug!(url, "websocket connected");

        let mut client = Self {
            ws,
            codec: StompCodec::default(),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            connected: Frame::new(Command::Connected),
            next_receipt: 0,
        };

        let mut connect = Frame::new(Command::Connect)
            .header(header::ACCEPT_VERSION, ACCEPT_VERSIONS)
            .header(header::HOST, "/")
            .header(header::HEART_BEAT, "0,0");
        if let Some(creds) = credentials {
            connect = connect
                .header(header::LOGIN, creds.login.as_str())
                .header(header::PASSCODE, creds.passcode.as_str());
        }
        client.send_frame(connect).await?;

        let reply = client.next_frame().await?.ok_or(ClientError::Closed)?;
        match reply.command {
            Command::Connected => {
                info!(
                    version = reply.get(header::VERSION).unwrap_or("1.0"),
                    session = reply.get(header::SESSION).unwrap_or_default(),
                    "connected"
                );
                client.connected = reply;
                Ok(client)
            }
            Command::Error => Err(ClientError::rejected(&reply)),
            other => Err(ClientError::UnexpectedFrame(other)),
        }
    }

    /// The CONNECTED frame the server answered with.
    pub fn connected_frame(&self) -> &Frame {
        &self.connected
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> &str {
        self.connected.get(header::VERSION).unwrap_or("1.0")
    }

    /// Encode and send one frame as one WebSocket message.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let mut buf = BytesMut::new();
        Encoder::<Frame>::encode(&mut self.codec, frame, &mut buf)?;
        let message = match String::from_utf8(buf.to_vec()) {
            Ok(text) => Message::text(text),
            Err(raw) => Message::binary(raw.into_bytes()),
        };
        self.ws.send(message).await?;
        Ok(())
    }

    /// Next frame from the server, skipping heart-beats.
    ///
    /// Frames held back while waiting for a RECEIPT come first.
    /// `Ok(None)` once the server has closed the WebSocket.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            while let Some(packet) = self.codec.decode(&mut self.buffer)? {
                if let Packet::Frame(frame) = packet {
                    return Ok(Some(frame));
                }
            }

            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => self.buffer.extend_from_slice(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => self.buffer.extend_from_slice(&data),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    /// SUBSCRIBE to `destination` under `id` with automatic acknowledgement.
    pub async fn subscribe(&mut self, destination: &str, id: &str) -> Result<()> {
        let frame = Frame::new(Command::Subscribe)
            .header(header::DESTINATION, destination)
            .header(header::ID, id)
            .header(header::ACK, "auto");
        self.send_with_receipt(frame).await
    }

    /// UNSUBSCRIBE subscription `id`.
    pub async fn unsubscribe(&mut self, id: &str) -> Result<()> {
        let frame = Frame::new(Command::Unsubscribe).header(header::ID, id);
        self.send_with_receipt(frame).await
    }

    /// SEND `body` to `destination` and wait for the broker's RECEIPT.
    pub async fn publish(&mut self, destination: &str, body: impl Into<bytes::Bytes>) -> Result<()> {
        let body = body.into();
        let frame = Frame::new(Command::Send)
            .header(header::DESTINATION, destination)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, body.len().to_string())
            .with_body(body);
        self.send_with_receipt(frame).await
    }

    /// DISCONNECT, wait for the RECEIPT, then close the WebSocket.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send_with_receipt(Frame::new(Command::Disconnect)).await?;
        let _ = self.ws.close(None).await;
        Ok(())
    }

    /// Hand every MESSAGE frame to `on_message` until the server closes.
    ///
    /// Returns the number of messages seen. An ERROR frame ends the loop
    /// with [`ClientError::Rejected`].
    pub async fn for_each_message(&mut self, mut on_message: impl FnMut(&Frame)) -> Result<usize> {
        let mut seen = 0;
        while let Some(frame) = self.next_frame().await? {
            match frame.command {
                Command::Message => {
                    seen += 1;
                    on_message(&frame);
                }
                Command::Error => return Err(ClientError::rejected(&frame)),
                other => debug!(command = %other, "ignoring frame"),
            }
        }
        Ok(seen)
    }

    async fn send_with_receipt(&mut self, frame: Frame) -> Result<()> {
        self.next_receipt += 1;
        let receipt = format!("r-{}", self.next_receipt);
        self.send_frame(frame.header(header::RECEIPT, receipt.as_str()))
            .await?;

        loop {
            let reply = self.read_frame().await?.ok_or(ClientError::Closed)?;
            match reply.command {
                Command::Receipt if reply.get(header::RECEIPT_ID) == Some(receipt.as_str()) => {
                    return Ok(());
                }
                Command::Error => return Err(ClientError::rejected(&reply)),
                other => {
                    debug!(command = %other, "holding frame until receipt arrives");
                    self.pending.push_back(reply);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    type ServerWs = WebSocketStream<TcpStream>;

    /// One-connection fake broker driven by `script`.
    async fn fake_broker<F, Fut>(script: F) -> (String, JoinHandle<()>)
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        (format!("ws://{addr}/ws"), handle)
    }

    async fn read_frame(ws: &mut ServerWs) -> Frame {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if msg.is_text() || msg.is_binary() {
                let mut buf = BytesMut::from(&msg.into_data()[..]);
                if let Some(Packet::Frame(frame)) = StompCodec::default().decode(&mut buf).unwrap() {
                    return frame;
                }
            }
        }
    }

    async fn write_frame(ws: &mut ServerWs, frame: Frame) {
        let mut buf = BytesMut::new();
        Encoder::<Frame>::encode(&mut StompCodec::default(), frame, &mut buf).unwrap();
        ws.send(Message::text(String::from_utf8(buf.to_vec()).unwrap()))
            .await
            .unwrap();
    }

    fn receipt_for(frame: &Frame) -> Frame {
        Frame::receipt_for(frame.receipt().unwrap())
    }

    #[tokio::test]
    async fn connect_sends_credentials_and_reads_version() {
        let (url, server) = fake_broker(|mut ws| async move {
            let connect = read_frame(&mut ws).await;
            assert_eq!(connect.command, Command::Connect);
            assert_eq!(connect.get(header::ACCEPT_VERSION), Some(ACCEPT_VERSIONS));
            assert_eq!(connect.get(header::LOGIN), Some("guest"));
            assert_eq!(connect.get(header::PASSCODE), Some("secret"));
            write_frame(&mut ws, Frame::new(Command::Connected).header(header::VERSION, "1.2")).await;
        })
        .await;

        let creds = Credentials::new("guest", "secret");
        let client = StompClient::connect(&url, Some(&creds)).await.unwrap();
        assert_eq!(client.version(), "1.2");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_connect_surfaces_error_message() {
        let (url, server) = fake_broker(|mut ws| async move {
            let _ = read_frame(&mut ws).await;
            write_frame(&mut ws, Frame::error("authentication failed", "invalid login")).await;
            let _ = ws.close(None).await;
        })
        .await;

        let err = StompClient::connect(&url, None).await.err().unwrap();
        let message = assert_matches!(err, ClientError::Rejected { message, .. } => message);
        assert_eq!(message, "authentication failed");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn publish_waits_for_matching_receipt() {
        let (url, server) = fake_broker(|mut ws| async move {
            let _ = read_frame(&mut ws).await;
            write_frame(&mut ws, Frame::new(Command::Connected)).await;

            let send = read_frame(&mut ws).await;
            assert_eq!(send.command, Command::Send);
            assert_eq!(send.destination(), Some("/topic/x"));
            assert_eq!(send.get(header::CONTENT_LENGTH), Some("5"));
            assert_eq!(&send.body[..], b"hello");
            write_frame(&mut ws, Frame::receipt_for("other")).await;
            write_frame(&mut ws, receipt_for(&send)).await;

            let disconnect = read_frame(&mut ws).await;
            assert_eq!(disconnect.command, Command::Disconnect);
            write_frame(&mut ws, receipt_for(&disconnect)).await;
        })
        .await;

        let mut client = StompClient::connect(&url, None).await.unwrap();
        assert_eq!(client.version(), "1.0");
        client.publish("/topic/x", "hello").await.unwrap();
        client.disconnect().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_collects_messages_until_close() {
        let (url, server) = fake_broker(|mut ws| async move {
            let _ = read_frame(&mut ws).await;
            write_frame(&mut ws, Frame::new(Command::Connected)).await;

            let sub = read_frame(&mut ws).await;
            assert_eq!(sub.get(header::ID), Some("0"));
            assert_eq!(sub.get(header::ACK), Some("auto"));
            write_frame(&mut ws, receipt_for(&sub)).await;

            for body in ["one", "two"] {
                let published = Frame::new(Command::Send)
                    .header(header::DESTINATION, "/topic/x")
                    .with_body(body);
                write_frame(&mut ws, Frame::message_for(&published, "0")).await;
            }
            ws.send(Message::text("\n")).await.unwrap();
            let _ = ws.close(None).await;
        })
        .await;

        let mut client = StompClient::connect(&url, None).await.unwrap();
        client.subscribe("/topic/x", "0").await.unwrap();
        let mut bodies = Vec::new();
        let seen = client
            .for_each_message(|frame| bodies.push(String::from_utf8_lossy(&frame.body).into_owned()))
            .await
            .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(bodies, ["one", "two"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn message_ahead_of_receipt_is_kept() {
        let (url, server) = fake_broker(|mut ws| async move {
            let _ = read_frame(&mut ws).await;
            write_frame(&mut ws, Frame::new(Command::Connected)).await;

            let sub = read_frame(&mut ws).await;
            let published = Frame::new(Command::Send)
                .header(header::DESTINATION, "/topic/x")
                .with_body("early");
            write_frame(&mut ws, Frame::message_for(&published, "0")).await;
            write_frame(&mut ws, receipt_for(&sub)).await;
            let _ = ws.close(None).await;
        })
        .await;

        let mut client = StompClient::connect(&url, None).await.unwrap();
        client.subscribe("/topic/x", "0").await.unwrap();
        let mut bodies = Vec::new();
        let seen = client
            .for_each_message(|frame| bodies.push(String::from_utf8_lossy(&frame.body).into_owned()))
            .await
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(bodies, ["early"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_while_awaiting_receipt_is_returned() {
        let (url, server) = fake_broker(|mut ws| async move {
            let _ = read_frame(&mut ws).await;
            write_frame(&mut ws, Frame::new(Command::Connected)).await;
            let _ = read_frame(&mut ws).await;
            write_frame(&mut ws, Frame::error("unknown subscription", "no subscription with id 7")).await;
        })
        .await;

        let mut client = StompClient::connect(&url, None).await.unwrap();
        let err = client.unsubscribe("7").await.unwrap_err();
        assert_matches!(err, ClientError::Rejected { ref message, .. } if message == "unknown subscription");
        server.await.unwrap();
    }
}
