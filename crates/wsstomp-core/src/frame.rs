//! STOMP frame model.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::errors::FrameError;

/// Well-known header names.
pub mod header {
    /// Versions a client is willing to speak.
    pub const ACCEPT_VERSION: &str = "accept-version";
    /// Acknowledgement mode of a subscription.
    pub const ACK: &str = "ack";
    /// Body length in bytes.
    pub const CONTENT_LENGTH: &str = "content-length";
    /// MIME type of the body.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Destination name.
    pub const DESTINATION: &str = "destination";
    /// Heart-beat intervals `x,y` in milliseconds.
    pub const HEART_BEAT: &str = "heart-beat";
    /// Virtual host requested by the client.
    pub const HOST: &str = "host";
    /// Subscription or acknowledgement id.
    pub const ID: &str = "id";
    /// Client login.
    pub const LOGIN: &str = "login";
    /// Short error description on ERROR frames.
    pub const MESSAGE: &str = "message";
    /// Server-assigned id of a MESSAGE frame.
    pub const MESSAGE_ID: &str = "message-id";
    /// Client passcode.
    pub const PASSCODE: &str = "passcode";
    /// Receipt requested by the client.
    pub const RECEIPT: &str = "receipt";
    /// Receipt being acknowledged by the server.
    pub const RECEIPT_ID: &str = "receipt-id";
    /// Server product string on CONNECTED.
    pub const SERVER: &str = "server";
    /// Session id on CONNECTED.
    pub const SESSION: &str = "session";
    /// Subscription a MESSAGE is delivered for.
    pub const SUBSCRIPTION: &str = "subscription";
    /// Transaction a frame belongs to.
    pub const TRANSACTION: &str = "transaction";
    /// Negotiated protocol version on CONNECTED.
    pub const VERSION: &str = "version";
}

/// Frame command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED frames carry unescaped header values.
    pub fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }

    /// Frames only a server may send.
    pub fn is_server_command(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Message | Self::Receipt | Self::Error
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(FrameError::UnknownCommand(other.to_owned())),
        };
        Ok(command)
    }
}

/// Ordered, case-sensitive header list.
///
/// Duplicates are kept in arrival order; lookups see the first occurrence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the first header called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header called `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a header, keeping any existing value with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every occurrence of `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(pos) = self.0.iter().position(|(k, _)| k == name) {
            self.0[pos].1 = value;
            let mut index = 0;
            self.0.retain(|(k, _)| {
                let keep = index <= pos || k != name;
                index += 1;
                keep
            });
        } else {
            self.0.push((name.to_owned(), value));
        }
    }

    /// Drop every occurrence of `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| k != name);
    }

    /// Iterate headers in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of header lines, duplicates included.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A single protocol message: command, headers and an opaque body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order.
    pub headers: Headers,
    /// Body bytes, possibly empty.
    pub body: Bytes,
}

impl Frame {
    /// Frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Builder-style header append.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Builder-style body setter.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Shorthand for `self.headers.get(name)`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The `destination` header, if any.
    pub fn destination(&self) -> Option<&str> {
        self.get(header::DESTINATION)
    }

    /// The `receipt` header, if any.
    pub fn receipt(&self) -> Option<&str> {
        self.get(header::RECEIPT)
    }

    /// ERROR frame with a short message header and a plain-text body.
    pub fn error(message: &str, detail: &str) -> Self {
        Self::new(Command::Error)
            .header(header::MESSAGE, message)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, detail.len().to_string())
            .with_body(Bytes::copy_from_slice(detail.as_bytes()))
    }

    /// RECEIPT frame answering `receipt_id`.
    pub fn receipt_for(receipt_id: &str) -> Self {
        Self::new(Command::Receipt).header(header::RECEIPT_ID, receipt_id)
    }

    /// MESSAGE frame delivering a published SEND frame to one subscription.
    ///
    /// Publisher headers are copied except `receipt` and `transaction`; the
    /// body is shared, not copied.
    pub fn message_for(published: &Frame, subscription_id: &str) -> Self {
        let mut headers: Headers = published
            .headers
            .iter()
            .filter(|(k, _)| *k != header::RECEIPT && *k != header::TRANSACTION)
            .collect();
        headers.set(header::SUBSCRIPTION, subscription_id);
        headers.set(header::CONTENT_LENGTH, published.body.len().to_string());
        Self {
            command: Command::Message,
            headers,
            body: published.body.clone(),
        }
    }
}
