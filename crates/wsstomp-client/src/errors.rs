//! Client error types.

use wsstomp_core::{Command, Frame, FrameError, header};

/// Errors returned by [`crate::StompClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// WebSocket handshake or transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The server sent bytes that do not decode as STOMP.
    #[error("bad frame from server: {0}")]
    Frame(#[from] FrameError),

    /// The server answered with an ERROR frame.
    #[error("server error: {message}: {detail}")]
    Rejected {
        /// The ERROR frame's `message` header.
        message: String,
        /// The ERROR frame's body.
        detail: String,
    },

    /// A frame arrived that makes no sense at this point.
    #[error("unexpected {0} frame")]
    UnexpectedFrame(Command),

    /// The server closed the connection.
    #[error("connection closed by server")]
    Closed,
}

impl ClientError {
    pub(crate) fn rejected(frame: &Frame) -> Self {
        Self::Rejected {
            message: frame.get(header::MESSAGE).unwrap_or("error").to_owned(),
            detail: String::from_utf8_lossy(&frame.body).into_owned(),
        }
    }
}

/// Convenience alias for client results.
pub type Result<T> = std::result::Result<T, ClientError>;
