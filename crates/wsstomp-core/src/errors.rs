//! Frame decoding errors.

/// Errors raised while decoding the STOMP text encoding.
///
/// Every variant except [`FrameError::Io`] is a protocol violation by the
/// peer; the session answers them with an ERROR frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("frame is not valid UTF-8 in its {0} section")]
    InvalidUtf8(&'static str),
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    #[error("frame body is not terminated by NUL")]
    MissingNul,
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownCommand(_) => "unknown_command",
            Self::MalformedHeader(_) => "malformed_header",
            Self::InvalidEscape(_) => "invalid_escape",
            Self::InvalidUtf8(_) => "invalid_utf8",
            Self::InvalidContentLength(_) => "invalid_content_length",
            Self::MissingNul => "missing_nul",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Io(_) => "io",
        }
    }

    /// Whether the error was caused by the peer's bytes rather than the stream.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}
