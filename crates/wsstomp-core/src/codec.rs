//! STOMP text encoding as a `tokio_util` codec.
//!
//! ```text
//! COMMAND\n
//! name:value\n        (zero or more)
//! \n
//! body\0
//! ```
//!
//! Lines may end in `\r\n`. A bare EOL between frames is a heart-beat.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::FrameError;
use crate::frame::{Command, Frame, Headers, header};

/// Upper bound on a single encoded frame unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Unit read from or written to a STOMP byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// Keep-alive EOL.
    HeartBeat,
    /// A complete frame.
    Frame(Frame),
}

/// Decoder/encoder for the STOMP text encoding.
#[derive(Clone, Debug)]
pub struct StompCodec {
    max_frame_bytes: usize,
}

impl StompCodec {
    /// Codec rejecting frames larger than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    fn check_size(&self, buffered: usize) -> Result<(), FrameError> {
        if buffered > self.max_frame_bytes {
            Err(FrameError::FrameTooLarge {
                limit: self.max_frame_bytes,
            })
        } else {
            Ok(())
        }
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

/// Position just past the blank line ending the header block, if buffered.
fn header_block_end(src: &[u8]) -> Option<(usize, Vec<(usize, usize)>)> {
    let mut lines = Vec::new();
    let mut start = 0;
    while let Some(offset) = src[start..].iter().position(|&b| b == b'\n') {
        let newline = start + offset;
        let end = if newline > start && src[newline - 1] == b'\r' {
            newline - 1
        } else {
            newline
        };
        if end == start && !lines.is_empty() {
            return Some((newline + 1, lines));
        }
        lines.push((start, end));
        start = newline + 1;
    }
    None
}

fn utf8<'a>(bytes: &'a [u8], section: &'static str) -> Result<&'a str, FrameError> {
    std::str::from_utf8(bytes).map_err(|_| FrameError::InvalidUtf8(section))
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(FrameError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

fn escape_into(value: &str, dst: &mut BytesMut) {
    for c in value.chars() {
        match c {
            '\r' => dst.put_slice(b"\\r"),
            '\n' => dst.put_slice(b"\\n"),
            ':' => dst.put_slice(b"\\c"),
            '\\' => dst.put_slice(b"\\\\"),
            other => {
                let mut buf = [0u8; 4];
                dst.put_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn parse_headers(
    src: &[u8],
    lines: &[(usize, usize)],
    escaped: bool,
) -> Result<Headers, FrameError> {
    let mut headers = Headers::new();
    for &(start, end) in lines {
        let line = utf8(&src[start..end], "header")?;
        let Some((name, value)) = line.split_once(':') else {
            return Err(FrameError::MalformedHeader(line.to_owned()));
        };
        if escaped {
            headers.add(unescape(name)?, unescape(value)?);
        } else {
            headers.add(name, value);
        }
    }
    Ok(headers)
}

impl Decoder for StompCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(Packet::HeartBeat));
            }
            Some(b'\r') => {
                return match src.get(1) {
                    None => Ok(None),
                    Some(b'\n') => {
                        src.advance(2);
                        Ok(Some(Packet::HeartBeat))
                    }
                    Some(_) => Err(FrameError::UnknownCommand("\r".into())),
                };
            }
            Some(_) => {}
        }

        let Some((body_start, lines)) = header_block_end(src) else {
            self.check_size(src.len())?;
            return Ok(None);
        };

        let (cmd_start, cmd_end) = lines[0];
        let command: Command = utf8(&src[cmd_start..cmd_end], "command")?.parse()?;
        let headers = parse_headers(src, &lines[1..], command.escapes_headers())?;

        let body_end = match headers.get(header::CONTENT_LENGTH) {
            Some(raw) => {
                let len: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(raw.to_owned()))?;
                let body_end = body_start
                    .checked_add(len)
                    .filter(|&end| end < self.max_frame_bytes)
                    .ok_or(FrameError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    })?;
                if src.len() <= body_end {
                    return Ok(None);
                }
                if src[body_end] != 0 {
                    return Err(FrameError::MissingNul);
                }
                body_end
            }
            None => match src[body_start..].iter().position(|&b| b == 0) {
                Some(offset) => body_start + offset,
                None => {
                    self.check_size(src.len())?;
                    return Ok(None);
                }
            },
        };
        self.check_size(body_end + 1)?;

        let raw = src.split_to(body_end + 1).freeze();
        let body: Bytes = raw.slice(body_start..body_end);
        Ok(Some(Packet::Frame(Frame {
            command,
            headers,
            body,
        })))
    }
}

impl Encoder<Packet> for StompCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), FrameError> {
        match item {
            Packet::HeartBeat => dst.put_u8(b'\n'),
            Packet::Frame(frame) => Encoder::<Frame>::encode(self, frame, dst)?,
        }
        Ok(())
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let escaped = frame.command.escapes_headers();
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in frame.headers.iter() {
            if escaped {
                escape_into(name, dst);
                dst.put_u8(b':');
                escape_into(value, dst);
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
