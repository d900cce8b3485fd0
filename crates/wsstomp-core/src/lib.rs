//! # wsstomp-core
//!
//! Shared vocabulary for the wsstomp broker and client:
//!
//! - **Frames**: [`Frame`], [`Command`] and ordered [`Headers`]
//! - **Codec**: [`StompCodec`], a `tokio_util` decoder/encoder for the STOMP text encoding
//! - **IDs**: [`ConnectionId`] branded identifier
//! - **Errors**: [`FrameError`] for malformed input

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod frame;
pub mod ids;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, Packet, StompCodec};
pub use errors::FrameError;
pub use frame::{Command, Frame, Headers, header};
pub use ids::ConnectionId;
