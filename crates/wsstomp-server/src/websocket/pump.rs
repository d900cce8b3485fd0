//! Transport pumps between a WebSocket and a duplex channel.
//!
//! Each discrete WebSocket message is one opaque chunk. Inbound chunks are
//! never merged or split; the session's reader may consume a chunk across
//! several reads.

use std::fmt::Display;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, close_code};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, trace};
use wsstomp_broker::duplex::{InboundSender, OutboundReceiver};

/// Why the inbound pump stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundEnd {
    /// The client sent a Close frame or the stream ended.
    ClientClosed,
    /// Receiving from the WebSocket failed.
    TransportError,
    /// The session stopped reading.
    SessionClosed,
}

/// Forward every data message from `stream` into the session's inbound queue.
///
/// Dropping `inbound` on return signals end of stream to the session.
pub async fn inbound_pump<St, E>(mut stream: St, inbound: InboundSender) -> InboundEnd
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(next) = stream.next().await {
        let chunk = match next {
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return InboundEnd::ClientClosed,
            Err(err) => {
                debug!(error = %err, "websocket receive failed");
                return InboundEnd::TransportError;
            }
        };
        trace!(len = chunk.len(), "inbound chunk");
        if inbound.push(chunk).await.is_err() {
            return InboundEnd::SessionClosed;
        }
    }
    InboundEnd::ClientClosed
}

/// Send every chunk the session writes as one WebSocket message, then a
/// normal Close frame once the session shuts its side down.
///
/// Returns the number of data messages sent.
pub async fn outbound_pump<Si>(mut sink: Si, mut outbound: OutboundReceiver) -> usize
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut sent = 0;
    while let Some(chunk) = outbound.pop().await {
        if let Err(err) = sink.send(chunk_message(chunk)).await {
            debug!(error = %err, "websocket send failed");
            outbound.close();
            return sent;
        }
        sent += 1;
    }

    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static("session ended"),
    }));
    let _ = sink.send(close).await;
    let _ = sink.close().await;
    sent
}

/// Text message when the chunk is UTF-8, binary otherwise.
fn chunk_message(chunk: Bytes) -> Message {
    match String::from_utf8(chunk.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(chunk),
    }
}
