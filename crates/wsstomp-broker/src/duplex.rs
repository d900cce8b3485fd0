//! Duplex byte channel: a blocking-stream view over two bounded queues.
//!
//! The protocol side gets a [`ByteStream`] (`AsyncRead + AsyncWrite`), the
//! transport side a [`TransportEnd`] that moves whole chunks. Each chunk the
//! transport pushes becomes a read boundary; a chunk larger than the reader's
//! buffer is served across several reads, front first. Each write is copied
//! into one outbound chunk.
//!
//! Both queues are bounded. A full outbound queue makes writes wait and a full
//! inbound queue makes [`InboundSender::push`] wait: that is the only
//! backpressure in the system.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Default number of chunks each direction can hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Errors surfaced by the channel itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DuplexError {
    /// The other end has been dropped or shut down.
    #[error("channel is closed")]
    ClosedChannel,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, DuplexError::ClosedChannel)
}

/// Create a channel whose queues each hold at most `capacity` chunks.
pub fn channel(capacity: usize) -> (ByteStream, TransportEnd) {
    let capacity = capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let stream = ByteStream {
        inbound: inbound_rx,
        pending: Bytes::new(),
        outbound: PollSender::new(outbound_tx),
    };
    let transport = TransportEnd {
        inbound: InboundSender(inbound_tx),
        outbound: OutboundReceiver(outbound_rx),
    };
    (stream, transport)
}

/// Protocol-facing end.
///
/// A read returning zero bytes means the transport end is gone. Dropping the
/// stream closes both queues.
pub struct ByteStream {
    inbound: mpsc::Receiver<Bytes>,
    pending: Bytes,
    outbound: PollSender<Bytes>,
}

impl AsyncRead for ByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(closed()));
        }
        this.outbound
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outbound.close();
        Poll::Ready(Ok(()))
    }
}

/// Transport-facing end, split into one half per pump.
pub struct TransportEnd {
    inbound: InboundSender,
    outbound: OutboundReceiver,
}

impl TransportEnd {
    /// Separate the inbound and outbound halves.
    pub fn split(self) -> (InboundSender, OutboundReceiver) {
        (self.inbound, self.outbound)
    }

    /// Close both queues. Consuming `self` makes a second close unrepresentable.
    pub fn close(self) {
        drop(self);
    }
}

/// Pushes transport messages toward the protocol side.
#[derive(Clone)]
pub struct InboundSender(mpsc::Sender<Bytes>);

impl InboundSender {
    /// Queue one chunk, waiting while the queue is full. Empty chunks are dropped.
    pub async fn push(&self, chunk: Bytes) -> Result<(), DuplexError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.0.send(chunk).await.map_err(|_| DuplexError::ClosedChannel)
    }

    /// Whether the protocol side has gone away.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Pulls chunks written by the protocol side.
pub struct OutboundReceiver(mpsc::Receiver<Bytes>);

impl OutboundReceiver {
    /// Next written chunk, or `None` once the protocol side has shut down and
    /// everything queued before that has been taken.
    pub async fn pop(&mut self) -> Option<Bytes> {
        self.0.recv().await
    }

    /// Refuse further writes; already queued chunks can still be popped.
    pub fn close(&mut self) {
        self.0.close();
    }
}
