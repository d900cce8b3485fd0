//! Per-socket lifecycle.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, Stream, StreamExt};
use tracing::{Instrument, info, info_span, warn};
use wsstomp_broker::{Connection, ConnectionReport};

use super::pump::{inbound_pump, outbound_pump};
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, record_report};
use crate::server::AppState;

/// Counts a socket as open for as long as it lives.
struct OpenConnection {
    count: Arc<AtomicUsize>,
}

impl OpenConnection {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        let _ = count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        let _ = self.count.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

/// Run one upgraded WebSocket until its session has ended.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let _open = OpenConnection::new(&state.connections);
    let connection = state.broker.connect();
    let span = info_span!("ws_connection", connection_id = %connection.id);

    async move {
        info!("websocket client connected");
        let (sink, stream) = socket.split();
        let _ = serve_connection(sink, stream, connection, state.flush_timeout).await;
    }
    .instrument(span)
    .await;
}

/// Pump `sink`/`stream` against `connection` until its session ends.
///
/// The inbound pump is stopped once the session is done; the outbound pump
/// gets `flush_timeout` to deliver what the session wrote last (typically
/// an ERROR frame) and the Close frame.
pub async fn serve_connection<Si, St, E>(
    sink: Si,
    stream: St,
    connection: Connection,
    flush_timeout: Duration,
) -> Option<ConnectionReport>
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let started = Instant::now();
    let (inbound, outbound) = connection.transport.split();
    let reader = tokio::spawn(inbound_pump(stream, inbound).in_current_span());
    let mut writer = tokio::spawn(outbound_pump(sink, outbound).in_current_span());

    let report = match connection.task.await {
        Ok(report) => Some(report),
        Err(err) => {
            warn!(error = %err, "connection task failed");
            None
        }
    };
    reader.abort();

    match tokio::time::timeout(flush_timeout, &mut writer).await {
        Ok(Ok(sent)) => tracing::debug!(sent, "outbound pump finished"),
        Ok(Err(err)) => warn!(error = %err, "outbound pump failed"),
        Err(_) => {
            warn!("outbound flush timed out");
            writer.abort();
        }
    }

    if let Some(report) = &report {
        record_report(report, started.elapsed().as_secs_f64());
        info!(
            outcome = report.outcome.as_str(),
            published = report.summary.enqueued,
            delivered = report.summary.delivered,
            "websocket client disconnected"
        );
    }
    report
}
