//! In-memory capture of tracing events for assertions in tests.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// A captured tracing event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// The log level.
    pub level: Level,
    /// The target module.
    pub target: String,
    /// The formatted message.
    pub message: String,
    /// Field key-value pairs, values rendered as text.
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    /// Value of the field called `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Shared store of captured events.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    /// All captured events.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Whether any event at `level` contains `message_contains`.
    pub fn has_event(&self, level: Level, message_contains: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| e.level == level && e.message.contains(message_contains))
    }

    /// First event whose message contains `message_contains`.
    pub fn find(&self, message_contains: &str) -> Option<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .find(|e| e.message.contains(message_contains))
            .cloned()
    }
}

struct CaptureLayer {
    logs: CapturedLogs,
}

struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn push(&mut self, field: &tracing::field::Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_owned(), value));
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.push(field, value.to_owned());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.push(field, value.to_string());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.push(field, value.to_string());
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor {
            message: String::new(),
            fields: Vec::new(),
        };
        event.record(&mut visitor);

        self.logs.events.lock().push(CapturedEvent {
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Install a thread-local subscriber capturing every event.
///
/// Keep the guard alive for the duration of the test. Only events emitted
/// on the current thread are seen, so use a current-thread runtime.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let layer = CaptureLayer { logs: logs.clone() };
    let subscriber = tracing_subscriber::registry()
        .with(layer)
        .with(LevelFilter::TRACE);
    let guard = subscriber.set_default();
    (logs, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_message_and_fields() {
        let (logs, _guard) = capture_logs();
        tracing::info!(destination = "/topic/x", delivered = 2_u64, "published");

        let event = logs.find("published").unwrap();
        assert_eq!(event.level, Level::INFO);
        assert_eq!(event.field("destination"), Some("/topic/x"));
        assert_eq!(event.field("delivered"), Some("2"));
    }

    #[test]
    fn filters_by_level() {
        let (logs, _guard) = capture_logs();
        tracing::debug!("quiet");
        tracing::warn!("loud");
        assert!(logs.has_event(Level::WARN, "loud"));
        assert!(!logs.has_event(Level::WARN, "quiet"));
        assert_eq!(logs.events().len(), 2);
    }
}
