//! Server configuration.

use std::time::Duration;

use wsstomp_broker::{BrokerSettings, TopicRetention};
use wsstomp_settings::WsStompSettings;

/// Configuration for [`crate::WsStompServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Heart-beat interval advertised to clients. Zero disables.
    pub heart_beat: Duration,
    /// How long a closing socket may spend flushing queued frames.
    pub flush_timeout: Duration,
    /// Grace period for the listener on shutdown.
    pub shutdown_timeout: Duration,
    /// Per-connection queue sizes.
    pub broker: BrokerSettings,
    /// Whether empty topics are reclaimed.
    pub topic_retention: TopicRetention,
    /// Sweep period under [`TopicRetention::ReclaimEmpty`].
    pub reclaim_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            heart_beat: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            broker: BrokerSettings::default(),
            topic_retention: TopicRetention::Forever,
            reclaim_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &WsStompSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            heart_beat: settings.server.heartbeat(),
            flush_timeout: Duration::from_millis(settings.server.flush_timeout_ms),
            shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
            broker: settings.broker.broker_settings(),
            topic_retention: settings.broker.topic_retention,
            reclaim_interval: Duration::from_millis(settings.broker.reclaim_interval_ms.max(1)),
        }
    }

    /// `host:port` string for binding and logging.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
