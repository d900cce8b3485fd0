//! Settings type definitions.
//!
//! Field names are camelCase in JSON. Every struct carries
//! `#[serde(default)]`, so a partial file only overrides what it names.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsstomp_broker::{BrokerSettings, TopicRetention};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WsStompSettings {
    /// Listener and heart-beat settings.
    pub server: ServerSettings,
    /// Queue sizes and topic lifetime.
    pub broker: BrokerTuning,
    /// Credentials accepted on CONNECT.
    pub auth: AuthSettings,
    /// Demo client defaults.
    pub client: ClientSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl WsStompSettings {
    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.host is empty".into()));
        }
        if self.broker.queue_capacity == 0 || self.broker.request_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "broker queue capacities must be non-zero".into(),
            ));
        }
        if self.broker.max_frame_bytes < 64 {
            return Err(SettingsError::InvalidValue(format!(
                "broker.maxFrameBytes {} is too small",
                self.broker.max_frame_bytes
            )));
        }
        if !self.client.topic.starts_with('/') {
            tracing::debug!(topic = %self.client.topic, "client topic has no leading slash");
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Heart-beat interval advertised to clients, in milliseconds. Zero disables.
    pub heartbeat_ms: u64,
    /// How long a closing socket may take to flush, in milliseconds.
    pub flush_timeout_ms: u64,
    /// Grace period for open connections on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            heartbeat_ms: 5_000,
            flush_timeout_ms: 1_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// Heart-beat interval as a [`Duration`].
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

/// Per-connection queue sizes and topic lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerTuning {
    /// Chunks buffered in each direction between socket and session.
    pub queue_capacity: usize,
    /// Requests buffered between session and dispatcher.
    pub request_capacity: usize,
    /// Frames buffered for a session's writer.
    pub outbox_capacity: usize,
    /// Largest accepted frame.
    pub max_frame_bytes: usize,
    /// Whether empty topics are ever dropped.
    pub topic_retention: TopicRetention,
    /// Sweep period under [`TopicRetention::ReclaimEmpty`], in milliseconds.
    pub reclaim_interval_ms: u64,
}

impl Default for BrokerTuning {
    fn default() -> Self {
        let defaults = BrokerSettings::default();
        Self {
            queue_capacity: defaults.queue_capacity,
            request_capacity: defaults.request_capacity,
            outbox_capacity: defaults.outbox_capacity,
            max_frame_bytes: defaults.max_frame_bytes,
            topic_retention: TopicRetention::default(),
            reclaim_interval_ms: 60_000,
        }
    }
}

impl BrokerTuning {
    /// The subset the broker engine consumes.
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            queue_capacity: self.queue_capacity,
            request_capacity: self.request_capacity,
            outbox_capacity: self.outbox_capacity,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Credentials accepted on CONNECT. An empty table accepts everyone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Login → passcode.
    pub users: BTreeMap<String, String>,
}

/// Demo client defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// WebSocket URL of the broker.
    pub url: String,
    /// Destination to subscribe or publish to.
    pub topic: String,
    /// Body to publish; empty means subscribe and print.
    pub message: String,
    /// Login sent on CONNECT.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// Passcode sent on CONNECT.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765/ws".to_string(),
            topic: "/topic/notifications".to_string(),
            message: String::new(),
            login: None,
            passcode: None,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let settings = WsStompSettings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.server.heartbeat(), Duration::from_secs(5));
        assert_eq!(settings.client.url, "ws://localhost:8765/ws");
        assert_eq!(settings.client.topic, "/topic/notifications");
        assert!(settings.client.message.is_empty());
        assert_eq!(settings.broker.queue_capacity, 4096);
        assert_eq!(settings.broker.topic_retention, TopicRetention::Forever);
        assert!(settings.auth.users.is_empty());
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(WsStompSettings::default()).unwrap();
        assert_eq!(json["server"]["heartbeatMs"], 5000);
        assert_eq!(json["broker"]["topicRetention"], "forever");
        assert!(json["client"].get("login").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: WsStompSettings =
            serde_json::from_str(r#"{"broker": {"topicRetention": "reclaim_empty"}}"#).unwrap();
        assert_eq!(settings.broker.topic_retention, TopicRetention::ReclaimEmpty);
        assert_eq!(settings.broker.request_capacity, 128);
        assert_eq!(settings.server.port, 8765);
    }

    #[test]
    fn broker_settings_carry_over() {
        let mut tuning = BrokerTuning::default();
        tuning.queue_capacity = 8;
        tuning.max_frame_bytes = 4096;
        let engine = tuning.broker_settings();
        assert_eq!(engine.queue_capacity, 8);
        assert_eq!(engine.max_frame_bytes, 4096);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut settings = WsStompSettings::default();
        assert!(settings.validate().is_ok());
        settings.broker.queue_capacity = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_empty_host() {
        let mut settings = WsStompSettings::default();
        settings.server.host = "  ".into();
        assert!(settings.validate().is_err());
    }
}
