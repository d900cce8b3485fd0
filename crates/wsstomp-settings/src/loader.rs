//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`WsStompSettings::default()`]
//! 2. If `~/.wsstomp/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `WSSTOMP_*` environment variable overrides (highest priority)
//!
//! Command-line flags are applied afterwards by the binary.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::WsStompSettings;

/// Resolve the path to the settings file (`~/.wsstomp/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".wsstomp").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<WsStompSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<WsStompSettings> {
    let mut settings = read_settings_file(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<WsStompSettings> {
    let defaults = serde_json::to_value(WsStompSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `WSSTOMP_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_overrides(settings: &mut WsStompSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("WSSTOMP_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("WSSTOMP_PORT", |s| parse_range::<u16>(s, 1, u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("WSSTOMP_HEARTBEAT_MS", |s| parse_range::<u64>(s, 0, 3_600_000)) {
        settings.server.heartbeat_ms = v;
    }
    if let Some(v) = env.parsed("WSSTOMP_QUEUE_CAPACITY", |s| parse_range::<usize>(s, 1, 1 << 20)) {
        settings.broker.queue_capacity = v;
    }
    if let Some(v) = env.string("WSSTOMP_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("WSSTOMP_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
    if let Some(v) = env.string("WSSTOMP_URL") {
        settings.client.url = v;
    }
    if let Some(v) = env.string("WSSTOMP_TOPIC") {
        settings.client.topic = v;
    }
    if let Some(v) = env.string("WSSTOMP_MESSAGE") {
        settings.client.message = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and accept it only within `min..=max`.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
