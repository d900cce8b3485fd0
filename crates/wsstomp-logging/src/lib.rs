//! # wsstomp-logging
//!
//! Structured logging with `tracing`.
//!
//! [`init_logging`] installs the process-wide subscriber: an `EnvFilter`
//! (`RUST_LOG` wins over the configured level) feeding either compact
//! human-readable lines or JSON lines on stderr. [`capture`] collects
//! events in memory for tests.

#![deny(unsafe_code)]

pub mod capture;

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable text.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// `Json` when `json` is set, `Text` otherwise.
    pub fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }
}

/// Build the filter: `RUST_LOG` if set and valid, else `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber on stderr.
///
/// Call once at startup. Returns `false` if a subscriber was already
/// installed, in which case nothing changes.
pub fn init_logging(level: &str, format: LogFormat) -> bool {
    let filter = env_filter(level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.compact().try_init().is_ok(),
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init()
            .is_ok(),
    }
}
