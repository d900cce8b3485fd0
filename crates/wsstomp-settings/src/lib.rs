//! # wsstomp-settings
//!
//! Configuration with layered sources for the wsstomp broker and demo client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`WsStompSettings::default()`]
//! 2. **User file**: `~/.wsstomp/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `WSSTOMP_*` overrides
//!
//! The binary applies command-line flags on top.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
