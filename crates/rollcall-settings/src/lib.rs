//! # rollcall-settings
//!
//! Layered configuration for the rollcall server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RollcallSettings::default()`]
//! 2. **Settings file**: `~/.rollcall/settings.json` or `$ROLLCALL_CONFIG`,
//!    deep-merged over defaults
//! 3. **Environment variables**: `ROLLCALL_*` overrides (highest priority)
//!
//! The binary applies CLI flags on top of the loaded value.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{
    AuthSettings, BrokerSettings, LoggingSettings, RollcallSettings, ServerSettings,
    StoreSettings,
};
