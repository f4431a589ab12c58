//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RollcallSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `ROLLCALL_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RollcallSettings;

/// Default settings file: `$ROLLCALL_CONFIG`, else `~/.rollcall/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string("ROLLCALL_CONFIG") {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".rollcall").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RollcallSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a configuration that
/// fails [`RollcallSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RollcallSettings> {
    let mut settings = read_layers(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides or
/// validation.
pub fn read_layers(path: &Path) -> Result<RollcallSettings> {
    let defaults = serde_json::to_value(RollcallSettings::default())?;

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
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `ROLLCALL_*` environment variable overrides.
///
/// Integers must parse and fall within range; invalid values are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_env_overrides(settings: &mut RollcallSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("ROLLCALL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("ROLLCALL_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("ROLLCALL_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_u64("ROLLCALL_AUTH_TIMEOUT_MS", 100, 600_000) {
        settings.server.auth_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("ROLLCALL_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("ROLLCALL_HEARTBEAT_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.heartbeat_timeout_ms = v;
    }
    if let Some(v) = read_env_usize("ROLLCALL_OUTBOUND_QUEUE", 1, 65_536) {
        settings.server.outbound_queue = v;
    }

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("ROLLCALL_REPLAY_CAPACITY", 1, 1_000_000) {
        settings.broker.replay_capacity = v;
    }
    if let Some(v) = read_env_u64("ROLLCALL_REPLAY_MAX_AGE_SECS", 1, 86_400) {
        settings.broker.replay_max_age_secs = v;
    }

    // ── Auth / store / logging ──────────────────────────────────────
    if let Some(v) = read_env_string("ROLLCALL_JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }
    if let Some(v) = read_env_u64("ROLLCALL_TOKEN_TTL_SECS", 1, 86_400) {
        settings.auth.token_ttl_secs = v;
    }
    if let Some(v) = read_env_string("ROLLCALL_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = read_env_string("ROLLCALL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("ROLLCALL_LOG_FORMAT") {
        match v.parse() {
            Ok(format) => settings.logging.format = format,
            Err(e) => tracing::warn!(value = %v, error = %e, "invalid log format env var, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use assert_matches::assert_matches;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override_keeps_siblings() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(
            serde_json::json!({"a": 1, "b": 2}),
            serde_json::json!({"a": null}),
        );
        assert_eq!(merged, serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let merged = deep_merge(
            serde_json::json!({"a": {"nested": true}}),
            serde_json::json!({"a": 42}),
        );
        assert_eq!(merged["a"], 42);
    }

    // ── read_layers / load_settings_from_path ───────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = read_layers(Path::new("/nonexistent/rollcall.json")).unwrap();
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9090}, "broker": {"replayCapacity": 50}}"#,
        )
        .unwrap();

        let settings = read_layers(&path).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.broker.replay_capacity, 50);
        assert_eq!(settings.server.heartbeat_timeout_ms, 90_000);
        assert_eq!(settings.broker.dedup_capacity, 10_000);
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert_matches!(read_layers(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn load_validates_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"auth": {"jwtSecret": "0123456789abcdef0123"},
                "server": {"heartbeatIntervalMs": 5000, "heartbeatTimeoutMs": 1000}}"#,
        )
        .unwrap();
        assert_matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("heartbeatTimeoutMs")
        );
    }

    #[test]
    fn load_accepts_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"auth": {"jwtSecret": "0123456789abcdef0123"}, "logging": {"format": "json"}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(
            settings.logging.format,
            rollcall_core::logging::LogFormat::Json
        );
    }

    // ── range parsers ───────────────────────────────────────────────

    #[test]
    fn parse_u16_bounds() {
        assert_eq!(parse_u16_range("9090", 1, 65535), Some(9090));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u16_range("port", 1, 65535), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("30000", 100, 600_000), Some(30_000));
        assert_eq!(parse_u64_range("50", 100, 600_000), None);
        assert_eq!(parse_u64_range("700000", 100, 600_000), None);
    }

    #[test]
    fn parse_usize_bounds() {
        assert_eq!(parse_usize_range("256", 1, 65_536), Some(256));
        assert_eq!(parse_usize_range("0", 1, 65_536), None);
        assert_eq!(parse_usize_range("", 1, 65_536), None);
    }
}
