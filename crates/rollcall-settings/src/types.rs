//! Settings structs.
//!
//! Every struct uses `#[serde(default)]`, so a settings file only needs the
//! keys it wants to change.

use rollcall_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollcallSettings {
    /// Network and session lifecycle.
    pub server: ServerSettings,
    /// Event broker buffers.
    pub broker: BrokerSettings,
    /// Token verification.
    pub auth: AuthSettings,
    /// Enrollment database.
    pub store: StoreSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RollcallSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_timeout_ms <= self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutMs ({}) must exceed server.heartbeatIntervalMs ({})",
                self.server.heartbeat_timeout_ms, self.server.heartbeat_interval_ms
            )));
        }
        if self.server.outbound_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundQueue must be at least 1".into(),
            ));
        }
        if self.auth.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(SettingsError::InvalidValue(format!(
                "auth.jwtSecret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.broker.replay_capacity == 0 || self.broker.dedup_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "broker capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Shortest accepted HS256 secret.
pub const MIN_SECRET_LEN: usize = 16;

/// Network and session lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP + WebSocket port.
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// How long a new connection has to send AUTH.
    pub auth_timeout_ms: u64,
    /// Eviction sweep interval.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a session is evicted.
    pub heartbeat_timeout_ms: u64,
    /// Per-session outbound queue depth.
    pub outbound_queue: usize,
    /// Grace period for in-flight work on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1024,
            auth_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            outbound_queue: 256,
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// Event broker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Number of store change IDs remembered for duplicate suppression.
    pub dedup_capacity: usize,
    /// Envelopes kept for reconnect replay.
    pub replay_capacity: usize,
    /// Oldest envelope age eligible for replay, in seconds.
    pub replay_max_age_secs: u64,
    /// Depth of the store change feed channel.
    pub feed_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            dedup_capacity: 10_000,
            replay_capacity: 1_000,
            replay_max_age_secs: 300,
            feed_capacity: 1_024,
        }
    }
}

/// Token settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 signing secret. Empty by default; must be configured.
    pub jwt_secret: String,
    /// Lifetime of tokens issued by the server, in seconds.
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_secs: 900,
        }
    }
}

/// Database settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// `SQLite` file path. `:memory:` keeps everything in RAM.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "rollcall.db".to_string(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
