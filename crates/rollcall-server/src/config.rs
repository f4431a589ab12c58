//! Server configuration.

use std::time::Duration;

use rollcall_settings::RollcallSettings;

/// Runtime configuration for [`RollcallServer`](crate::server::RollcallServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// How long a fresh connection may wait before sending AUTH.
    pub auth_timeout: Duration,
    /// Eviction sweep period.
    pub heartbeat_interval: Duration,
    /// Sessions silent for longer than this are evicted.
    pub heartbeat_timeout: Duration,
    /// Per-session outbound queue depth.
    pub outbound_queue: usize,
    /// Change ids remembered for ingestion dedup.
    pub dedup_capacity: usize,
    /// Envelopes kept for replay.
    pub replay_capacity: usize,
    /// Oldest envelope age served by replay.
    pub replay_max_age: Duration,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            outbound_queue: 256,
            dedup_capacity: 10_000,
            replay_capacity: 1_000,
            replay_max_age: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&RollcallSettings> for ServerConfig {
    fn from(settings: &RollcallSettings) -> Self {
        let server = &settings.server;
        let broker = &settings.broker;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            auth_timeout: Duration::from_millis(server.auth_timeout_ms),
            heartbeat_interval: Duration::from_millis(server.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(server.heartbeat_timeout_ms),
            outbound_queue: server.outbound_queue,
            dedup_capacity: broker.dedup_capacity,
            replay_capacity: broker.replay_capacity,
            replay_max_age: Duration::from_secs(broker.replay_max_age_secs),
            shutdown_timeout: Duration::from_millis(server.shutdown_timeout_ms),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_loopback_ephemeral() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
        assert_eq!(cfg.outbound_queue, 256);
        assert!(cfg.heartbeat_timeout > cfg.heartbeat_interval);
    }

    #[test]
    fn from_settings_converts_units() {
        let mut settings = RollcallSettings::default();
        settings.server.port = 9000;
        settings.server.auth_timeout_ms = 2500;
        settings.broker.replay_max_age_secs = 60;

        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.auth_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.replay_max_age, Duration::from_secs(60));
        assert_eq!(cfg.host, settings.server.host);
        assert_eq!(cfg.dedup_capacity, settings.broker.dedup_capacity);
    }
}
