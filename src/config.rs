use serde::{Deserialize, Serialize};

use crate::common::types::AnyResult;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8085,
            password: "hypelink".to_string(),
        }
    }
}

/// Tuning knobs for the registry, router and lifecycle sweep.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// Expected client heartbeat interval. The observed driver/dashboard
    /// clients declare 10s; a connection is considered dead after twice this.
    pub heartbeat_interval_ms: u64,
    /// Maximum concurrent dashboard connections.
    pub max_subscribers: usize,
    /// Bounded outbound queue size per subscriber; position updates beyond
    /// this are coalesced to the newest.
    pub subscriber_queue_capacity: usize,
    /// Hard limit on buffered non-droppable events before the subscriber is
    /// closed as overloaded.
    pub event_backlog_limit: usize,
    /// What to do when a driver id connects while it already has a live
    /// session.
    pub duplicate_publisher: DuplicatePublisherPolicy,
    /// How long a disconnected driver session is kept before eviction.
    pub disconnect_grace_secs: u64,
    /// Interval between stats pushes to dashboard sockets.
    pub stats_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            max_subscribers: 512,
            subscriber_queue_capacity: 64,
            event_backlog_limit: 256,
            duplicate_publisher: DuplicatePublisherPolicy::Replace,
            disconnect_grace_secs: 300,
            stats_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePublisherPolicy {
    /// Force-close the old connection and let the new one take over. Drivers
    /// reconnect on network change, so this is the default.
    Replace,
    /// Refuse the new connection while the old one is alive.
    Reject,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DeliveryConfig {
    /// Order-fulfillment endpoint that receives delivery-completion events.
    /// When unset, completions are fanned out but not forwarded.
    pub fulfillment_url: Option<String>,
    #[serde(default = "default_delivery_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_delivery_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub filters: Option<String>,
    pub file: Option<FileLoggingConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileLoggingConfig {
    pub path: String,
    pub max_lines: u32,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        let config_str = std::fs::read_to_string(config_path)?;
        if config_str.is_empty() {
            return Err(format!("{} is empty", config_path).into());
        }

        let config: Config = toml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.relay.heartbeat_interval_ms * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_client_convention() {
        let config = Config::default();
        assert_eq!(config.relay.heartbeat_interval_ms, 10_000);
        assert_eq!(config.heartbeat_timeout_ms(), 20_000);
        assert_eq!(
            config.relay.duplicate_publisher,
            DuplicatePublisherPolicy::Replace
        );
    }

    #[test]
    fn parses_partial_toml() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            password = "secret"

            [relay]
            max_subscribers = 8
            duplicate_publisher = "reject"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.relay.max_subscribers, 8);
        assert_eq!(
            config.relay.duplicate_publisher,
            DuplicatePublisherPolicy::Reject
        );
        // Unspecified knobs keep their defaults.
        assert_eq!(config.relay.subscriber_queue_capacity, 64);
        assert!(config.delivery.fulfillment_url.is_none());
    }
}
