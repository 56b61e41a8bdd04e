//! Process-level configuration.
//!
//! Engine tunables live in [`SyncConfig`]; this adds what the binary needs to
//! reach the outside world. Values come from environment variables with
//! defaults suitable for local development.

use inventory_sync_runtime::{ConfigError, SyncConfig};
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: IpAddr,
    /// Port for the query and operator API
    pub port: u16,
    /// Port for the Prometheus `/metrics` endpoint
    pub metrics_port: u16,
    /// How long to wait for background tasks after a shutdown signal
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// Address of the API listener.
    #[must_use]
    pub const fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Address of the metrics listener.
    #[must_use]
    pub const fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.metrics_port)
    }
}

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Comma-separated broker addresses
    pub brokers: String,
    /// Topic carrying inventory change events
    pub topic: String,
    /// Consumer group ID
    pub consumer_group: String,
    /// Ingestion workers; events for one position always go to the same one
    pub workers: usize,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listeners
    pub server: ServerConfig,
    /// Event broker
    pub broker: BrokerConfig,
    /// Durable dead-letter storage; in memory when unset
    pub database_url: Option<String>,
    /// Base URL of the source-of-record HTTP API
    pub source_of_record_url: String,
    /// Engine tunables
    pub sync: SyncConfig,
}

impl ServiceConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an engine tunable is set but unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an engine tunable is set but unparsable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parsed = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        let server = ServerConfig {
            host: lookup("HOST")
                .and_then(|s| s.parse().ok())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: lookup("PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            metrics_port: lookup("METRICS_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(9090),
            shutdown_timeout: parsed("SHUTDOWN_TIMEOUT_SECS")
                .map_or(Duration::from_secs(30), Duration::from_secs),
        };

        let broker = BrokerConfig {
            brokers: lookup("REDPANDA_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
            topic: lookup("INVENTORY_TOPIC").unwrap_or_else(|| "inventory-events".to_string()),
            consumer_group: lookup("CONSUMER_GROUP")
                .unwrap_or_else(|| "inventory-sync".to_string()),
            workers: lookup("INGEST_WORKERS")
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
        };

        Ok(Self {
            server,
            broker,
            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            source_of_record_url: lookup("SOURCE_OF_RECORD_URL")
                .unwrap_or_else(|| "http://localhost:8000".to_string()),
            sync: SyncConfig::try_from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_suit_local_development() {
        let config = ServiceConfig::from_lookup(vars(&[])).unwrap();

        assert_eq!(config.server.api_addr().to_string(), "0.0.0.0:8080");
        assert_eq!(config.server.metrics_addr().port(), 9090);
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.broker.brokers, "localhost:9092");
        assert_eq!(config.broker.topic, "inventory-events");
        assert_eq!(config.broker.workers, 4);
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn variables_override_defaults() {
        let config = ServiceConfig::from_lookup(vars(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "3000"),
            ("SHUTDOWN_TIMEOUT_SECS", "5"),
            ("REDPANDA_BROKERS", "kafka-1:9092,kafka-2:9092"),
            ("INGEST_WORKERS", "16"),
            ("DATABASE_URL", "postgres://db/inventory"),
            ("SOURCE_OF_RECORD_URL", "http://erp.internal"),
            ("INVENTORY_AUTO_CORRECT_THRESHOLD", "2"),
        ]))
        .unwrap();

        assert_eq!(config.server.api_addr().to_string(), "127.0.0.1:3000");
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.broker.brokers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.broker.workers, 16);
        assert_eq!(config.database_url.as_deref(), Some("postgres://db/inventory"));
        assert_eq!(config.source_of_record_url, "http://erp.internal");
        assert_eq!(config.sync.auto_correct_threshold, 2);
    }

    #[test]
    fn zero_workers_and_blank_database_fall_back() {
        let config =
            ServiceConfig::from_lookup(vars(&[("INGEST_WORKERS", "0"), ("DATABASE_URL", " ")]))
                .unwrap();
        assert_eq!(config.broker.workers, 4);
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn unparsable_engine_tunable_is_an_error() {
        let err = ServiceConfig::from_lookup(vars(&[("INVENTORY_MAX_RETRY_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Unparsable { .. }));
    }
}
