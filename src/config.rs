//! Per-connector dispatch configuration.
//!
//! Values arrive from deployment config as JSON or from
//! `QORE_DISPATCH_<CONNECTOR>_<KEY>` environment variables.

use std::time::Duration;

use qore_core::{EngineError, EngineResult, Request};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "QORE_DISPATCH";

/// Limits and behavior flags for one connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Maximum work items executing at once.
    pub max_connections: usize,
    /// Rows per batch when the request does not ask for a size.
    pub default_fetch_size: usize,
    /// Read-only source: update commands are refused and transactions are not enlisted.
    pub immutable: bool,
    /// Whether cursors may keep their connection open after the last row.
    pub keep_alive: bool,
    pub cancel_grace_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Back-off for "not available" signals that carry no hint.
    pub retry_delay_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            default_fetch_size: 256,
            immutable: false,
            keep_alive: true,
            cancel_grace_ms: 5_000,
            shutdown_grace_ms: 30_000,
            retry_delay_ms: 50,
        }
    }
}

impl ConnectorConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.default_fetch_size = fetch_size;
        self
    }

    pub fn with_immutable(mut self, immutable: bool) -> Self {
        self.immutable = immutable;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Parses a JSON document; missing keys take their defaults.
    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| EngineError::validation(format!("Invalid connector config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `QORE_DISPATCH_<CONNECTOR>_<KEY>` variables.
    pub fn from_env(connector: &str) -> EngineResult<Self> {
        Self::from_lookup(connector, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        connector: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> EngineResult<Self> {
        let mut config = Self::default();
        let var = |key: &str| lookup(&env_key(connector, key));

        if let Some(v) = var("MAX_CONNECTIONS") {
            config.max_connections = parse_number(&v, "MAX_CONNECTIONS")?;
        }
        if let Some(v) = var("FETCH_SIZE") {
            config.default_fetch_size = parse_number(&v, "FETCH_SIZE")?;
        }
        if let Some(v) = var("IMMUTABLE") {
            config.immutable = parse_bool(&v);
        }
        if let Some(v) = var("KEEP_ALIVE") {
            config.keep_alive = parse_bool(&v);
        }
        if let Some(v) = var("CANCEL_GRACE_MS") {
            config.cancel_grace_ms = parse_number(&v, "CANCEL_GRACE_MS")?;
        }
        if let Some(v) = var("SHUTDOWN_GRACE_MS") {
            config.shutdown_grace_ms = parse_number(&v, "SHUTDOWN_GRACE_MS")?;
        }
        if let Some(v) = var("RETRY_DELAY_MS") {
            config.retry_delay_ms = parse_number(&v, "RETRY_DELAY_MS")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_connections == 0 {
            return Err(EngineError::validation("max_connections must be at least 1"));
        }
        if self.default_fetch_size == 0 {
            return Err(EngineError::validation("default_fetch_size must be at least 1"));
        }
        Ok(())
    }

    /// Effective batch size for `request`, never zero.
    pub fn fetch_size_for(&self, request: &Request) -> usize {
        request
            .fetch_size
            .unwrap_or(self.default_fetch_size)
            .max(1)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn env_key(connector: &str, key: &str) -> String {
    let connector: String = connector
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ENV_PREFIX}_{connector}_{key}")
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str) -> EngineResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| EngineError::validation(format!("{key} must be a number, got '{value}'")))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConnectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.cancel_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_fills_missing_keys() {
        let config = ConnectorConfig::from_json(r#"{"max_connections": 2, "immutable": true}"#)
            .expect("should parse");
        assert_eq!(config.max_connections, 2);
        assert!(config.immutable);
        assert_eq!(config.default_fetch_size, 256);
    }

    #[test]
    fn test_from_json_rejects_zero_limit() {
        let err = ConnectorConfig::from_json(r#"{"max_connections": 0}"#).unwrap_err();
        assert!(matches!(err, EngineError::ValidationError { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<String, String> = [
            ("QORE_DISPATCH_SALES_PG_MAX_CONNECTIONS", "3"),
            ("QORE_DISPATCH_SALES_PG_KEEP_ALIVE", "off"),
            ("QORE_DISPATCH_SALES_PG_RETRY_DELAY_MS", "5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config =
            ConnectorConfig::from_lookup("sales-pg", |key| vars.get(key).cloned()).unwrap();
        assert_eq!(config.max_connections, 3);
        assert!(!config.keep_alive);
        assert_eq!(config.retry_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result = ConnectorConfig::from_lookup("x", |key| {
            (key == "QORE_DISPATCH_X_FETCH_SIZE").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }
}
