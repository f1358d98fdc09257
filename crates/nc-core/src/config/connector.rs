//! Connector configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::backend::BackendConfig;
use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Environment variable overriding the configured API key
pub const API_KEY_ENV: &str = "NC_API_KEY";

/// Configuration for the connector daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// System-unique name of this connector instance
    pub name: String,

    /// Address the HTTP facade binds to
    pub bind_address: String,

    /// Shared secret required on every facade request
    pub api_key: Option<String>,

    /// Gateway endpoint handed to executions
    pub gateway_endpoint: String,

    /// Upper bound for any single backend call
    #[serde(with = "duration_secs")]
    pub backend_timeout: Duration,

    /// How long a cached node inventory may be served when the backend is down
    #[serde(with = "duration_secs")]
    pub inventory_staleness: Duration,

    /// Period of the reconciliation pass
    #[serde(with = "duration_secs")]
    pub reconcile_interval: Duration,

    /// Age after which a non-terminal record is checked against the backend.
    /// Must exceed `backend_timeout`.
    #[serde(with = "duration_secs")]
    pub stuck_age: Duration,

    /// How long terminal records are kept before eviction
    #[serde(with = "duration_secs")]
    pub retention: Duration,

    /// Append-only journal making the tracker durable (disabled when unset)
    pub journal_path: Option<PathBuf>,

    /// Backend family and its parameters
    pub backend: BackendConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: "nc-connector".to_string(),
            bind_address: "127.0.0.1:26512".to_string(),
            api_key: None,
            gateway_endpoint: String::new(),
            backend_timeout: Duration::from_secs(30),
            inventory_staleness: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(30),
            stuck_age: Duration::from_secs(120),
            retention: Duration::from_secs(3600),
            journal_path: None,
            backend: BackendConfig::default(),
        }
    }
}

impl ConnectorConfig {
    /// API key from the environment, falling back to the configured value
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.trim().is_empty()))
    }

    /// Reject settings the connector cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".to_string()));
        }
        if self.backend_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "backend_timeout must be greater than zero".to_string(),
            ));
        }
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reconcile_interval must be greater than zero".to_string(),
            ));
        }
        if self.stuck_age <= self.backend_timeout {
            return Err(ConfigError::Invalid(format!(
                "stuck_age ({:?}) must be greater than backend_timeout ({:?})",
                self.stuck_age, self.backend_timeout
            )));
        }
        self.backend.validate()?;

        tracing::debug!(
            "Configuration for {} is valid ({} backend)",
            self.name,
            self.backend.kind()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConnectorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = ConnectorConfig {
            reconcile_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_stuck_age_must_exceed_backend_timeout() {
        let config = ConnectorConfig {
            backend_timeout: Duration::from_secs(5),
            stuck_age: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = ConnectorConfig {
            stuck_age: Duration::from_secs(5),
            ..config
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = ConnectorConfig {
            stuck_age: Duration::from_secs(6),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ConnectorConfig = toml::from_str(
            r#"
            name = "lab"
            api_key = "secret"
            stuck_age = 10

            [backend]
            kind = "shell"
            node_id = "bench-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "lab");
        assert_eq!(config.stuck_age, Duration::from_secs(10));
        assert_eq!(config.retention, Duration::from_secs(3600));
        match config.backend {
            BackendConfig::Shell(shell) => {
                assert_eq!(shell.node_id, "bench-1");
                assert_eq!(shell.shell, "sh");
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn test_blank_api_key_is_ignored() {
        let config = ConnectorConfig {
            api_key: Some("  ".to_string()),
            ..Default::default()
        };
        if std::env::var(API_KEY_ENV).is_err() {
            assert!(config.resolve_api_key().is_none());
        }
    }
}
