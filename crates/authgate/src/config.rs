//! Server and client configuration.
//!
//! Both configs are plain structs with sensible defaults. Override the
//! fields you care about with struct update syntax, the builder setters
//! on [`ServerBuilder`](crate::ServerBuilder), or a JSON file:
//!
//! ```json
//! { "bind_addr": "0.0.0.0:1234", "max_connections": 100,
//!   "handshake_timeout": { "secs": 10, "nanos": 0 } }
//! ```
//!
//! Missing fields take their default. Durations use serde's standard
//! `{ secs, nanos }` form.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::ConfigError;

// ---------------------------------------------------------------------------
// OwnerMismatchPolicy
// ---------------------------------------------------------------------------

/// What to do when the identity service approves a ticket but reports a
/// license owner other than the validated identity (e.g. a borrowed or
/// family-shared license).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerMismatchPolicy {
    /// Treat it as an authentication failure.
    #[default]
    Reject,
    /// Accept the session and log a warning.
    Allow,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,

    /// Hard admission limit. Connection attempts above it are rejected
    /// with "server full", never queued.
    pub max_connections: usize,

    /// Largest ticket (in bytes) a frame may declare.
    pub max_ticket_len: usize,

    /// How long a connection may sit in one handshake step before it is
    /// closed. `None` waits forever.
    pub handshake_timeout: Option<Duration>,

    /// How often the transport is polled.
    pub poll_interval: Duration,

    /// Upper bound on events and on messages drained per poll.
    pub max_messages_per_poll: usize,

    /// Capacity of the validation response queue.
    pub event_queue_depth: usize,

    pub owner_mismatch: OwnerMismatchPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1234".to_string(),
            max_connections: 100,
            max_ticket_len: 1024,
            handshake_timeout: Some(Duration::from_secs(10)),
            poll_interval: Duration::from_millis(10),
            max_messages_per_poll: 32,
            event_queue_depth: 256,
            owner_mismatch: OwnerMismatchPolicy::Reject,
        }
    }
}

impl ServerConfig {
    /// Parses a config from JSON and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("max_connections", self.max_connections)?;
        positive("max_ticket_len", self.max_ticket_len)?;
        positive("max_messages_per_poll", self.max_messages_per_poll)?;
        positive("event_queue_depth", self.event_queue_depth)?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be non-zero".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How often [`Client::next_event`](crate::Client::next_event) polls.
    pub poll_interval: Duration,

    pub max_messages_per_poll: usize,

    /// Deadline for [`Client::authenticate`](crate::Client::authenticate).
    pub auth_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_messages_per_poll: 20,
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("max_messages_per_poll", self.max_messages_per_poll)?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be non-zero".into()));
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

fn positive(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{field} must be positive")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();

        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_ticket_len, 1024);
        assert_eq!(config.max_messages_per_poll, 32);
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.owner_mismatch, OwnerMismatchPolicy::Reject);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_partial_json_keeps_defaults() {
        let config = ServerConfig::from_json_str(
            r#"{ "max_connections": 2, "owner_mismatch": "allow", "handshake_timeout": null }"#,
        )
        .unwrap();

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.owner_mismatch, OwnerMismatchPolicy::Allow);
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(config.max_ticket_len, 1024);
    }

    #[test]
    fn test_server_config_rejects_zero_capacity() {
        let err = ServerConfig::from_json_str(r#"{ "max_connections": 0 }"#).unwrap_err();

        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("max_connections")));
    }

    #[test]
    fn test_server_config_rejects_malformed_json() {
        assert!(matches!(
            ServerConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_round_trips_through_file() {
        let path = std::env::temp_dir().join(format!(
            "authgate-client-config-{}.json",
            std::process::id()
        ));
        let config = ClientConfig {
            auth_timeout: Duration::from_millis(1500),
            ..ClientConfig::default()
        };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = ClientConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_config_file_reports_path() {
        let err = ServerConfig::from_json_file("/nonexistent/authgate.json").unwrap_err();

        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/authgate.json"));
    }
}
