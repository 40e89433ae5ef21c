//! Bridge configuration loaded from TOML
//!
//! The `[mqtt]` table maps one-to-one onto [`SessionConfig`], the immutable set of
//! connection parameters owned by the connection manager. Secrets can be supplied
//! inline or through an environment variable named by `password_env`.

use crate::protocol::topics::{validate_filter, validate_publish_topic};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub mqtt: SessionConfig,
}

/// Connection parameters shared by the producer and consumer sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Broker URIs, tried in order (`tcp://`, `mqtt://`, `ssl://`, `mqtts://`)
    pub hosts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable holding the password; wins over `password`
    pub password_env: Option<String>,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Subscribe QoS and default publish QoS (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_interval: u64,
    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Disconnect/subscribe completion timeout in milliseconds
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout: u64,
    pub producer_client_id: String,
    pub producer_default_topic: String,
    pub consumer_client_id: String,
    /// MQTT topic filters the consumer subscribes to
    pub consumer_default_topics: Vec<String>,
    /// Give up after this many consecutive reconnect attempts (unset = never)
    pub max_reconnect_attempts: Option<u32>,
    pub will: Option<WillConfig>,
}

/// Last-will message registered with the broker at connect time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillConfig {
    pub topic: String,
    pub content: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retained: bool,
}

fn default_true() -> bool {
    true
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> u64 {
    20
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_completion_timeout() -> u64 {
    3000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.mqtt.validate()?;
        Ok(config)
    }

    /// Copy of the configuration that is safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some("***".to_string());
        }
        copy
    }
}

impl SessionConfig {
    /// Check the invariants the connection manager relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(invalid("at least one broker host is required"));
        }
        if self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(invalid("broker host entries must not be blank"));
        }
        validate_qos_level("qos", self.qos)?;

        if self.keep_alive_interval < 5 {
            return Err(invalid(format!(
                "keep_alive_interval must be at least 5 seconds, got {}",
                self.keep_alive_interval
            )));
        }
        if self.connection_timeout == 0 {
            return Err(invalid("connection_timeout must be greater than 0"));
        }
        if self.completion_timeout == 0 {
            return Err(invalid("completion_timeout must be greater than 0"));
        }

        if self.producer_client_id.is_empty() || self.consumer_client_id.is_empty() {
            return Err(invalid("producer and consumer client IDs must not be empty"));
        }
        if self.producer_client_id == self.consumer_client_id {
            return Err(invalid(format!(
                "producer and consumer must use distinct client IDs, both are '{}'",
                self.producer_client_id
            )));
        }
        validate_publish_topic(&self.producer_default_topic)
            .map_err(|e| invalid(format!("producer_default_topic: {e}")))?;

        if self.consumer_default_topics.is_empty() {
            return Err(invalid("consumer_default_topics must list at least one filter"));
        }
        for filter in &self.consumer_default_topics {
            validate_filter(filter).map_err(invalid)?;
        }

        if let Some(max) = self.max_reconnect_attempts {
            if max == 0 {
                return Err(invalid(
                    "max_reconnect_attempts must be greater than 0 or omitted for unlimited",
                ));
            }
        }

        if let Some(will) = &self.will {
            if will.topic.is_empty() {
                return Err(invalid("will.topic must not be empty"));
            }
            if will.topic.contains('+') || will.topic.contains('#') {
                return Err(invalid("will.topic must not contain wildcards"));
            }
            validate_qos_level("will.qos", will.qos)?;
        }

        Ok(())
    }

    /// Resolve the password, preferring `password_env` when configured
    pub fn resolve_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.password_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(self.password.clone()),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout)
    }
}

fn validate_qos_level(field: &str, qos: u8) -> Result<(), ConfigError> {
    if qos > 2 {
        return Err(invalid(format!("{field} must be 0, 1 or 2, got {qos}")));
    }
    Ok(())
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

#[cfg(test)]
impl SessionConfig {
    /// Minimal valid configuration for unit tests
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
hosts = ["tcp://localhost:1883"]
producer_client_id = "test-producer"
producer_default_topic = "/api/v1/default"
consumer_client_id = "test-consumer"
consumer_default_topics = ["/api/v1/#"]
"#;
        let config: BridgeConfig = toml::from_str(toml_content).expect("Test config should parse");
        config.mqtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
[mqtt]
hosts = ["tcp://broker-a:1883", "ssl://broker-b:8883"]
username = "admin"
password = "public"
clean_session = false
auto_reconnect = true
qos = 2
keep_alive_interval = 30
connection_timeout = 15
completion_timeout = 5000
producer_client_id = "bridge-producer"
producer_default_topic = "/api/v1/default"
consumer_client_id = "bridge-consumer"
consumer_default_topics = ["/api/v1/+/mqtt/dataResp", "/api/v1/#"]

[mqtt.will]
topic = "/api/v1/bridge/will"
content = "offline"
qos = 1
retained = true
"#;

    #[test]
    fn test_full_config() {
        let config = BridgeConfig::from_toml_str(FULL_CONFIG).unwrap();
        let mqtt = &config.mqtt;
        assert_eq!(mqtt.hosts.len(), 2);
        assert_eq!(mqtt.username.as_deref(), Some("admin"));
        assert!(!mqtt.clean_session);
        assert_eq!(mqtt.qos, 2);
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(30));
        assert_eq!(mqtt.connection_timeout(), Duration::from_secs(15));
        assert_eq!(mqtt.completion_timeout(), Duration::from_millis(5000));
        let will = mqtt.will.as_ref().unwrap();
        assert_eq!(will.content, "offline");
        assert!(will.retained);
    }

    #[test]
    fn test_defaults_applied() {
        let config = SessionConfig::test_config();
        assert!(config.clean_session);
        assert!(config.auto_reconnect);
        assert_eq!(config.qos, 1);
        assert_eq!(config.keep_alive_interval, 20);
        assert_eq!(config.connection_timeout, 10);
        assert_eq!(config.completion_timeout, 3000);
        assert!(config.will.is_none());
        assert!(config.max_reconnect_attempts.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_hosts_rejected() {
        let mut config = SessionConfig::test_config();
        config.hosts.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_qos_out_of_range_rejected() {
        let mut config = SessionConfig::test_config();
        config.qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shared_client_id_rejected() {
        let mut config = SessionConfig::test_config();
        config.consumer_client_id = config.producer_client_id.clone();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("distinct"));
    }

    #[test]
    fn test_bad_filter_rejected() {
        let mut config = SessionConfig::test_config();
        config.consumer_default_topics = vec!["/api/#/tail".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_topic_must_be_publishable() {
        for topic in ["", "/api/v1/#", "/api/v1/+/status", "/api/v1/${deviceIdentity}/mqtt/dataResp"] {
            let mut config = SessionConfig::test_config();
            config.producer_default_topic = topic.to_string();
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains("producer_default_topic"),
                "unexpected error for {topic:?}: {err}"
            );
        }
    }

    #[test]
    fn test_short_keep_alive_rejected() {
        let mut config = SessionConfig::test_config();
        config.keep_alive_interval = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_will_with_wildcard_rejected() {
        let mut config = SessionConfig::test_config();
        config.will = Some(WillConfig {
            topic: "/status/#".to_string(),
            content: "gone".to_string(),
            qos: 1,
            retained: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_password_from_env() {
        let mut config = SessionConfig::test_config();
        config.password = Some("inline".to_string());
        assert_eq!(config.resolve_password().unwrap().as_deref(), Some("inline"));

        config.password_env = Some("MQTT_BRIDGE_CONFIG_TEST_PASSWORD".to_string());
        assert!(matches!(
            config.resolve_password(),
            Err(ConfigError::EnvVarNotFound(_))
        ));

        std::env::set_var("MQTT_BRIDGE_CONFIG_TEST_PASSWORD", "from-env");
        assert_eq!(
            config.resolve_password().unwrap().as_deref(),
            Some("from-env")
        );
        std::env::remove_var("MQTT_BRIDGE_CONFIG_TEST_PASSWORD");
    }

    #[test]
    fn test_redacted_hides_password() {
        let config = BridgeConfig::from_toml_str(FULL_CONFIG).unwrap();
        let shown = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!shown.contains("public"));
        assert!(shown.contains("***"));
    }
}
