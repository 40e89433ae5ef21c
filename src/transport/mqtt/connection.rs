//! Pure connection state management for MQTT sessions
//!
//! Broker URI parsing, option construction, the reconnect backoff policy and the
//! transport error type. Nothing in here touches the network.

use crate::config::{ConfigError, SessionConfig};
use rumqttc::{LastWill, MqttOptions, QoS, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for one MQTT session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected yet (or connect() failed)
    Disconnected,
    /// Initial connection in progress
    Connecting,
    /// ConnAck received; publish and subscribe allowed
    Connected,
    /// Dropped; waiting for or running reconnect attempt N
    Reconnecting(u32),
    /// Gave up reconnecting
    PermanentlyFailed(String),
    /// Shut down explicitly
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::PermanentlyFailed(_) | ConnectionState::Closed
        )
    }
}

/// Exponential reconnect backoff: 1s, 2s, 4s ... capped at 120s
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Maximum consecutive attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            max_attempts: None, // Unlimited retries by default
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            ..Self::default()
        }
    }

    /// Delay before the given 1-based attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Total wait across all attempts, or None when retries are unlimited
    pub fn max_total_delay(&self) -> Option<Duration> {
        self.max_attempts
            .map(|max| (1..=max).map(|attempt| self.delay_for_attempt(attempt)).sum())
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("No broker hosts configured")]
    NoBrokers,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Publishing to '{topic}' failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Disconnect did not complete within {0:?}")]
    DisconnectTimeout(Duration),
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Session '{0}' already started")]
    AlreadyStarted(String),
    #[error("Credentials unavailable: {0}")]
    Credentials(#[from] ConfigError),
}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub uri: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Parse `tcp://`, `mqtt://`, `ssl://` or `mqtts://` URIs
    pub fn parse(uri: &str) -> Result<Self, MqttError> {
        let url = Url::parse(uri).map_err(|_| MqttError::InvalidBrokerUrl(uri.to_string()))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            _ => return Err(MqttError::InvalidBrokerUrl(uri.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(uri.to_string()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            uri: uri.to_string(),
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Parse every configured host, failing on the first bad entry
pub fn parse_endpoints(hosts: &[String]) -> Result<Vec<BrokerEndpoint>, MqttError> {
    if hosts.is_empty() {
        return Err(MqttError::NoBrokers);
    }
    hosts.iter().map(|h| BrokerEndpoint::parse(h)).collect()
}

/// Map a numeric QoS level onto the rumqttc enum
pub fn qos_from_level(level: u8) -> Result<QoS, MqttError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Username and password sent in CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Resolve from configuration; `None` when no username is set
    ///
    /// Reads `password_env` from the environment on every call.
    pub fn from_config(config: &SessionConfig) -> Result<Option<Self>, ConfigError> {
        let password = config.resolve_password()?;
        Ok(config.username.as_ref().map(|username| Self {
            username: username.clone(),
            password: password.unwrap_or_default(),
        }))
    }
}

/// Pure function to build MQTT options for one client ID and endpoint
///
/// Applies clean-session, credentials, keep-alive and last-will exactly as
/// configured; the same options are used for every (re)connect of a session.
pub fn configure_mqtt_options(
    client_id: &str,
    endpoint: &BrokerEndpoint,
    config: &SessionConfig,
    credentials: Option<&Credentials>,
) -> Result<MqttOptions, MqttError> {
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_clean_session(config.clean_session);
    mqtt_options.set_keep_alive(config.keep_alive());

    if let Some(will) = &config.will {
        let qos = qos_from_level(will.qos)?;
        mqtt_options.set_last_will(LastWill::new(
            &will.topic,
            will.content.as_bytes().to_vec(),
            qos,
            will.retained,
        ));
    }

    Ok(mqtt_options)
}
