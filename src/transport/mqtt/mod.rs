//! MQTT transport built on rumqttc
//!
//! Pure logic is kept apart from I/O:
//!
//! - [`connection`] - broker URIs, client options, state and the reconnect policy
//! - [`message_handler`] - event routing, payload decoding, SubAck interpretation
//! - [`health_monitor`] - state transitions and reconnection decisions
//! - [`session`] - one managed client per client ID, with its supervisor task
//! - [`manager`] - the producer and consumer sessions of the process
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_bridge::config::BridgeConfig;
//! use mqtt_bridge::observability::EventBus;
//! use mqtt_bridge::transport::mqtt::ConnectionManager;
//!
//! # tokio_test::block_on(async {
//! let config = BridgeConfig::load_from_file(std::path::Path::new("bridge.toml"))?;
//! let manager = ConnectionManager::new(config.mqtt, EventBus::with_defaults())?;
//! manager.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod health_monitor;
pub mod manager;
pub mod message_handler;
pub mod session;

pub use connection::{
    configure_mqtt_options, parse_endpoints, qos_from_level, qos_level, BrokerEndpoint,
    ConnectionState, Credentials, MqttError, ReconnectPolicy,
};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use manager::ConnectionManager;
pub use message_handler::{EventRoute, MessageHandler, SubscriptionResult};
pub use session::MqttSession;
