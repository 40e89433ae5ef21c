//! MQTT Bridge
//!
//! Connects an application to an MQTT broker through two managed sessions: a
//! producer for outbound messages and a consumer whose received messages are
//! routed to handler strategies by regex topic pattern.
//!
//! # Overview
//!
//! - Configuration loaded from TOML ([`config`])
//! - Managed rumqttc sessions with automatic reconnect ([`transport::mqtt`])
//! - Publishing with configured defaults ([`bridge::Publisher`])
//! - Topic-pattern dispatch with per-message failure isolation ([`dispatch`])
//! - Lifecycle events, metrics and health endpoints ([`observability`])
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_bridge::dispatch::{DispatchRegistry, FnHandler, HandlerStrategy};
//! use mqtt_bridge::protocol::{substitute_device_identity, DeviceCommand, TOPIC_DATA_RESP};
//! use std::sync::Arc;
//!
//! let handler: Arc<dyn HandlerStrategy> =
//!     Arc::new(FnHandler::new("/api/v1/.*mqtt/dataResp", |_payload| async { Ok(()) }));
//! let registry = DispatchRegistry::builder().strategy(handler).build().unwrap();
//! assert!(registry.resolve("/api/v1/42/mqtt/dataResp").is_some());
//!
//! let topic = substitute_device_identity(TOPIC_DATA_RESP, "42");
//! assert_eq!(topic, "/api/v1/42/mqtt/dataResp");
//! let payload = DeviceCommand::now("42").to_json().unwrap();
//! assert!(payload.contains("\"deviceId\":\"42\""));
//! ```

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use bridge::{BridgeContext, InboundListener, Publisher};
pub use config::{BridgeConfig, ConfigError, SessionConfig, WillConfig};
pub use dispatch::{DispatchRegistry, Dispatcher, HandlerError, HandlerStrategy};
pub use error::{BridgeError, BridgeResult};
pub use observability::events::{EventBus, SessionEvent, SessionObserver};
pub use protocol::*;
pub use transport::mqtt::{ConnectionManager, ConnectionState, MqttError, MqttSession};
