//! Transport layer between the bridge and the broker
//!
//! The publisher and the inbound listener talk to sessions through these traits,
//! which keeps them testable without a broker.

use crate::protocol::OutboundMessage;
use mqtt::{ConnectionState, MqttError, MqttSession};
use rumqttc::QoS;
use tokio::sync::watch;

pub mod mqtt;

/// Outbound half of a session: hand messages to the broker
#[async_trait::async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Queue `message` for delivery; errors if no connection is established
    async fn send(&self, message: OutboundMessage) -> Result<(), MqttError>;

    /// Current connection state
    fn state(&self) -> ConnectionState;
}

/// Inbound half of a session: manage subscriptions and watch connectivity
#[async_trait::async_trait]
pub trait InboundTransport: Send + Sync {
    fn client_id(&self) -> &str;

    /// Subscribe to every filter at `qos`, waiting for the broker's answer
    async fn subscribe(&self, filters: &[String], qos: QoS) -> Result<(), MqttError>;

    /// Receiver that observes every state transition
    fn state_receiver(&self) -> watch::Receiver<ConnectionState>;
}

#[async_trait::async_trait]
impl OutboundTransport for MqttSession {
    async fn send(&self, message: OutboundMessage) -> Result<(), MqttError> {
        self.publish(message).await
    }

    fn state(&self) -> ConnectionState {
        MqttSession::state(self)
    }
}

#[async_trait::async_trait]
impl InboundTransport for MqttSession {
    fn client_id(&self) -> &str {
        MqttSession::client_id(self)
    }

    async fn subscribe(&self, filters: &[String], qos: QoS) -> Result<(), MqttError> {
        MqttSession::subscribe(self, filters, qos).await
    }

    fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        MqttSession::state_receiver(self)
    }
}
