//! Connection manager owning the producer and consumer sessions
//!
//! Both sessions share the same options (hosts, credentials, keep-alive,
//! clean-session, last-will) and differ only in client ID. The consumer session
//! feeds received messages into an inbound channel taken by the listener.

use super::connection::{ConnectionState, MqttError};
use super::session::MqttSession;
use crate::config::SessionConfig;
use crate::error::BridgeResult;
use crate::observability::events::EventBus;
use crate::protocol::InboundEnvelope;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Buffered inbound messages between the consumer session and the listener
const INBOUND_CAPACITY: usize = 256;

/// Owns the process's producer and consumer MQTT sessions
pub struct ConnectionManager {
    config: Arc<SessionConfig>,
    producer: Arc<MqttSession>,
    consumer: Arc<MqttSession>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEnvelope>>>,
}

impl ConnectionManager {
    /// Build both sessions; nothing connects yet
    ///
    /// Fails if a host URI is invalid. Credentials are resolved by `connect`.
    pub fn new(config: SessionConfig, events: EventBus) -> BridgeResult<Self> {
        let config = Arc::new(config);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let producer = MqttSession::new(
            config.producer_client_id.clone(),
            config.clone(),
            events.clone(),
        )?;

        let consumer = MqttSession::new(config.consumer_client_id.clone(), config.clone(), events)?
            .with_inbound(inbound_tx);

        Ok(Self {
            config,
            producer: Arc::new(producer),
            consumer: Arc::new(consumer),
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    pub fn producer(&self) -> Arc<MqttSession> {
        self.producer.clone()
    }

    pub fn consumer(&self) -> Arc<MqttSession> {
        self.consumer.clone()
    }

    /// Take the receiver of inbound messages; only the first call gets it
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundEnvelope>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Current (producer, consumer) states
    pub fn states(&self) -> (ConnectionState, ConnectionState) {
        (self.producer.state(), self.consumer.state())
    }

    /// Connect the producer, then the consumer
    pub async fn connect(&self) -> Result<(), MqttError> {
        self.producer.connect().await?;
        if let Err(e) = self.consumer.connect().await {
            // Leave nothing half-open behind
            if let Err(close_err) = self.producer.disconnect().await {
                warn!(error = %close_err, "Producer did not close cleanly");
            }
            return Err(e);
        }
        info!(
            producer = %self.producer.client_id(),
            consumer = %self.consumer.client_id(),
            "MQTT sessions established"
        );
        Ok(())
    }

    /// Disconnect both sessions, reporting the first failure
    pub async fn shutdown(&self) -> Result<(), MqttError> {
        let consumer = self.consumer.disconnect().await;
        let producer = self.producer.disconnect().await;
        info!("MQTT sessions closed");
        consumer.and(producer)
    }
}
