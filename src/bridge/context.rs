//! Startup context wiring the bridge together
//!
//! `BridgeContext` is built once from the loaded configuration and the registered
//! strategies. It owns the connection manager, the dispatch registry and the
//! running inbound listener, and hands out publishers bound to the producer session.

use super::listener::InboundListener;
use super::publisher::Publisher;
use crate::config::BridgeConfig;
use crate::dispatch::{DispatchRegistry, Dispatcher};
use crate::error::{BridgeError, BridgeResult};
use crate::observability::events::EventBus;
use crate::transport::mqtt::{qos_from_level, ConnectionManager, ConnectionState, MqttSession};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Explicit context for one bridge process
pub struct BridgeContext {
    manager: ConnectionManager,
    registry: Arc<DispatchRegistry>,
    events: EventBus,
    listener: Mutex<Option<InboundListener>>,
}

impl BridgeContext {
    /// Build the sessions and validate the consumer QoS; nothing connects yet
    pub fn new(
        config: BridgeConfig,
        registry: DispatchRegistry,
        events: EventBus,
    ) -> BridgeResult<Self> {
        qos_from_level(config.mqtt.qos)?;
        let manager = ConnectionManager::new(config.mqtt, events.clone())?;
        info!(patterns = registry.len(), "Bridge context created");

        Ok(Self {
            manager,
            registry: Arc::new(registry),
            events,
            listener: Mutex::new(None),
        })
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Connect both sessions and start consuming
    ///
    /// The consumer subscribes to `consumer_default_topics` at the configured QoS.
    /// If the listener cannot start, both sessions are closed again.
    pub async fn connect(&self) -> BridgeResult<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Err(BridgeError::invalid_input("bridge is already connected"));
        }

        self.manager.connect().await?;

        let inbound = match self.manager.take_inbound() {
            Some(inbound) => inbound,
            None => {
                // A previous listener owned it and is gone
                if let Err(close_err) = self.manager.shutdown().await {
                    warn!(error = %close_err, "Sessions did not close cleanly");
                }
                return Err(BridgeError::invalid_input("inbound channel already taken"));
            }
        };

        let config = self.manager.config();
        let qos = qos_from_level(config.qos)?;
        let dispatcher = Dispatcher::new(self.registry.clone(), self.events.clone());

        match InboundListener::start(
            self.manager.consumer(),
            inbound,
            dispatcher,
            config.consumer_default_topics.clone(),
            qos,
        )
        .await
        {
            Ok(started) => {
                *listener = Some(started);
                info!("Bridge connected and listening");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Inbound listener failed to start");
                if let Err(close_err) = self.manager.shutdown().await {
                    warn!(error = %close_err, "Sessions did not close cleanly");
                }
                Err(e.into())
            }
        }
    }

    /// Publisher bound to the producer session and its configured defaults
    pub fn publisher(&self) -> BridgeResult<Publisher<MqttSession>> {
        Ok(Publisher::from_config(
            self.manager.producer(),
            self.manager.config(),
            self.events.clone(),
        )?)
    }

    /// Resolves once either session gives up reconnecting
    pub async fn wait_for_permanent_failure(&self) -> ConnectionState {
        let mut producer = self.manager.producer().state_receiver();
        let mut consumer = self.manager.consumer().state_receiver();

        loop {
            let states = [
                producer.borrow_and_update().clone(),
                consumer.borrow_and_update().clone(),
            ];
            for state in states {
                if matches!(state, ConnectionState::PermanentlyFailed(_)) {
                    return state;
                }
            }
            let closed = tokio::select! {
                changed = producer.changed() => changed.is_err(),
                changed = consumer.changed() => changed.is_err(),
            };
            if closed {
                break;
            }
        }
        // A dropped sender means the session is gone for good
        ConnectionState::Closed
    }

    /// Stop the listener, then close both sessions
    pub async fn shutdown(&self) -> BridgeResult<()> {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }
        self.manager.shutdown().await?;
        info!("Bridge shut down");
        Ok(())
    }
}
