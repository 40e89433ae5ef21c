//! Outbound publishing with configured defaults
//!
//! Topic and QoS fall back to the producer defaults; the retained flag is always
//! false on this path. A send returns once the transport has queued the message.

use crate::config::SessionConfig;
use crate::observability::events::{EventBus, SessionEvent};
use crate::observability::metrics::metrics;
use crate::protocol::{validate_publish_topic, OutboundMessage};
use crate::transport::mqtt::{qos_from_level, MqttError};
use crate::transport::OutboundTransport;
use chrono::Utc;
use rumqttc::QoS;
use std::sync::Arc;
use tracing::debug;

/// Sends messages through an outbound transport
pub struct Publisher<T: OutboundTransport> {
    transport: Arc<T>,
    default_topic: String,
    default_qos: QoS,
    events: EventBus,
}

impl<T: OutboundTransport> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            default_topic: self.default_topic.clone(),
            default_qos: self.default_qos,
            events: self.events.clone(),
        }
    }
}

impl<T: OutboundTransport> Publisher<T> {
    pub fn new(
        transport: Arc<T>,
        default_topic: impl Into<String>,
        default_qos: QoS,
        events: EventBus,
    ) -> Self {
        Self {
            transport,
            default_topic: default_topic.into(),
            default_qos,
            events,
        }
    }

    /// Publisher using the producer defaults from `config`
    pub fn from_config(
        transport: Arc<T>,
        config: &SessionConfig,
        events: EventBus,
    ) -> Result<Self, MqttError> {
        Ok(Self::new(
            transport,
            config.producer_default_topic.clone(),
            qos_from_level(config.qos)?,
            events,
        ))
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    pub fn default_qos(&self) -> QoS {
        self.default_qos
    }

    /// Publish `payload` on `topic` at `qos`, defaulting either when `None`
    ///
    /// Fails without queueing anything if the topic is invalid or the session
    /// is not connected; the failure is also reported as a `PublishFailed` event.
    pub async fn publish(
        &self,
        topic: Option<&str>,
        qos: Option<QoS>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), MqttError> {
        let topic = topic.unwrap_or(self.default_topic.as_str());
        let qos = qos.unwrap_or(self.default_qos);

        if let Err(reason) = validate_publish_topic(topic) {
            self.report_failure(topic, &reason);
            return Err(MqttError::InvalidTopic(reason));
        }

        let message = OutboundMessage::new(topic, qos, payload);
        match self.transport.send(message).await {
            Ok(()) => {
                metrics().record_published();
                debug!(topic = %topic, qos = ?qos, "Message handed to transport");
                Ok(())
            }
            Err(e) => {
                self.report_failure(topic, &e.to_string());
                Err(e)
            }
        }
    }

    /// Publish on the default topic at the default QoS
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), MqttError> {
        self.publish(None, None, payload).await
    }

    /// Publish on `topic` at the default QoS
    pub async fn send_to(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), MqttError> {
        self.publish(Some(topic), None, payload).await
    }

    pub async fn send_with_qos(
        &self,
        topic: &str,
        qos: QoS,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), MqttError> {
        self.publish(Some(topic), Some(qos), payload).await
    }

    fn report_failure(&self, topic: &str, reason: &str) {
        self.events.emit(SessionEvent::PublishFailed {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            reason: reason.to_string(),
        });
    }
}
