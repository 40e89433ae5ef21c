//! Pure message routing and processing logic for MQTT events
//!
//! Classifies event-loop output, decodes inbound payloads and interprets
//! subscription acknowledgements. No I/O happens here.

use crate::protocol::InboundEnvelope;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use tracing::warn;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    success: connack.code == ConnectReturnCode::Success,
                    code: format!("{:?}", connack.code),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    return_codes: suback
                        .return_codes
                        .iter()
                        .map(|code| match code {
                            SubscribeReasonCode::Success(qos) => Some(*qos),
                            SubscribeReasonCode::Failure => None,
                        })
                        .collect(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::OutgoingDisconnect,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Decode a payload as UTF-8, replacing invalid sequences
    pub fn decode_payload(topic: &str, payload: &[u8]) -> String {
        match std::str::from_utf8(payload) {
            Ok(text) => text.to_string(),
            Err(e) => {
                warn!(topic = %topic, error = %e, "Inbound payload is not valid UTF-8, decoding lossily");
                String::from_utf8_lossy(payload).into_owned()
            }
        }
    }

    /// Build the envelope handed to the dispatcher
    pub fn to_envelope(topic: &str, payload: &[u8]) -> InboundEnvelope {
        InboundEnvelope::new(topic, Self::decode_payload(topic, payload))
    }

    /// Pair each requested filter with its SubAck outcome
    ///
    /// Filters are sent in one SUBSCRIBE, so return codes line up by index.
    /// A missing code counts as a failure.
    pub fn match_subscription_results(
        filters: &[String],
        return_codes: &[Option<QoS>],
    ) -> Vec<SubscriptionResult> {
        filters
            .iter()
            .enumerate()
            .map(|(index, filter)| SubscriptionResult {
                filter: filter.clone(),
                granted: return_codes.get(index).copied().flatten(),
            })
            .collect()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker answered the CONNECT
    ConnectionAcknowledged { success: bool, code: String },
    /// Message received on a subscribed filter
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// SubAck with granted QoS per filter (None = rejected)
    SubscriptionAcknowledged {
        packet_id: u16,
        return_codes: Vec<Option<QoS>>,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Our own DISCONNECT left the client
    OutgoingDisconnect,
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Outcome of one filter in a SUBSCRIBE
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionResult {
    pub filter: String,
    pub granted: Option<QoS>,
}

impl SubscriptionResult {
    pub fn is_success(&self) -> bool {
        self.granted.is_some()
    }
}
