//! Outbound/inbound message types and the device command payload

use chrono::NaiveDateTime;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};

/// A message ready to hand to the transport
///
/// Exists only for the duration of a send call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl OutboundMessage {
    /// Non-retained message; retained publishes are never produced by the bridge
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload: payload.into(),
            retain: false,
        }
    }
}

/// A message received on a subscribed filter, as handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub topic: String,
    pub payload: String,
}

impl InboundEnvelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Device command body published to device topics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    pub device_id: String,
    #[serde(default, with = "create_time_format")]
    pub create_time: Option<NaiveDateTime>,
}

impl DeviceCommand {
    /// Command stamped with the current local time
    pub fn now(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            create_time: Some(chrono::Local::now().naive_local()),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `yyyy-MM-dd HH:mm:ss` encoding for optional timestamps
mod create_time_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(time) => serializer.serialize_str(&time.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| NaiveDateTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom))
            .transpose()
    }
}
