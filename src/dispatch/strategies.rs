//! Built-in device strategies
//!
//! Both strategies log what they receive; applications register their own
//! strategies alongside or instead of these.

use super::strategy::{HandlerError, HandlerStrategy};
use crate::protocol::DeviceCommand;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Device data responses: `/api/v1/<device>mqtt/dataResp`
#[derive(Debug, Default)]
pub struct DataRespStrategy;

impl DataRespStrategy {
    pub const PATTERN: &'static str = "/api/v1/.*mqtt/dataResp";
}

#[async_trait]
impl HandlerStrategy for DataRespStrategy {
    fn topic_pattern(&self) -> &str {
        Self::PATTERN
    }

    async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        match serde_json::from_str::<DeviceCommand>(payload) {
            Ok(command) => info!(
                device_id = %command.device_id,
                payload = %payload,
                "Received device data response"
            ),
            Err(_) => info!(payload = %payload, "Received device data response"),
        }
        Ok(())
    }
}

/// Device data subscription requests: `/api/v1/<device>mqtt/dataSubscribe`
#[derive(Debug, Default)]
pub struct DataSubscribeStrategy;

impl DataSubscribeStrategy {
    pub const PATTERN: &'static str = "/api/v1/.*mqtt/dataSubscribe";
}

#[async_trait]
impl HandlerStrategy for DataSubscribeStrategy {
    fn topic_pattern(&self) -> &str {
        Self::PATTERN
    }

    async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        info!(payload = %payload, "DataSubscribeStrategy received message");
        Ok(())
    }
}

/// The strategies the `run` command registers by default
pub fn builtin_strategies() -> Vec<Arc<dyn HandlerStrategy>> {
    vec![
        Arc::new(DataRespStrategy),
        Arc::new(DataSubscribeStrategy),
    ]
}
