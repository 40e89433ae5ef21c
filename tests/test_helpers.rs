//! Test helpers and utilities for integration tests

use mqtt_bridge::config::{BridgeConfig, SessionConfig};
use mqtt_bridge::dispatch::{DispatchRegistry, Dispatcher, HandlerStrategy};
use mqtt_bridge::observability::{ChannelObserver, EventBus, SessionEvent};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Minimal valid configuration TOML
#[allow(dead_code)]
pub const MINIMAL_TOML: &str = r#"
[mqtt]
hosts = ["tcp://localhost:1883"]
producer_client_id = "bridge-producer"
producer_default_topic = "/api/v1/default"
consumer_client_id = "bridge-consumer"
consumer_default_topics = ["/api/v1/#"]
"#;

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config() -> SessionConfig {
    BridgeConfig::from_toml_str(MINIMAL_TOML)
        .expect("minimal config should be valid")
        .mqtt
}

/// Dispatcher over `handlers` whose events land in the returned receiver
#[allow(dead_code)]
pub fn recording_dispatcher(
    handlers: Vec<Arc<dyn HandlerStrategy>>,
) -> (Dispatcher, UnboundedReceiver<SessionEvent>) {
    let registry = DispatchRegistry::builder()
        .strategies(handlers)
        .build()
        .expect("test patterns should compile");
    let (observer, rx) = ChannelObserver::channel();
    let bus = EventBus::new().with_observer(observer);
    (Dispatcher::new(Arc::new(registry), bus), rx)
}

/// Drain every event emitted so far
#[allow(dead_code)]
pub fn drain_events(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
