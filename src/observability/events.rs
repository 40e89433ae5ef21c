//! Session lifecycle and dispatch events
//!
//! Components never raise connection-level failures to their callers; they emit a
//! [`SessionEvent`] into an [`EventBus`] instead. Observers registered on the bus
//! decide what to do with it (log it, count it, forward it to a channel).

use super::metrics::metrics;
use chrono::{DateTime, Utc};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Observable events produced by the connection manager, listener and dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Initial connect or a reconnect attempt failed
    ConnectionFailed {
        timestamp: DateTime<Utc>,
        hosts: Vec<String>,
        username: Option<String>,
        client_id: String,
        cause: String,
    },
    Connected {
        timestamp: DateTime<Utc>,
        host: String,
        client_id: String,
    },
    /// An established session dropped
    ConnectionLost {
        timestamp: DateTime<Utc>,
        client_id: String,
        cause: String,
    },
    Reconnecting {
        timestamp: DateTime<Utc>,
        client_id: String,
        attempt: u32,
        delay: Duration,
    },
    Subscribed {
        timestamp: DateTime<Utc>,
        hosts: Vec<String>,
        username: Option<String>,
        client_id: String,
        filter: String,
        qos: u8,
    },
    SubscriptionFailed {
        timestamp: DateTime<Utc>,
        client_id: String,
        filter: String,
        reason: String,
    },
    PublishFailed {
        timestamp: DateTime<Utc>,
        topic: String,
        reason: String,
    },
    /// Inbound topic matched no registered pattern
    UnroutedMessage {
        timestamp: DateTime<Utc>,
        topic: String,
    },
    HandlerFailed {
        timestamp: DateTime<Utc>,
        topic: String,
        pattern: String,
        error: String,
    },
    Closed {
        timestamp: DateTime<Utc>,
        client_id: String,
    },
}

impl SessionEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::ConnectionFailed { timestamp, .. }
            | SessionEvent::Connected { timestamp, .. }
            | SessionEvent::ConnectionLost { timestamp, .. }
            | SessionEvent::Reconnecting { timestamp, .. }
            | SessionEvent::Subscribed { timestamp, .. }
            | SessionEvent::SubscriptionFailed { timestamp, .. }
            | SessionEvent::PublishFailed { timestamp, .. }
            | SessionEvent::UnroutedMessage { timestamp, .. }
            | SessionEvent::HandlerFailed { timestamp, .. }
            | SessionEvent::Closed { timestamp, .. } => *timestamp,
        }
    }

    /// Short machine-friendly name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::ConnectionFailed { .. } => "connection_failed",
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::ConnectionLost { .. } => "connection_lost",
            SessionEvent::Reconnecting { .. } => "reconnecting",
            SessionEvent::Subscribed { .. } => "subscribed",
            SessionEvent::SubscriptionFailed { .. } => "subscription_failed",
            SessionEvent::PublishFailed { .. } => "publish_failed",
            SessionEvent::UnroutedMessage { .. } => "unrouted_message",
            SessionEvent::HandlerFailed { .. } => "handler_failed",
            SessionEvent::Closed { .. } => "closed",
        }
    }
}

/// Receives every event emitted on an [`EventBus`]
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Fan-out of events to the registered observers
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with the logging and metrics observers already attached
    pub fn with_defaults() -> Self {
        Self::new()
            .with_observer(Arc::new(LoggingObserver))
            .with_observer(Arc::new(MetricsObserver))
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn subscribe(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Deliver `event` to every observer; a panicking observer is logged and skipped
    pub fn emit(&self, event: SessionEvent) {
        for observer in &self.observers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if delivered.is_err() {
                error!(event = event.kind(), "Session observer panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Writes events to the tracing subscriber
pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::ConnectionFailed {
                timestamp,
                hosts,
                username,
                client_id,
                cause,
            } => {
                error!(
                    date = %timestamp,
                    hosts = ?hosts,
                    username = username.as_deref().unwrap_or(""),
                    client_id = %client_id,
                    error = %cause,
                    "MQTT connection failed"
                );
            }
            SessionEvent::Connected {
                host, client_id, ..
            } => {
                info!(host = %host, client_id = %client_id, "MQTT session connected");
            }
            SessionEvent::ConnectionLost {
                client_id, cause, ..
            } => {
                warn!(client_id = %client_id, cause = %cause, "MQTT connection lost");
            }
            SessionEvent::Reconnecting {
                client_id,
                attempt,
                delay,
                ..
            } => {
                info!(
                    client_id = %client_id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling MQTT reconnection"
                );
            }
            SessionEvent::Subscribed {
                timestamp,
                hosts,
                username,
                filter,
                qos,
                ..
            } => {
                info!(
                    date = %timestamp,
                    hosts = ?hosts,
                    username = username.as_deref().unwrap_or(""),
                    filter = %filter,
                    qos = qos,
                    "MQTT subscription confirmed"
                );
            }
            SessionEvent::SubscriptionFailed {
                client_id,
                filter,
                reason,
                ..
            } => {
                error!(client_id = %client_id, filter = %filter, reason = %reason, "MQTT subscription failed");
            }
            SessionEvent::PublishFailed { topic, reason, .. } => {
                warn!(topic = %topic, reason = %reason, "Publish dropped");
            }
            SessionEvent::UnroutedMessage { topic, .. } => {
                warn!(topic = %topic, "No handler found for topic");
            }
            SessionEvent::HandlerFailed {
                topic,
                pattern,
                error,
                ..
            } => {
                error!(topic = %topic, pattern = %pattern, error = %error, "Handler failed");
            }
            SessionEvent::Closed { client_id, .. } => {
                info!(client_id = %client_id, "MQTT session closed");
            }
        }
    }
}

/// Updates the global metrics collector
pub struct MetricsObserver;

impl SessionObserver for MetricsObserver {
    fn on_event(&self, event: &SessionEvent) {
        let collector = metrics();
        match event {
            SessionEvent::ConnectionFailed { .. } => collector.record_connection_failure(),
            SessionEvent::Connected { .. } => collector.record_connection_established(),
            SessionEvent::ConnectionLost { .. } => collector.record_connection_lost(),
            SessionEvent::Reconnecting { .. } => collector.record_reconnect_attempt(),
            SessionEvent::Subscribed { .. } => collector.record_subscription(),
            SessionEvent::SubscriptionFailed { .. } => collector.record_subscription_failure(),
            SessionEvent::PublishFailed { .. } => collector.record_publish_failure(),
            SessionEvent::UnroutedMessage { .. } => collector.record_unrouted(),
            SessionEvent::HandlerFailed { .. } => collector.record_handler_failure(),
            SessionEvent::Closed { .. } => {}
        }
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SessionObserver for ChannelObserver {
    fn on_event(&self, event: &SessionEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}
