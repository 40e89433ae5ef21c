//! Message dispatch service
//!
//! Resolves an inbound envelope against the registry and runs the matching
//! strategy. Each handler runs in its own task so that an error or a panic is
//! confined to the message that caused it.

use super::registry::DispatchRegistry;
use super::strategy::HandlerError;
use crate::observability::events::{EventBus, SessionEvent};
use crate::observability::metrics::metrics;
use crate::protocol::InboundEnvelope;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, Instrument};

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Handled { pattern: String },
    Unrouted,
    Failed { pattern: String, error: HandlerError },
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, DispatchOutcome::Handled { .. })
    }
}

/// Routes envelopes to handler strategies
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<DispatchRegistry>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(registry: Arc<DispatchRegistry>, events: EventBus) -> Self {
        Self { registry, events }
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.registry
    }

    /// Resolve and handle one message; never fails
    pub async fn dispatch(&self, envelope: InboundEnvelope) -> DispatchOutcome {
        let span = crate::dispatch_span!(topic = %envelope.topic);
        self.dispatch_inner(envelope).instrument(span).await
    }

    async fn dispatch_inner(&self, envelope: InboundEnvelope) -> DispatchOutcome {
        let InboundEnvelope { topic, payload } = envelope;

        let Some(entry) = self.registry.resolve_entry(&topic) else {
            self.events.emit(SessionEvent::UnroutedMessage {
                timestamp: Utc::now(),
                topic,
            });
            return DispatchOutcome::Unrouted;
        };

        let pattern = entry.pattern().to_string();
        let handler = entry.handler().clone();
        debug!(pattern = %pattern, "Dispatching message to handler");

        let started = Instant::now();
        let joined = tokio::spawn(async move { handler.handle(&payload).await }).await;
        let result = joined.unwrap_or_else(|e| Err(join_error_to_handler_error(e)));

        match result {
            Ok(()) => {
                metrics().record_handled(started.elapsed());
                DispatchOutcome::Handled { pattern }
            }
            Err(error) => {
                self.events.emit(SessionEvent::HandlerFailed {
                    timestamp: Utc::now(),
                    topic,
                    pattern: pattern.clone(),
                    error: error.to_string(),
                });
                DispatchOutcome::Failed { pattern, error }
            }
        }
    }
}

fn join_error_to_handler_error(error: JoinError) -> HandlerError {
    if !error.is_panic() {
        return HandlerError::failed("handler task was cancelled");
    }
    let panic = error.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    HandlerError::Panicked { message }
}
