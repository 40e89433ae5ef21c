//! Inbound listener
//!
//! Subscribes the consumer session to the configured filters and feeds every
//! received message through the dispatcher, one at a time and in arrival order.
//! A second task watches the session state and re-issues the subscriptions
//! whenever the session comes back after an outage.

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::observability::metrics::metrics;
use crate::protocol::InboundEnvelope;
use crate::transport::mqtt::{ConnectionState, HealthMonitor, MqttError};
use crate::transport::InboundTransport;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Running listener; dropping it stops both background tasks
pub struct InboundListener {
    dispatch_task: JoinHandle<()>,
    resubscribe_task: JoinHandle<()>,
}

impl InboundListener {
    /// Subscribe and start dispatching
    ///
    /// The dispatch loop starts before the initial SUBSCRIBE so that nothing
    /// delivered right after the SubAck waits on it. A failed initial subscription
    /// stops the listener and is returned.
    pub async fn start<T>(
        transport: Arc<T>,
        inbound: mpsc::Receiver<InboundEnvelope>,
        dispatcher: Dispatcher,
        filters: Vec<String>,
        qos: QoS,
    ) -> Result<Self, MqttError>
    where
        T: InboundTransport + 'static,
    {
        let dispatch_task = tokio::spawn(dispatch_loop(inbound, dispatcher));

        // Mark the state seen before the SUBSCRIBE so a reconnect racing it still notifies
        let mut state_rx = transport.state_receiver();
        let initial = state_rx.borrow_and_update().clone();

        if let Err(e) = transport.subscribe(&filters, qos).await {
            dispatch_task.abort();
            return Err(e);
        }
        info!(
            client_id = %transport.client_id(),
            filters = ?filters,
            "Inbound listener subscribed"
        );

        let resubscribe_task = tokio::spawn(resubscribe_on_recovery(
            transport, state_rx, initial, filters, qos,
        ));

        Ok(Self {
            dispatch_task,
            resubscribe_task,
        })
    }

    /// Whether the dispatch loop is still consuming messages
    pub fn is_running(&self) -> bool {
        !self.dispatch_task.is_finished()
    }

    /// Stop both tasks and wait for them to end
    pub async fn stop(mut self) {
        self.dispatch_task.abort();
        self.resubscribe_task.abort();
        // Cancellation is the expected outcome
        let _ = (&mut self.dispatch_task).await;
        let _ = (&mut self.resubscribe_task).await;
        info!("Inbound listener stopped");
    }
}

impl Drop for InboundListener {
    fn drop(&mut self) {
        self.dispatch_task.abort();
        self.resubscribe_task.abort();
    }
}

/// Dispatch each envelope in arrival order until the channel closes
async fn dispatch_loop(mut inbound: mpsc::Receiver<InboundEnvelope>, dispatcher: Dispatcher) {
    while let Some(envelope) = inbound.recv().await {
        metrics().record_received();
        let topic = envelope.topic.clone();
        match dispatcher.dispatch(envelope).await {
            DispatchOutcome::Handled { pattern } => {
                debug!(topic = %topic, pattern = %pattern, "Message handled");
            }
            // Both already reported through the event bus
            DispatchOutcome::Unrouted | DispatchOutcome::Failed { .. } => {}
        }
    }
    debug!("Inbound channel closed, dispatch loop ending");
}

/// Re-issue subscriptions every time the session recovers
///
/// `initial` is the state `state_rx` was last marked seen at.
async fn resubscribe_on_recovery<T>(
    transport: Arc<T>,
    mut state_rx: watch::Receiver<ConnectionState>,
    initial: ConnectionState,
    filters: Vec<String>,
    qos: QoS,
) where
    T: InboundTransport + 'static,
{
    let mut last = initial;

    while state_rx.changed().await.is_ok() {
        let current = state_rx.borrow_and_update().clone();

        if HealthMonitor::is_recovery(&last, &current) {
            info!(client_id = %transport.client_id(), "Session recovered, re-subscribing");
            if let Err(e) = transport.subscribe(&filters, qos).await {
                // The session already emitted SubscriptionFailed
                warn!(client_id = %transport.client_id(), error = %e, "Re-subscription failed");
            }
        }

        if current.is_terminal() {
            break;
        }
        last = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchRegistry, HandlerStrategy};
    use crate::observability::events::EventBus;
    use crate::testing::{MockTransport, RecordingHandler};
    use std::time::Duration;

    fn dispatcher(handler: Arc<RecordingHandler>) -> Dispatcher {
        let strategy: Arc<dyn HandlerStrategy> = handler;
        let registry = DispatchRegistry::builder().strategy(strategy).build().unwrap();
        Dispatcher::new(Arc::new(registry), EventBus::new())
    }

    #[tokio::test]
    async fn test_start_subscribes_configured_filters() {
        let transport = Arc::new(MockTransport::connected());
        let (_tx, rx) = mpsc::channel(8);
        let filters = vec!["/api/v1/#".to_string(), "/device/+/resp".to_string()];

        let listener = InboundListener::start(
            transport.clone(),
            rx,
            dispatcher(RecordingHandler::new("/api/.*")),
            filters.clone(),
            QoS::AtLeastOnce,
        )
        .await
        .unwrap();

        assert_eq!(transport.subscribe_calls().len(), 1);
        assert_eq!(transport.subscribe_calls()[0].filters, filters);
        assert_eq!(transport.subscribe_calls()[0].qos, QoS::AtLeastOnce);
        assert!(listener.is_running());
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_failed_initial_subscription_is_returned() {
        let transport = Arc::new(MockTransport::connected());
        transport.fail_subscriptions(true);
        let (_tx, rx) = mpsc::channel(8);

        let result = InboundListener::start(
            transport,
            rx,
            dispatcher(RecordingHandler::new("/api/.*")),
            vec!["/api/v1/#".to_string()],
            QoS::AtLeastOnce,
        )
        .await;
        assert!(matches!(result, Err(MqttError::SubscriptionFailed(_))));
    }

    #[tokio::test]
    async fn test_messages_dispatched_in_order() {
        let transport = Arc::new(MockTransport::connected());
        let handler = RecordingHandler::new("/api/v1/.*");
        let (tx, rx) = mpsc::channel(8);

        let listener = InboundListener::start(
            transport,
            rx,
            dispatcher(handler.clone()),
            vec!["/api/v1/#".to_string()],
            QoS::AtMostOnce,
        )
        .await
        .unwrap();

        for n in 0..3 {
            tx.send(InboundEnvelope::new("/api/v1/x", format!("msg-{n}")))
                .await
                .unwrap();
        }
        handler.wait_for_calls(3).await;
        assert_eq!(handler.payloads(), vec!["msg-0", "msg-1", "msg-2"]);
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnect() {
        let transport = Arc::new(MockTransport::connected());
        let (_tx, rx) = mpsc::channel(8);

        let listener = InboundListener::start(
            transport.clone(),
            rx,
            dispatcher(RecordingHandler::new("/api/.*")),
            vec!["/api/v1/#".to_string()],
            QoS::AtLeastOnce,
        )
        .await
        .unwrap();

        transport.set_state(ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.set_state(ConnectionState::Reconnecting(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.set_state(ConnectionState::Connected);

        tokio::time::timeout(
            Duration::from_secs(5),
            transport.wait_for_subscribe_calls(2),
        )
        .await
        .expect("listener should re-subscribe after recovery");

        let calls = transport.subscribe_calls();
        assert_eq!(calls[1].filters, vec!["/api/v1/#".to_string()]);
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_before_watcher_runs_still_resubscribes() {
        let transport = Arc::new(MockTransport::connected());
        let mut state_rx = transport.state_receiver();
        let initial = state_rx.borrow_and_update().clone();

        // Drop and reconnect complete before the watcher task is polled
        transport.set_state(ConnectionState::Reconnecting(1));
        transport.set_state(ConnectionState::Connected);

        let watcher = tokio::spawn(resubscribe_on_recovery(
            transport.clone(),
            state_rx,
            initial,
            vec!["/api/v1/#".to_string()],
            QoS::AtLeastOnce,
        ));

        tokio::time::timeout(
            Duration::from_secs(5),
            transport.wait_for_subscribe_calls(1),
        )
        .await
        .expect("watcher should re-subscribe for a reconnect it did not see in full");
        assert_eq!(transport.subscribe_calls()[0].filters, vec!["/api/v1/#".to_string()]);
        watcher.abort();
    }

    #[tokio::test]
    async fn test_watcher_ends_when_session_closes() {
        let transport = Arc::new(MockTransport::connected());
        let mut state_rx = transport.state_receiver();
        let initial = state_rx.borrow_and_update().clone();
        let watcher = tokio::spawn(resubscribe_on_recovery(
            transport.clone(),
            state_rx,
            initial,
            vec!["/a/#".to_string()],
            QoS::AtMostOnce,
        ));

        transport.set_state(ConnectionState::Closed);
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should stop on Closed")
            .unwrap();
        assert!(transport.subscribe_calls().is_empty());
    }
}
