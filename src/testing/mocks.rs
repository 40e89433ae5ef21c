//! Mock implementations for testing
//!
//! `MockTransport` stands in for an MQTT session on both the outbound and inbound
//! side; `RecordingHandler` is a handler strategy that remembers its payloads.

use crate::dispatch::{HandlerError, HandlerStrategy};
use crate::protocol::OutboundMessage;
use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{InboundTransport, OutboundTransport};
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One recorded subscribe request
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeCall {
    pub filters: Vec<String>,
    pub qos: QoS,
}

/// Mock transport recording outbound messages and subscribe calls
#[derive(Debug)]
pub struct MockTransport {
    client_id: String,
    state_tx: watch::Sender<ConnectionState>,
    sent: Mutex<Vec<OutboundMessage>>,
    subscriptions: Mutex<Vec<SubscribeCall>>,
    fail_subscribe: AtomicBool,
    subscribed: Notify,
}

impl MockTransport {
    pub fn with_state(state: ConnectionState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            client_id: "mock-client".to_string(),
            state_tx,
            sent: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            fail_subscribe: AtomicBool::new(false),
            subscribed: Notify::new(),
        }
    }

    pub fn connected() -> Self {
        Self::with_state(ConnectionState::Connected)
    }

    pub fn disconnected() -> Self {
        Self::with_state(ConnectionState::Disconnected)
    }

    /// Drive a state transition as the session supervisor would
    pub fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Make subsequent subscribe calls fail
    pub fn fail_subscriptions(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        lock(&self.sent).clone()
    }

    pub fn subscribe_calls(&self) -> Vec<SubscribeCall> {
        lock(&self.subscriptions).clone()
    }

    /// Wait until the number of subscribe calls reaches `count`
    pub async fn wait_for_subscribe_calls(&self, count: usize) {
        loop {
            let notified = self.subscribed.notified();
            if lock(&self.subscriptions).len() >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn clear_history(&self) {
        lock(&self.sent).clear();
        lock(&self.subscriptions).clear();
    }
}

#[async_trait]
impl OutboundTransport for MockTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), MqttError> {
        let state = self.state_tx.borrow().clone();
        if !state.is_connected() {
            return Err(MqttError::NotConnected { state });
        }
        lock(&self.sent).push(message);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }
}

#[async_trait]
impl InboundTransport for MockTransport {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&self, filters: &[String], qos: QoS) -> Result<(), MqttError> {
        lock(&self.subscriptions).push(SubscribeCall {
            filters: filters.to_vec(),
            qos,
        });
        self.subscribed.notify_waiters();

        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MqttError::SubscriptionFailed(
                "mock subscription failure".to_string(),
            ));
        }
        Ok(())
    }

    fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// Handler strategy that records every payload it receives
pub struct RecordingHandler {
    pattern: String,
    payloads: Mutex<Vec<String>>,
    failure: Option<HandlerError>,
    handled: Notify,
}

impl RecordingHandler {
    pub fn new(pattern: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pattern: pattern.into(),
            payloads: Mutex::new(Vec::new()),
            failure: None,
            handled: Notify::new(),
        })
    }

    /// Handler that records the payload and then fails with `message`
    pub fn failing(pattern: impl Into<String>, message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pattern: pattern.into(),
            payloads: Mutex::new(Vec::new()),
            failure: Some(HandlerError::failed(message)),
            handled: Notify::new(),
        })
    }

    pub fn payloads(&self) -> Vec<String> {
        lock(&self.payloads).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.payloads).len()
    }

    /// Wait until at least `count` payloads were handled
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let notified = self.handled.notified();
            if self.call_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl HandlerStrategy for RecordingHandler {
    fn topic_pattern(&self) -> &str {
        &self.pattern
    }

    async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        lock(&self.payloads).push(payload.to_string());
        self.handled.notify_waiters();
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
