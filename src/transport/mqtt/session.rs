//! Impure I/O for one MQTT session
//!
//! An [`MqttSession`] owns a single rumqttc client bound to one client ID. A
//! supervisor task drives the event loop, forwards inbound publishes, and on a
//! dropped connection runs the reconnect policy with a fresh client each time.
//! Subscriptions are not restored here; the inbound listener re-issues them.

use super::connection::{
    configure_mqtt_options, parse_endpoints, qos_level, BrokerEndpoint, ConnectionState,
    Credentials, MqttError, ReconnectPolicy,
};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::SessionConfig;
use crate::observability::events::{EventBus, SessionEvent};
use crate::observability::metrics::metrics;
use crate::protocol::{InboundEnvelope, OutboundMessage};
use bytes::Bytes;
use chrono::Utc;
use rumqttc::{AsyncClient, EventLoop, QoS, SubscribeFilter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;

/// Why the connected phase of the supervisor ended
#[derive(Debug)]
enum DriveExit {
    /// Our own DISCONNECT went out
    Closed,
    /// Network error or broker-initiated disconnect
    Lost(String),
}

/// State shared between the session handle and its supervisor task
struct SessionShared {
    client_id: String,
    endpoints: Vec<BrokerEndpoint>,
    config: Arc<SessionConfig>,
    /// Resolved by each `connect()` and reused by its reconnects
    credentials: StdMutex<Option<Credentials>>,
    policy: ReconnectPolicy,
    client: RwLock<Option<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    suback_tx: broadcast::Sender<Vec<Option<QoS>>>,
    inbound: Option<mpsc::Sender<InboundEnvelope>>,
    events: EventBus,
    reconnect_count: AtomicU32,
    connect_time: StdMutex<Option<Instant>>,
    last_message_time: StdMutex<Option<Instant>>,
}

impl SessionShared {
    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&self.client_id, &previous, &next);
        }
    }

    fn hosts(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.uri.clone()).collect()
    }

    fn mark_connected(&self, endpoint: &BrokerEndpoint) {
        self.transition(ConnectionEvent::ConnAckReceived);
        set_instant(&self.connect_time);
        self.events.emit(SessionEvent::Connected {
            timestamp: Utc::now(),
            host: endpoint.uri.clone(),
            client_id: self.client_id.clone(),
        });
    }

    fn emit_connection_failed(&self, hosts: Vec<String>, cause: String) {
        self.events.emit(SessionEvent::ConnectionFailed {
            timestamp: Utc::now(),
            hosts,
            username: self.config.username.clone(),
            client_id: self.client_id.clone(),
            cause,
        });
    }

    /// Open a fresh client against `endpoint` and wait for its ConnAck
    async fn establish(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let options = configure_mqtt_options(
            &self.client_id,
            endpoint,
            &self.config,
            credentials.as_ref(),
        )?;
        metrics().record_connection_attempt();

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        wait_for_connack(&mut event_loop, self.config.connection_timeout()).await?;
        Ok((client, event_loop))
    }

    async fn install_client(&self, client: AsyncClient) {
        *self.client.write().await = Some(client);
    }

    async fn forward_inbound(&self, topic: String, payload: Bytes, retain: bool) {
        set_instant(&self.last_message_time);
        debug!(topic = %topic, retain = retain, bytes = payload.len(), "Received MQTT message");

        let Some(inbound) = &self.inbound else {
            debug!(topic = %topic, "No inbound consumer attached, dropping message");
            return;
        };
        let envelope = MessageHandler::to_envelope(&topic, &payload);
        if inbound.send(envelope).await.is_err() {
            warn!(topic = %topic, "Inbound consumer is gone, dropping message");
        }
    }

    /// Poll the event loop until the connection ends
    async fn drive_connected(&self, event_loop: &mut EventLoop) -> DriveExit {
        loop {
            let event = match event_loop.poll().await {
                Ok(event) => event,
                Err(e) => return DriveExit::Lost(e.to_string()),
            };

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::MessageReceived {
                    topic,
                    payload,
                    retain,
                } => self.forward_inbound(topic, payload, retain).await,
                EventRoute::SubscriptionAcknowledged { return_codes, .. } => {
                    // Nobody waiting is fine; the ack is simply unused
                    let _ = self.suback_tx.send(return_codes);
                }
                EventRoute::ConnectionAcknowledged { success: false, code } => {
                    return DriveExit::Lost(format!("broker refused connection: {code}"));
                }
                EventRoute::ConnectionAcknowledged { success: true, .. } => {}
                EventRoute::Disconnected => {
                    return DriveExit::Lost("broker sent DISCONNECT".to_string());
                }
                EventRoute::OutgoingDisconnect => return DriveExit::Closed,
                EventRoute::InfrastructureEvent(description) => {
                    tracing::trace!(target: "mqtt_transport", "MQTT event: {}", description);
                }
                EventRoute::OutgoingEvent => {}
            }
        }
    }

    /// Run the backoff policy until a new connection is up
    ///
    /// Returns `None` when shutdown was requested or the policy gave up.
    async fn reconnect(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Option<EventLoop> {
        // Every outage starts the backoff from the first step again
        let mut failed_attempts = 0u32;

        loop {
            let decision = HealthMonitor::should_attempt_reconnection(
                failed_attempts,
                self.config.auto_reconnect,
                &self.policy,
                *shutdown_rx.borrow(),
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                    self.events.emit(SessionEvent::Reconnecting {
                        timestamp: Utc::now(),
                        client_id: self.client_id.clone(),
                        attempt,
                        delay,
                    });

                    if !interruptible_sleep(shutdown_rx, delay).await {
                        return None;
                    }

                    let index = HealthMonitor::endpoint_for_attempt(attempt, self.endpoints.len());
                    let endpoint = &self.endpoints[index];

                    let outcome = tokio::select! {
                        outcome = self.establish(endpoint) => outcome,
                        _ = wait_for_shutdown(shutdown_rx) => return None,
                    };

                    match outcome {
                        Ok((client, event_loop)) => {
                            self.install_client(client).await;
                            self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                            self.mark_connected(endpoint);
                            return Some(event_loop);
                        }
                        Err(e) => {
                            let cause = format!("{}: {e}", endpoint.uri);
                            self.emit_connection_failed(self.hosts(), cause);
                            failed_attempts = attempt;
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!(client_id = %self.client_id, "Shutdown requested, stopping reconnection");
                    return None;
                }
                ReconnectionDecision::AbortDisabled => {
                    self.transition(ConnectionEvent::PermanentFailure(
                        "automatic reconnection is disabled".to_string(),
                    ));
                    return None;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!(
                        "max reconnection attempts ({failed_attempts}) exceeded"
                    );
                    self.transition(ConnectionEvent::PermanentFailure(reason));
                    return None;
                }
            }
        }
    }

    /// Supervisor body: connected phase, then reconnect, until shutdown
    async fn supervise(self: Arc<Self>, mut event_loop: EventLoop) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(client_id = %self.client_id, "Starting MQTT session supervisor");

        loop {
            let cause = match self.drive_connected(&mut event_loop).await {
                DriveExit::Closed => break,
                DriveExit::Lost(cause) => cause,
            };

            if *shutdown_rx.borrow() {
                break;
            }

            self.transition(ConnectionEvent::ConnectionDropped(cause.clone()));
            self.events.emit(SessionEvent::ConnectionLost {
                timestamp: Utc::now(),
                client_id: self.client_id.clone(),
                cause,
            });

            match self.reconnect(&mut shutdown_rx).await {
                Some(next) => event_loop = next,
                None => break,
            }
        }

        info!(client_id = %self.client_id, "MQTT session supervisor stopped");
    }
}

/// One managed MQTT connection bound to a single client ID
pub struct MqttSession {
    shared: Arc<SessionShared>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    subscribe_lock: Mutex<()>,
}

impl MqttSession {
    pub fn new(
        client_id: impl Into<String>,
        config: Arc<SessionConfig>,
        events: EventBus,
    ) -> Result<Self, MqttError> {
        let endpoints = parse_endpoints(&config.hosts)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (suback_tx, _) = broadcast::channel(16);

        Ok(Self {
            shared: Arc::new(SessionShared {
                client_id: client_id.into(),
                endpoints,
                policy: ReconnectPolicy::from_config(&config),
                config,
                credentials: StdMutex::new(None),
                client: RwLock::new(None),
                state_tx,
                shutdown_tx,
                suback_tx,
                inbound: None,
                events,
                reconnect_count: AtomicU32::new(0),
                connect_time: StdMutex::new(None),
                last_message_time: StdMutex::new(None),
            }),
            supervisor: StdMutex::new(None),
            subscribe_lock: Mutex::new(()),
        })
    }

    /// Forward received publishes into `sender`; must be called before the session is shared
    pub fn with_inbound(mut self, sender: mpsc::Sender<InboundEnvelope>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.inbound = Some(sender),
            None => warn!(client_id = %self.shared.client_id, "Session already shared, inbound sender ignored"),
        }
        self
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn endpoints(&self) -> &[BrokerEndpoint] {
        &self.shared.endpoints
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(
            read_instant(&self.shared.connect_time),
            read_instant(&self.shared.last_message_time),
            self.shared.reconnect_count.load(Ordering::Relaxed),
        )
    }

    /// Connect to the first reachable broker and start the supervisor
    ///
    /// Credentials are resolved from the configuration first, so a password
    /// environment variable is read here and not when the session is built.
    /// Hosts are tried in configured order, each bounded by the connection
    /// timeout. If none answers, a `ConnectionFailed` event is emitted and
    /// `MqttError::ConnectionFailed` returned.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let span = crate::mqtt_span!(client_id = %self.shared.client_id);
        self.connect_inner().instrument(span).await
    }

    async fn connect_inner(&self) -> Result<(), MqttError> {
        if self.supervisor_running() {
            return Err(MqttError::AlreadyStarted(self.shared.client_id.clone()));
        }

        let credentials = Credentials::from_config(&self.shared.config)?;
        *self
            .shared
            .credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credentials;

        self.shared.shutdown_tx.send_replace(false);
        self.shared.transition(ConnectionEvent::ConnectStarted);

        let mut last_error = None;
        for endpoint in &self.shared.endpoints {
            match self.shared.establish(endpoint).await {
                Ok((client, event_loop)) => {
                    self.shared.install_client(client).await;
                    self.shared.mark_connected(endpoint);

                    let handle = tokio::spawn(self.shared.clone().supervise(event_loop));
                    store_handle(&self.supervisor, handle);
                    return Ok(());
                }
                Err(e) => {
                    warn!(host = %endpoint.uri, error = %e, "Broker unreachable, trying next host");
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error.map_or_else(|| "no hosts attempted".to_string(), |e| e.to_string());
        self.shared
            .transition(ConnectionEvent::ConnectFailed(cause.clone()));
        self.shared
            .emit_connection_failed(self.shared.hosts(), cause.clone());
        Err(MqttError::ConnectionFailed(cause))
    }

    /// Subscribe to `filters` in one request and wait for the SubAck
    ///
    /// Emits `Subscribed` or `SubscriptionFailed` per filter. Waiting is bounded
    /// by the completion timeout.
    pub async fn subscribe(&self, filters: &[String], qos: QoS) -> Result<(), MqttError> {
        let state = self.state();
        if !HealthMonitor::can_subscribe(&state) {
            return Err(MqttError::NotConnected { state });
        }
        if filters.is_empty() {
            return Ok(());
        }

        // One SUBSCRIBE in flight at a time so acks pair with requests
        let _guard = self.subscribe_lock.lock().await;
        let mut acks = self.shared.suback_tx.subscribe();
        let client = self.current_client().await?;

        let request = filters
            .iter()
            .map(|filter| SubscribeFilter::new(filter.clone(), qos));
        client
            .subscribe_many(request)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(e.to_string()))?;

        let completion = self.shared.config.completion_timeout();
        let return_codes = match tokio::time::timeout(completion, acks.recv()).await {
            Ok(Ok(codes)) => codes,
            Ok(Err(e)) => return Err(self.fail_all(filters, format!("SubAck lost: {e}"))),
            Err(_) => {
                return Err(self.fail_all(filters, format!("no SubAck within {completion:?}")))
            }
        };

        let mut rejected = Vec::new();
        for result in MessageHandler::match_subscription_results(filters, &return_codes) {
            match result.granted {
                Some(granted) => self.shared.events.emit(SessionEvent::Subscribed {
                    timestamp: Utc::now(),
                    hosts: self.shared.hosts(),
                    username: self.shared.config.username.clone(),
                    client_id: self.shared.client_id.clone(),
                    filter: result.filter,
                    qos: qos_level(granted),
                }),
                None => {
                    self.shared.events.emit(SessionEvent::SubscriptionFailed {
                        timestamp: Utc::now(),
                        client_id: self.shared.client_id.clone(),
                        filter: result.filter.clone(),
                        reason: "rejected by broker".to_string(),
                    });
                    rejected.push(result.filter);
                }
            }
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(MqttError::SubscriptionFailed(format!(
                "broker rejected filters: {}",
                rejected.join(", ")
            )))
        }
    }

    fn fail_all(&self, filters: &[String], reason: String) -> MqttError {
        for filter in filters {
            self.shared.events.emit(SessionEvent::SubscriptionFailed {
                timestamp: Utc::now(),
                client_id: self.shared.client_id.clone(),
                filter: filter.clone(),
                reason: reason.clone(),
            });
        }
        MqttError::SubscriptionFailed(reason)
    }

    /// Hand a message to the client's request queue
    ///
    /// Returns once rumqttc has accepted the request, not when the broker acks it.
    pub async fn publish(&self, message: OutboundMessage) -> Result<(), MqttError> {
        let state = self.state();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }

        let client = self.current_client().await?;
        let OutboundMessage {
            topic,
            qos,
            payload,
            retain,
        } = message;

        client
            .publish(topic.clone(), qos, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed {
                topic: topic.clone(),
                source: Box::new(e),
            })?;

        debug!(client_id = %self.shared.client_id, topic = %topic, "Published message");
        Ok(())
    }

    /// Send DISCONNECT and stop the supervisor
    ///
    /// Waits at most the completion timeout; after that the supervisor is
    /// aborted and `DisconnectTimeout` returned. The session ends `Closed` either way.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let Some(mut handle) = take_handle(&self.supervisor) else {
            self.shared.transition(ConnectionEvent::ShutdownCompleted);
            return Ok(());
        };

        if self.state().is_connected() {
            if let Some(client) = self.shared.client.read().await.clone() {
                if let Err(e) = client.disconnect().await {
                    warn!(client_id = %self.shared.client_id, error = %e, "Failed to queue DISCONNECT");
                }
            }
        }
        self.shared.shutdown_tx.send_replace(true);

        let completion = self.shared.config.completion_timeout();
        let result = match tokio::time::timeout(completion, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(client_id = %self.shared.client_id, error = %e, "Session supervisor ended abnormally");
                Ok(())
            }
            Err(_) => {
                handle.abort();
                Err(MqttError::DisconnectTimeout(completion))
            }
        };

        *self.shared.client.write().await = None;
        self.shared.transition(ConnectionEvent::ShutdownCompleted);
        self.shared.events.emit(SessionEvent::Closed {
            timestamp: Utc::now(),
            client_id: self.shared.client_id.clone(),
        });
        result
    }

    async fn current_client(&self) -> Result<AsyncClient, MqttError> {
        self.shared
            .client
            .read()
            .await
            .clone()
            .ok_or_else(|| MqttError::NotConnected {
                state: self.state(),
            })
    }

    fn supervisor_running(&self) -> bool {
        lock_handle(&self.supervisor)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(handle) = take_handle(&self.supervisor) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("client_id", &self.shared.client_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Poll a fresh event loop until the broker accepts or refuses the CONNECT
async fn wait_for_connack(event_loop: &mut EventLoop, timeout: Duration) -> Result<(), MqttError> {
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            let event = match event_loop.poll().await {
                Ok(event) => event,
                Err(e) => return Err(MqttError::ConnectionFailed(e.to_string())),
            };
            if let EventRoute::ConnectionAcknowledged { success, code } =
                MessageHandler::route_mqtt_event(&event)
            {
                return if success {
                    Ok(())
                } else {
                    Err(MqttError::ConnectionFailed(format!(
                        "broker refused connection: {code}"
                    )))
                };
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|_| {
        Err(MqttError::ConnectionFailed(format!(
            "no ConnAck within {timeout:?}"
        )))
    })
}

/// Resolve once shutdown has been requested (or the flag's owner is gone)
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay` unless shutdown is requested first
///
/// Returns true if the full delay elapsed.
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown_rx) => {
            info!("Shutdown signal received during reconnection delay");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

fn lock_handle(
    slot: &StdMutex<Option<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn store_handle(slot: &StdMutex<Option<JoinHandle<()>>>, handle: JoinHandle<()>) {
    *lock_handle(slot) = Some(handle);
}

fn take_handle(slot: &StdMutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    lock_handle(slot).take()
}

fn set_instant(slot: &StdMutex<Option<Instant>>) {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
}

fn read_instant(slot: &StdMutex<Option<Instant>>) -> Option<Instant> {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
