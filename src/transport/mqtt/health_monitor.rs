//! Pure health monitoring and reconnection logic for MQTT sessions
//!
//! Decides state transitions and whether another reconnect attempt should run.
//! The session supervisor performs the I/O these decisions call for.

use super::connection::{ConnectionState, ReconnectPolicy};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to schedule reconnect attempt `failed_attempts + 1`
    pub fn should_attempt_reconnection(
        failed_attempts: u32,
        auto_reconnect: bool,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if !auto_reconnect {
            return ReconnectionDecision::AbortDisabled;
        }
        if let Some(max_attempts) = policy.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = failed_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.delay_for_attempt(attempt),
        }
    }

    /// Next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::ConnectFailed(_) => ConnectionState::Disconnected,
            ConnectionEvent::ConnectionDropped(_) => ConnectionState::Disconnected,
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => ConnectionState::PermanentlyFailed(reason),
            ConnectionEvent::ShutdownCompleted => ConnectionState::Closed,
        }
    }

    /// Check if connection state allows publishing
    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    /// Check if connection state allows subscribing
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    /// Whether a state-change notification is a recovery that needs subscriptions re-issued
    ///
    /// Watch receivers can skip intermediate states, so any return to
    /// `Connected` after the first connect counts. That includes a notification
    /// from `Connected` to `Connected`: the drop and the reconnect were coalesced.
    pub fn is_recovery(from: &ConnectionState, to: &ConnectionState) -> bool {
        to.is_connected()
            && matches!(
                from,
                ConnectionState::Reconnecting(_)
                    | ConnectionState::Disconnected
                    | ConnectionState::Connected
            )
    }

    /// Index of the host that reconnect attempt `attempt` (1-based) targets
    pub fn endpoint_for_attempt(attempt: u32, host_count: usize) -> usize {
        if host_count == 0 {
            return 0;
        }
        attempt.saturating_sub(1) as usize % host_count
    }

    /// Calculate health metrics for a session
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();
        HealthMetrics {
            uptime: connect_time.map(|t| now.duration_since(t)),
            time_since_last_message: last_message_time.map(|t| now.duration_since(t)),
            reconnect_count,
        }
    }

    /// Log connection state transition
    pub fn log_state_transition(client_id: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(client_id = %client_id, "MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!(client_id = %client_id, "MQTT connection lost");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!(client_id = %client_id, "Reconnection successful");
            }
            (_, ConnectionState::PermanentlyFailed(reason)) => {
                error!(client_id = %client_id, reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!(client_id = %client_id, "MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    /// Automatic reconnection is switched off
    AbortDisabled,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectStarted,
    ConnAckReceived,
    ConnectFailed(String),
    ConnectionDropped(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
    ShutdownCompleted,
}

/// Health metrics for session monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    pub reconnect_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_proceeds_with_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, true, &policy, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, true, &policy, false),
            ReconnectionDecision::Proceed {
                attempt: 4,
                delay: Duration::from_secs(8)
            }
        );
    }

    #[test]
    fn test_unlimited_retries_never_abort() {
        let policy = ReconnectPolicy::default();
        let decision = HealthMonitor::should_attempt_reconnection(10_000, true, &policy, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 10_001,
                delay: Duration::from_secs(120)
            }
        );
    }

    #[test]
    fn test_reconnection_aborts() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::default()
        };
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, true, &policy, true),
            ReconnectionDecision::AbortShutdownRequested
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, false, &policy, false),
            ReconnectionDecision::AbortDisabled
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, true, &policy, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(2)),
            ConnectionState::Reconnecting(2)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnectionDropped("eof".into())),
            ConnectionState::Disconnected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ShutdownCompleted),
            ConnectionState::Closed
        );
        assert!(matches!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure("x".into())),
            ConnectionState::PermanentlyFailed(_)
        ));
    }

    #[test]
    fn test_recovery_detection() {
        assert!(HealthMonitor::is_recovery(
            &ConnectionState::Reconnecting(1),
            &ConnectionState::Connected
        ));
        assert!(HealthMonitor::is_recovery(
            &ConnectionState::Disconnected,
            &ConnectionState::Connected
        ));
        assert!(HealthMonitor::is_recovery(
            &ConnectionState::Connected,
            &ConnectionState::Connected
        ));
        assert!(!HealthMonitor::is_recovery(
            &ConnectionState::Connecting,
            &ConnectionState::Connected
        ));
        assert!(!HealthMonitor::is_recovery(
            &ConnectionState::Reconnecting(1),
            &ConnectionState::Closed
        ));
    }

    #[test]
    fn test_host_rotation() {
        let picks: Vec<usize> = (1..=5)
            .map(|attempt| HealthMonitor::endpoint_for_attempt(attempt, 2))
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0]);
        assert_eq!(HealthMonitor::endpoint_for_attempt(3, 1), 0);
        assert_eq!(HealthMonitor::endpoint_for_attempt(1, 0), 0);
    }

    #[test]
    fn test_publish_gating() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_subscribe(&ConnectionState::Closed));
    }

    #[test]
    fn test_health_metrics_initial() {
        let metrics = HealthMonitor::calculate_health_metrics(None, None, 0);
        assert_eq!(metrics.uptime, None);
        assert_eq!(metrics.time_since_last_message, None);

        let metrics = HealthMonitor::calculate_health_metrics(Some(Instant::now()), None, 2);
        assert!(metrics.uptime.is_some());
        assert_eq!(metrics.reconnect_count, 2);
    }
}
