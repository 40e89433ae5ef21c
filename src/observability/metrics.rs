//! Thread-safe metrics collection
//!
//! Atomic counters for the MQTT sessions and the dispatch path, plus a bounded
//! window of handler execution times.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_HANDLER_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and a mutex-protected sample window
pub struct MetricsCollector {
    // Connection metrics
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    reconnect_attempts: AtomicU64,

    // Traffic metrics
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    subscriptions: AtomicU64,
    subscription_failures: AtomicU64,

    // Dispatch metrics
    messages_handled: AtomicU64,
    messages_unrouted: AtomicU64,
    handler_failures: AtomicU64,
    handler_times: Mutex<Vec<u64>>, // in milliseconds

    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
            subscription_failures: AtomicU64::new(0),
            messages_handled: AtomicU64::new(0),
            messages_unrouted: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_times: Mutex::new(Vec::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription(&self) {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_failure(&self) {
        self.subscription_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unrouted(&self) {
        self.messages_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handled(&self, duration: Duration) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.handler_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_HANDLER_SAMPLES {
                times.remove(0);
            }
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.reconnect_attempts,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.subscriptions,
            &self.subscription_failures,
            &self.messages_handled,
            &self.messages_unrouted,
            &self.handler_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut times) = self.handler_times.lock() {
            times.clear();
        }
        self.started_at.store(current_timestamp(), Ordering::Relaxed);
    }

    fn handler_time_statistics(&self) -> HandlerTimings {
        let Ok(times) = self.handler_times.lock() else {
            return HandlerTimings::default();
        };
        if times.is_empty() {
            return HandlerTimings::default();
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();
        HandlerTimings {
            samples: sorted.len(),
            avg_ms: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            max_ms: sorted.last().copied().unwrap_or(0) as f64,
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            connection: ConnectionMetrics {
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                lost: self.connections_lost.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            },
            traffic: TrafficMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                received: self.messages_received.load(Ordering::Relaxed),
                subscriptions: self.subscriptions.load(Ordering::Relaxed),
                subscription_failures: self.subscription_failures.load(Ordering::Relaxed),
            },
            dispatch: DispatchMetrics {
                handled: self.messages_handled.load(Ordering::Relaxed),
                unrouted: self.messages_unrouted.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                handler_timings: self.handler_time_statistics(),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub connection: ConnectionMetrics,
    pub traffic: TrafficMetrics,
    pub dispatch: DispatchMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub lost: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficMetrics {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub subscriptions: u64,
    pub subscription_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub handled: u64,
    pub unrouted: u64,
    pub handler_failures: u64,
    pub handler_timings: HandlerTimings,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerTimings {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower] as f64
    } else {
        let weight = rank - lower as f64;
        sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
