//! Health check HTTP server for container orchestration
//!
//! Reports the state of each MQTT session and exposes the metrics snapshot.
//! `/health` and `/ready` answer 503 unless every session is connected.

use crate::observability::metrics::metrics;
use crate::transport::mqtt::ConnectionState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// One session whose state is reported
#[derive(Clone)]
struct SessionProbe {
    client_id: String,
    state: watch::Receiver<ConnectionState>,
}

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    sessions: BTreeMap<String, SessionProbe>,
}

impl HealthServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            sessions: BTreeMap::new(),
        }
    }

    /// Port from `HEALTH_PORT`, falling back to 8080
    pub fn port_from_env() -> u16 {
        env::var("HEALTH_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(DEFAULT_HEALTH_PORT)
    }

    /// `HEALTH_ENABLED=false` switches the server off
    pub fn enabled_from_env() -> bool {
        env::var("HEALTH_ENABLED")
            .map(|value| !value.eq_ignore_ascii_case("false"))
            .unwrap_or(true)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Report a session under `role` (e.g. "producer")
    pub fn with_session(
        mut self,
        role: impl Into<String>,
        client_id: impl Into<String>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        self.sessions.insert(
            role.into(),
            SessionProbe {
                client_id: client_id.into(),
                state,
            },
        );
        self
    }

    /// All routes served by [`HealthServer::start`]
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self;

        // GET /health - per-session status
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let ready = server.all_connected();
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&response),
                        code,
                    ))
                }
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async {
                let response = LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                };
                Ok::<_, Infallible>(warp::reply::json(&response))
            });

        // GET /metrics - counters snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async { Ok::<_, Infallible>(warp::reply::json(&metrics().snapshot())) });

        health_route.or(ready_route).or(live_route).or(metrics_route)
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        let routes = self.routes().with(warp::cors().allow_any_origin());

        tracing::info!(port = port, "Starting health server");
        warp::serve(routes).run(([0, 0, 0, 0], port)).await;
    }

    fn all_connected(&self) -> bool {
        self.sessions
            .values()
            .all(|probe| probe.state.borrow().is_connected())
    }

    fn health_status(&self) -> HealthStatus {
        let sessions: BTreeMap<String, SessionHealth> = self
            .sessions
            .iter()
            .map(|(role, probe)| {
                let state = probe.state.borrow().clone();
                (
                    role.clone(),
                    SessionHealth {
                        client_id: probe.client_id.clone(),
                        connected: state.is_connected(),
                        state: format!("{state:?}"),
                    },
                )
            })
            .collect();

        let status = if self.all_connected() {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: status.to_string(),
            timestamp: current_timestamp(),
            uptime_seconds: metrics().snapshot().uptime_seconds,
            sessions,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionHealth {
    client_id: String,
    connected: bool,
    state: String,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    uptime_seconds: u64,
    sessions: BTreeMap<String, SessionHealth>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
