//! Observability for the bridge
//!
//! Structured logging, session lifecycle events, metrics collection and the
//! health check endpoints.

pub mod events;
pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use events::{
    ChannelObserver, EventBus, LoggingObserver, MetricsObserver, SessionEvent, SessionObserver,
};
pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{dispatch_span, mqtt_span};
