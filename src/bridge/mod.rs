//! Application-facing bridge components
//!
//! - [`publisher`] - outbound sends with configured defaults
//! - [`listener`] - subscription and in-order dispatch of inbound messages
//! - [`context`] - the startup context tying sessions, registry and listener together

pub mod context;
pub mod listener;
pub mod publisher;

pub use context::BridgeContext;
pub use listener::InboundListener;
pub use publisher::Publisher;
