//! Message and topic types exchanged with the broker
//!
//! Outbound messages, inbound envelopes, the device command payload and the
//! topic helpers (template substitution, filter validation) live here.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
