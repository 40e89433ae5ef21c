//! Topic dispatch engine
//!
//! - [`strategy`] - the handler contract and closure-backed handlers
//! - [`registry`] - regex pattern → handler resolution
//! - [`service`] - resolve + handle with per-message failure isolation
//! - [`strategies`] - built-in device strategies

pub mod registry;
pub mod service;
pub mod strategies;
pub mod strategy;

pub use registry::{DispatchError, DispatchRegistry, RegistryBuilder, TopicPatternEntry};
pub use service::{DispatchOutcome, Dispatcher};
pub use strategies::{builtin_strategies, DataRespStrategy, DataSubscribeStrategy};
pub use strategy::{FnHandler, HandlerError, HandlerStrategy};
