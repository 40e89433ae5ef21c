//! Handler strategy contract
//!
//! A strategy declares the regex it serves and what to do with a payload that
//! arrives on a matching topic. Strategies are registered explicitly at startup.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failure raised by a strategy while processing one payload
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandlerError {
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    #[error("Handler failed: {message}")]
    Failed { message: String },

    #[error("Handler panicked: {message}")]
    Panicked { message: String },
}

impl HandlerError {
    pub fn invalid_payload<S: Into<String>>(message: S) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// A unit of application logic bound to one topic pattern
#[async_trait]
pub trait HandlerStrategy: Send + Sync {
    /// Regular expression matched against the full inbound topic
    fn topic_pattern(&self) -> &str;

    /// Process the UTF-8 payload of a message routed to this strategy
    async fn handle(&self, payload: &str) -> Result<(), HandlerError>;
}

type BoxedHandlerFn = Box<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Closure-backed strategy
pub struct FnHandler {
    pattern: String,
    func: BoxedHandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(pattern: impl Into<String>, func: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            pattern: pattern.into(),
            func: Box::new(move |payload| Box::pin(func(payload))),
        }
    }
}

#[async_trait]
impl HandlerStrategy for FnHandler {
    fn topic_pattern(&self) -> &str {
        &self.pattern
    }

    async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        (self.func)(payload.to_string()).await
    }
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("pattern", &self.pattern)
            .finish()
    }
}
