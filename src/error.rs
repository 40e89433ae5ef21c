//! Crate-level error type
//!
//! Each layer keeps its own error enum; `BridgeError` aggregates them for the
//! startup path and the CLI.

use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl BridgeError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Errors a caller can retry once the broker is reachable again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport(
                MqttError::ConnectionFailed(_)
                    | MqttError::NotConnected { .. }
                    | MqttError::PublishFailed { .. }
                    | MqttError::DisconnectTimeout(_)
            )
        )
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
