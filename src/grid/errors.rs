//! Grid engine error types

use thiserror::Error;

/// Errors that can occur in grid engine operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order sizing failed: {0}")]
    OrderSizing(String),

    #[error("Position not tracked: id {0}")]
    PositionNotFound(u64),

    #[error("Engine is in invalid state for operation: {current_state}")]
    InvalidState { current_state: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::Settings(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
