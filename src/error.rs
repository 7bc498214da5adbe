//! # Error Types
//!
//! Custom error types for PizzaBot using `thiserror`.

use thiserror::Error;

/// Main error type for PizzaBot
#[derive(Debug, Error)]
pub enum PizzabotError {
    /// A transport gateway call was rejected
    #[error("Transport error: {0}")]
    Transport(String),

    /// The Bluetooth connect permission was not granted
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The gateway's inbound event stream already has an owner
    #[error("Transport event stream is already owned by another session")]
    EventStreamTaken,

    /// Settings store errors
    #[error("Settings store error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for PizzaBot
pub type Result<T> = std::result::Result<T, PizzabotError>;
