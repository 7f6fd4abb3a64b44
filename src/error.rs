//! # Error Types
//!
//! Custom error types for BMS Link using `thiserror`.

use thiserror::Error;

/// Main error type for BMS Link
#[derive(Debug, Error)]
pub enum BmsLinkError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport could not be opened or failed mid-session
    #[error("Transport error: {0}")]
    Transport(String),

    /// Inbound message was not a recognized structured message
    #[error("Decode error: {0}")]
    Decode(String),

    /// Command identifier not known to the protocol
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Session task is gone (torn down or never started)
    #[error("Session closed")]
    SessionClosed,

    /// History export serialization errors
    #[error("Export error: {0}")]
    Export(#[from] serde_json::Error),
}

/// Result type alias for BMS Link
pub type Result<T> = std::result::Result<T, BmsLinkError>;
