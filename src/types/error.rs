//! Unified error types for the push subsystem
//!
//! The taxonomy encodes the propagation policy directly:
//! - crypto and payload errors are local to one message (drop, log)
//! - transport and server-response errors escalate to fallback polling
//! - network errors request a retry from the external job scheduler

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for all push registration, routing and persistence paths
///
/// Serializable so failures can be handed to an embedding application
/// or recorded by the external job system.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum PushError {
    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("No compatible push transport available: {0}")]
    TransportUnavailable(String),

    #[error("Push registration timed out: {0}")]
    RegistrationTimeout(String),

    #[error("Push registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed server response: {0}")]
    MalformedServerResponse(String),

    #[error("Malformed push payload: {0}")]
    MalformedPushPayload(String),

    #[error("Push registration must not run on the primary execution thread")]
    WrongExecutionContext,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl PushError {
    /// Whether this failure is a transient network condition.
    ///
    /// Network-classified failures request a retry from the external job
    /// scheduler; everything else is terminal for that job instance.
    pub fn is_network(&self) -> bool {
        matches!(self, PushError::Network(_))
    }
}

// Implement From for common error types

impl From<std::io::Error> for PushError {
    fn from(err: std::io::Error) -> Self {
        PushError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for PushError {
    fn from(err: toml::de::Error) -> Self {
        PushError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PushError {
    fn from(err: serde_json::Error) -> Self {
        PushError::Parse(err.to_string())
    }
}

impl From<rusqlite::Error> for PushError {
    fn from(err: rusqlite::Error) -> Self {
        PushError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for PushError {
    fn from(err: r2d2::Error) -> Self {
        PushError::Database(err.to_string())
    }
}

/// Result type alias using PushError
pub type Result<T> = std::result::Result<T, PushError>;
