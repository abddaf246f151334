//! Error types for the relay harness

use std::time::Duration;

use thiserror::Error;

use crate::session::Role;

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors raised while loading or validating a [`crate::HarnessConfig`] or a scenario file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Invalid server address '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}

// ----------------------------------------------------------------------------
// Wire Protocol Errors
// ----------------------------------------------------------------------------

/// Errors decoding Engine.IO / Socket.IO packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty packet")]
    EmptyPacket,

    #[error("Unknown {layer} packet type '{found}'")]
    UnknownPacketType { layer: &'static str, found: char },

    #[error("Binary packets are not supported")]
    BinaryUnsupported,

    #[error("Malformed packet body: {0}")]
    MalformedBody(String),

    #[error("Event packet carries no event name")]
    MissingEventName,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedBody(err.to_string())
    }
}

// ----------------------------------------------------------------------------
// Connection Errors
// ----------------------------------------------------------------------------

/// Failures establishing, using, or registering a role connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid relay endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Timed out after {timeout:?} while {stage}")]
    Timeout { stage: &'static str, timeout: Duration },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Relay rejected namespace connect: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,

    #[error("Registration of {role} failed: {reason}")]
    Registration { role: Role, reason: String },
}

// ----------------------------------------------------------------------------
// Capture Queue Errors
// ----------------------------------------------------------------------------

/// Failures waiting on a capture queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("No delivery within {budget:?}")]
    Timeout { budget: Duration },

    #[error("Capture queue closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// Harness Errors
// ----------------------------------------------------------------------------

/// Top-level harness error
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Scenario error: {0}")]
    Scenario(String),
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
