//! Agentbridge error types

use std::time::Duration;
use thiserror::Error;

/// Agentbridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The agent executable could not be located or failed to start
    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    /// A line from the agent matched none of the known message shapes
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// The agent answered a call with an explicit error object
    #[error("Agent returned error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived before the caller's deadline
    #[error("Call '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The agent process exited while the call was in flight
    #[error("Agent process terminated")]
    ProcessTerminated,

    /// An incoming permission request could not be decoded
    #[error("Permission request parse error: {0}")]
    PermissionParse(String),

    /// Session lookup or validation error
    #[error("Session error: {0}")]
    Session(String),

    /// Gateway error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Short machine-readable code carried by `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Spawn(_) => "spawn_failed",
            Error::ProtocolDecode(_) => "protocol_decode",
            Error::Rpc { .. } => "agent_error",
            Error::Timeout { .. } => "timeout",
            Error::ProcessTerminated => "process_terminated",
            Error::PermissionParse(_) => "permission_parse",
            Error::Session(_) => "session",
            Error::Gateway(_) => "gateway",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for Agentbridge operations
pub type Result<T> = std::result::Result<T, Error>;
