//! Structured error types for the fabric.
//!
//! Every error maps to a stable numeric code grouped by range so that task
//! results and stream records carry machine-readable failure reasons across
//! process boundaries.

use std::time::Duration;
use thiserror::Error;

/// Primary error type shared by the agent and the server.
#[derive(Error, Debug)]
pub enum FabricError {
    // =========================================================================
    // Generic (1000-1999)
    // =========================================================================
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("invalid parameter: {message}")]
    InvalidParam { message: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    // =========================================================================
    // Network / session (2000-2999)
    // =========================================================================
    #[error("network error: {message}")]
    Network { message: String },

    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("request failed: {message}")]
    RequestFailed { message: String },

    #[error("unexpected response: {message}")]
    ResponseError { message: String },

    /// Handshake was rejected with 401/403/404. A hard signal: the agent
    /// must re-register before any further reconnect attempt.
    #[error("session unauthorized or agent unknown")]
    AuthOrNotFound,

    #[error("session not connected")]
    NotConnected,

    // =========================================================================
    // Execution (3000-3999)
    // =========================================================================
    #[error("execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("command not found: {command}")]
    CommandNotFound { command: String },

    #[error("script error: {message}")]
    ScriptError { message: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("process killed")]
    ProcessKilled,

    #[error("process exited with code {code}")]
    ExitCodeNonZero { code: i32 },

    // =========================================================================
    // File transfer (4000-4999)
    // =========================================================================
    #[error("file transfer failed: {message}")]
    TransferFailed { message: String },

    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("file read error: {message}")]
    FileRead { message: String },

    #[error("file write error: {message}")]
    FileWrite { message: String },

    #[error("disk space insufficient: {message}")]
    DiskFull { message: String },

    // =========================================================================
    // Configuration (5000-5999)
    // =========================================================================
    #[error("config error: {message}")]
    Config { message: String },

    #[error("config not found: {path}")]
    ConfigNotFound { path: String },

    #[error("invalid config: {message}")]
    ConfigInvalid { message: String },

    // =========================================================================
    // Resource limits (6000-6999)
    // =========================================================================
    #[error("resource limit exceeded: {message}")]
    ResourceLimit { message: String },

    #[error("bandwidth limit exceeded")]
    BandwidthLimit,

    // =========================================================================
    // External wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FabricError {
    /// Stable numeric code, grouped by range.
    pub fn code(&self) -> u32 {
        match self {
            Self::Internal { .. } => 1001,
            Self::InvalidParam { .. } => 1002,
            Self::NotFound { .. } => 1003,
            Self::Timeout { .. } => 1004,

            Self::Network { .. } => 2000,
            Self::ConnectionFailed { .. } => 2001,
            Self::ConnectionTimeout => 2002,
            Self::RequestFailed { .. } => 2003,
            Self::ResponseError { .. } => 2004,
            Self::AuthOrNotFound => 2005,
            Self::NotConnected => 2006,

            Self::ExecutionFailed { .. } => 3000,
            Self::CommandNotFound { .. } => 3001,
            Self::ScriptError { .. } => 3002,
            Self::PermissionDenied { .. } => 3003,
            Self::ProcessKilled => 3004,
            Self::ExitCodeNonZero { .. } => 3005,

            Self::TransferFailed { .. } => 4000,
            Self::FileNotFound { .. } => 4001,
            Self::FileRead { .. } => 4002,
            Self::FileWrite { .. } => 4003,
            Self::DiskFull { .. } => 4005,

            Self::Config { .. } => 5000,
            Self::ConfigNotFound { .. } => 5001,
            Self::ConfigInvalid { .. } => 5002,

            Self::ResourceLimit { .. } => 6000,
            Self::BandwidthLimit => 6004,

            Self::Io(_) => 1001,
            Self::Json(_) => 1002,
        }
    }

    /// Whether the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::ConnectionFailed { .. }
            | Self::ConnectionTimeout
            | Self::RequestFailed { .. }
            | Self::Timeout { .. }
            | Self::NotConnected => true,

            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            _ => false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::InvalidParam {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}

/// Result type alias using FabricError.
pub type Result<T> = std::result::Result<T, FabricError>;
