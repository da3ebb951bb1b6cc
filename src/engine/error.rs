//! Error taxonomy for the session and connection engine.
//!
//! Every failure the engine can report falls into one of a few classes, and
//! each class has a fixed consequence:
//!
//! | Variant | Raised when | Consequence |
//! |---------|-------------|-------------|
//! | [`EngineError::Connect`] | process spawn or remote handshake fails | surfaced to the caller, nothing registered |
//! | [`EngineError::Transport`] | mid-session I/O fails | session/connection closed, not retried |
//! | [`EngineError::Validation`] | an action or parameter is invalid | rejected before any remote call |
//! | [`EngineError::Parse`] | command output is malformed | degraded to a default value |
//! | [`EngineError::Probe`] | a reachability check fails | device treated as unreachable this cycle |
//! | [`EngineError::Inventory`] | the device inventory cannot be read | sweep skipped, loop backs off |
//!
//! # Retry classification
//!
//! Connect errors are further split into transient and permanent failures by
//! [`is_retryable_error`]. Authentication failures are never retried so a bad
//! password cannot lock an account out.

use thiserror::Error;

/// Errors produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unparseable output: {0}")]
    Parse(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("inventory unavailable: {0}")]
    Inventory(String),
}

impl EngineError {
    /// Whether a connect attempt that failed with this error is worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Connect(message) => is_retryable_error(message),
            _ => false,
        }
    }
}

impl From<russh::Error> for EngineError {
    fn from(err: russh::Error) -> Self {
        EngineError::Transport(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for EngineError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        EngineError::Transport(err.to_string())
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "private key",
    "ssh agent",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Determines if a connect failure message describes a transient condition.
///
/// Authentication patterns are checked first and win over connection
/// patterns. Messages matching neither are retried unless they look like an
/// SSH protocol error without a timeout/connect hint.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return true;
    }

    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}
