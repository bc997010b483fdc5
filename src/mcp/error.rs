//! Error taxonomy for port forward operations and diagnostic classification.
//!
//! Every [`ForwardError`] is recoverable and reported to the caller as a
//! structured result. A crashed tunnel is never raised to a caller; the
//! supervisor records [`ForwardError::TunnelCrashed`] as the entry's
//! diagnostic instead.
//!
//! # Classification Strategy
//!
//! Tunnel start failures carry a free-form diagnostic from `gcloud`. The
//! manager only retries the ones that look transient:
//!
//! 1. **Permanent failures (NOT retryable)**: credential, permission, unknown
//!    resource or local bind problems. Retrying cannot fix them.
//!
//! 2. **Transient failures (retryable)**: refused/reset connections, timeouts,
//!    IAP backend connection errors, a tunnel that never became ready.
//!
//! 3. **Unknown diagnostics**: not retried.
//!
//! Permanent patterns are checked first, so "permission denied after timeout"
//! is not retried.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the port forward manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    #[error("No port forward on local port {0}")]
    NotFound(u16),

    #[error("Local port {0} is already forwarded")]
    PortInUse(u16),

    #[error("Failed to establish tunnel on local port {port}: {diagnostic}")]
    TunnelEstablishFailed { port: u16, diagnostic: String },

    #[error("Tunnel on local port {port} exited unexpectedly: {diagnostic}")]
    TunnelCrashed { port: u16, diagnostic: String },

    #[error("{operation} on local port {port} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        port: u16,
        timeout: Duration,
    },

    #[error("Invalid port forward configuration: {0}")]
    InvalidConfig(String),

    /// A detached start/stop task ended abnormally
    #[error("Internal error on local port {port}: {message}")]
    Internal { port: u16, message: String },
}

/// Diagnostic patterns that indicate permanent start failures.
const PERMANENT_ERRORS: &[&str] = &[
    "permission denied",
    "not authorized",
    "reauthentication",
    "you do not currently have an active account",
    "not found",
    "was not found",
    "invalid value",
    "already in use",
    "address in use",
    "could not fetch resource",
    "no such file or directory",
    "failed to launch",
];

/// Diagnostic patterns that indicate transient start failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "timed out",
    "timeout",
    "failed to connect to backend",
    "network is unreachable",
    "temporary failure",
    "did not accept connections",
    "broken pipe",
    "4003",
];

/// Determines if a tunnel start diagnostic is worth retrying.
pub(crate) fn is_retryable_diagnostic(diagnostic: &str) -> bool {
    let lower = diagnostic.to_lowercase();

    if PERMANENT_ERRORS.iter().any(|p| lower.contains(p)) {
        return false;
    }

    RETRYABLE_ERRORS.iter().any(|p| lower.contains(p))
}
