//! Registry trait definitions for port forward management.
//!
//! The registry is the only shared mutable state of the manager. Every
//! mutation is a single atomic step keyed by local port, so callers branch on
//! the returned [`StorageError`] instead of holding map locks across awaits.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::mcp::runner::TunnelHandle;
use crate::mcp::types::{ForwardInfo, ForwardStatus, PortForwardConfig};

/// Reasons a registry operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("no entry for local port")]
    NotFound,

    #[error("entry is {status}")]
    Occupied { status: ForwardStatus },

    #[error("generation {expected} was superseded by {actual}")]
    StaleGeneration { expected: u64, actual: u64 },

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: ForwardStatus,
        to: ForwardStatus,
    },
}

/// A status change requested through compare-and-set.
pub enum StatusChange {
    /// The attempt succeeded; the entry takes ownership of the handle
    Running(Arc<dyn TunnelHandle>),
    /// The attempt failed or the tunnel died; drops the handle
    Failed(String),
    /// Teardown began; the handle stays until the tunnel is gone
    Stopping,
    /// Teardown finished; drops the handle
    Stopped,
}

impl StatusChange {
    pub fn status(&self) -> ForwardStatus {
        match self {
            StatusChange::Running(_) => ForwardStatus::Running,
            StatusChange::Failed(_) => ForwardStatus::Error,
            StatusChange::Stopping => ForwardStatus::Stopping,
            StatusChange::Stopped => ForwardStatus::Stopped,
        }
    }
}

/// Reference to a stored forward for read-only access.
#[derive(Clone)]
pub struct ForwardRef {
    pub info: ForwardInfo,
    pub handle: Option<Arc<dyn TunnelHandle>>,
    /// Serializes start and stop on this local port; survives restarts
    pub op_lock: Arc<Mutex<()>>,
    /// Cancels the current generation's attempt and supervisor
    pub cancel: CancellationToken,
}

/// Trait for port forward registry operations.
///
/// Implementations must be thread-safe (`Send + Sync`) and every method must
/// be atomic with respect to the others.
pub trait ForwardStorage: Send + Sync {
    /// Claim `config.local_port` for a new start attempt.
    ///
    /// Succeeds if the port is absent, `Stopped` or `Error`: the entry becomes
    /// `Starting` with a bumped generation, no handle and no diagnostic.
    /// Any other status yields [`StorageError::Occupied`].
    fn upsert(
        &self,
        config: PortForwardConfig,
        cancel: CancellationToken,
    ) -> Result<ForwardRef, StorageError>;

    /// Get a forward by local port, returning a clone of its data.
    fn get(&self, local_port: u16) -> Result<ForwardRef, StorageError>;

    /// Snapshot of all forwards, ordered by ascending local port.
    fn list(&self) -> Vec<ForwardInfo>;

    /// Forget a quiescent forward. Active forwards yield
    /// [`StorageError::Occupied`].
    fn remove(&self, local_port: u16) -> Result<ForwardInfo, StorageError>;

    /// Apply `change` if the entry is still at `expected_generation` and the
    /// transition is allowed by the lifecycle.
    fn compare_and_set_status(
        &self,
        local_port: u16,
        expected_generation: u64,
        change: StatusChange,
    ) -> Result<ForwardInfo, StorageError>;
}
