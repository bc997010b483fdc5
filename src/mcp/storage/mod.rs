//! Registry abstraction for port forward management.
//!
//! This module provides a trait-based registry that enables:
//! - Dependency injection for testability
//! - Per-port atomic updates via a DashMap implementation
//! - Generation-guarded status changes for asynchronous callbacks

mod forward;
mod traits;

pub use forward::DashMapForwardStorage;
pub use traits::{ForwardRef, ForwardStorage, StatusChange, StorageError};
