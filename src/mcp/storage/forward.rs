//! DashMap-based port forward registry.
//!
//! One `DashMap` shard lock guards each entry for the duration of a single
//! registry call; nothing is held across an await. Entries are keyed by local
//! port, so operations on different ports never contend beyond shard sharing.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::mcp::runner::TunnelHandle;
use crate::mcp::types::{ForwardInfo, ForwardStatus, PortForwardConfig};

use super::traits::{ForwardRef, ForwardStorage, StatusChange, StorageError};

/// Stored forward combining the caller-visible snapshot with the owned
/// tunnel handle.
struct StoredForward {
    info: ForwardInfo,
    handle: Option<Arc<dyn TunnelHandle>>,
    op_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl StoredForward {
    fn to_ref(&self) -> ForwardRef {
        ForwardRef {
            info: self.info.clone(),
            handle: self.handle.clone(),
            op_lock: self.op_lock.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// A `Stopped` entry owning a handle means transition bookkeeping lost
    /// track of a tunnel.
    fn check_invariants(&self) {
        let violated = self.info.status() == ForwardStatus::Stopped && self.handle.is_some();
        if violated {
            error!(
                "Invariant violated: port forward on local port {} is Stopped but still owns tunnel {:?}",
                self.info.local_port(),
                self.info.tunnel_id
            );
        }
        debug_assert!(!violated, "Stopped entry owns a tunnel handle");
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// DashMap-based implementation of `ForwardStorage`.
pub struct DashMapForwardStorage {
    forwards: DashMap<u16, StoredForward>,
}

impl DashMapForwardStorage {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            forwards: DashMap::new(),
        }
    }
}

impl Default for DashMapForwardStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardStorage for DashMapForwardStorage {
    fn upsert(
        &self,
        mut config: PortForwardConfig,
        cancel: CancellationToken,
    ) -> Result<ForwardRef, StorageError> {
        config.status = ForwardStatus::Starting;

        match self.forwards.entry(config.local_port) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                let status = stored.info.status();
                if !status.is_quiescent() {
                    return Err(StorageError::Occupied { status });
                }
                stored.info = ForwardInfo {
                    config,
                    generation: stored.info.generation + 1,
                    diagnostic: None,
                    tunnel_id: None,
                    updated_at: now(),
                };
                stored.handle = None;
                stored.cancel = cancel;
                Ok(stored.to_ref())
            }
            Entry::Vacant(vacant) => {
                let stored = vacant.insert(StoredForward {
                    info: ForwardInfo {
                        config,
                        generation: 1,
                        diagnostic: None,
                        tunnel_id: None,
                        updated_at: now(),
                    },
                    handle: None,
                    op_lock: Arc::new(Mutex::new(())),
                    cancel,
                });
                Ok(stored.to_ref())
            }
        }
    }

    fn get(&self, local_port: u16) -> Result<ForwardRef, StorageError> {
        self.forwards
            .get(&local_port)
            .map(|entry| entry.to_ref())
            .ok_or(StorageError::NotFound)
    }

    fn list(&self) -> Vec<ForwardInfo> {
        let mut forwards: Vec<ForwardInfo> = self
            .forwards
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        forwards.sort_by_key(|info| info.local_port());
        forwards
    }

    fn remove(&self, local_port: u16) -> Result<ForwardInfo, StorageError> {
        let status = self
            .forwards
            .get(&local_port)
            .map(|entry| entry.info.status())
            .ok_or(StorageError::NotFound)?;
        if !status.is_quiescent() {
            return Err(StorageError::Occupied { status });
        }

        // Re-checked under the shard lock in case a start claimed it meanwhile
        self.forwards
            .remove_if(&local_port, |_, stored| stored.info.status().is_quiescent())
            .map(|(_, stored)| stored.info)
            .ok_or_else(|| match self.forwards.get(&local_port) {
                Some(entry) => StorageError::Occupied {
                    status: entry.info.status(),
                },
                None => StorageError::NotFound,
            })
    }

    fn compare_and_set_status(
        &self,
        local_port: u16,
        expected_generation: u64,
        change: StatusChange,
    ) -> Result<ForwardInfo, StorageError> {
        let mut stored = self
            .forwards
            .get_mut(&local_port)
            .ok_or(StorageError::NotFound)?;

        if stored.info.generation != expected_generation {
            return Err(StorageError::StaleGeneration {
                expected: expected_generation,
                actual: stored.info.generation,
            });
        }

        let from = stored.info.status();
        let to = change.status();
        if !from.can_transition_to(to) {
            return Err(StorageError::InvalidTransition { from, to });
        }

        match change {
            StatusChange::Running(handle) => {
                stored.info.tunnel_id = Some(handle.id().to_string());
                stored.handle = Some(handle);
            }
            StatusChange::Failed(diagnostic) => {
                stored.info.diagnostic = Some(diagnostic);
                stored.info.tunnel_id = None;
                stored.handle = None;
            }
            StatusChange::Stopping => {}
            StatusChange::Stopped => {
                stored.info.diagnostic = None;
                stored.info.tunnel_id = None;
                stored.handle = None;
            }
        }
        stored.info.config.status = to;
        stored.info.updated_at = now();
        stored.check_invariants();

        Ok(stored.info.clone())
    }
}
