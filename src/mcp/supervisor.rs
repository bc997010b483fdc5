//! Background watcher for running tunnels.
//!
//! One supervisor per `Running` generation. It waits for the tunnel's
//! liveness to flip to `Exited` and records the crash, unless the entry has
//! moved on (stopped, restarted, or already failed).

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mcp::error::ForwardError;
use crate::mcp::runner::Liveness;
use crate::mcp::storage::{ForwardStorage, StatusChange};

pub(crate) fn spawn_supervisor(
    registry: Arc<dyn ForwardStorage>,
    local_port: u16,
    generation: u64,
    mut liveness: watch::Receiver<Liveness>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let diagnostic = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(
                    "Supervisor for local port {} (generation {}) cancelled",
                    local_port, generation
                );
                return;
            }
            diagnostic = wait_for_exit(&mut liveness) => diagnostic,
        };

        let crash = ForwardError::TunnelCrashed {
            port: local_port,
            diagnostic,
        };
        match registry.compare_and_set_status(
            local_port,
            generation,
            StatusChange::Failed(crash.to_string()),
        ) {
            Ok(_) => warn!("{}", crash),
            Err(e) => debug!(
                "Ignoring tunnel exit on local port {} (generation {}): {}",
                local_port, generation, e
            ),
        }
    })
}

async fn wait_for_exit(liveness: &mut watch::Receiver<Liveness>) -> String {
    loop {
        let current = liveness.borrow_and_update().clone();
        if let Liveness::Exited(diagnostic) = current {
            return diagnostic;
        }
        if liveness.changed().await.is_err() {
            // Sender gone without publishing an exit
            return match liveness.borrow().clone() {
                Liveness::Exited(diagnostic) => diagnostic,
                Liveness::Alive => "tunnel handle was dropped".to_string(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::mcp::runner::TunnelHandle;
    use crate::mcp::storage::DashMapForwardStorage;
    use crate::mcp::types::{ForwardStatus, PortForwardConfig};

    struct ScriptedHandle {
        liveness: watch::Sender<Liveness>,
    }

    #[async_trait]
    impl TunnelHandle for ScriptedHandle {
        fn id(&self) -> &str {
            "scripted"
        }

        fn liveness(&self) -> Liveness {
            self.liveness.borrow().clone()
        }

        fn subscribe(&self) -> watch::Receiver<Liveness> {
            self.liveness.subscribe()
        }

        async fn stop(&self, _grace: Duration) -> Result<(), String> {
            Ok(())
        }
    }

    fn running(registry: &Arc<dyn ForwardStorage>, port: u16) -> (Arc<ScriptedHandle>, u64) {
        let claimed = registry
            .upsert(
                PortForwardConfig::new(port, 22, "p1", "z1", "vm-1"),
                CancellationToken::new(),
            )
            .unwrap();
        let handle = Arc::new(ScriptedHandle {
            liveness: watch::channel(Liveness::Alive).0,
        });
        registry
            .compare_and_set_status(
                port,
                claimed.info.generation,
                StatusChange::Running(handle.clone()),
            )
            .unwrap();
        (handle, claimed.info.generation)
    }

    #[tokio::test]
    async fn test_exit_marks_entry_error() {
        let registry: Arc<dyn ForwardStorage> = Arc::new(DashMapForwardStorage::new());
        let (handle, generation) = running(&registry, 8080);

        let task = spawn_supervisor(
            registry.clone(),
            8080,
            generation,
            handle.subscribe(),
            CancellationToken::new(),
        );
        handle
            .liveness
            .send_replace(Liveness::Exited("exit status: 255".to_string()));
        task.await.unwrap();

        let info = registry.get(8080).unwrap().info;
        assert_eq!(info.status(), ForwardStatus::Error);
        assert!(info.diagnostic.unwrap().contains("exit status: 255"));
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let registry: Arc<dyn ForwardStorage> = Arc::new(DashMapForwardStorage::new());
        let (old, generation) = running(&registry, 8080);

        // Old generation fails, a new one takes over
        registry
            .compare_and_set_status(8080, generation, StatusChange::Failed("x".to_string()))
            .unwrap();
        let (_new, new_generation) = running(&registry, 8080);

        let task = spawn_supervisor(
            registry.clone(),
            8080,
            generation,
            old.subscribe(),
            CancellationToken::new(),
        );
        old.liveness
            .send_replace(Liveness::Exited("late".to_string()));
        task.await.unwrap();

        let info = registry.get(8080).unwrap().info;
        assert_eq!(info.generation, new_generation);
        assert_eq!(info.status(), ForwardStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_stops_watching() {
        let registry: Arc<dyn ForwardStorage> = Arc::new(DashMapForwardStorage::new());
        let (handle, generation) = running(&registry, 8080);
        let cancel = CancellationToken::new();

        let task = spawn_supervisor(
            registry.clone(),
            8080,
            generation,
            handle.subscribe(),
            cancel.clone(),
        );
        cancel.cancel();
        task.await.unwrap();

        handle
            .liveness
            .send_replace(Liveness::Exited("after cancel".to_string()));
        assert_eq!(
            registry.get(8080).unwrap().info.status(),
            ForwardStatus::Running
        );
    }
}
