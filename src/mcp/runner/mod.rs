//! Tunnel runners.
//!
//! - [`TunnelRunner`] / [`TunnelHandle`]: the transport-agnostic contract
//! - [`ProcessTunnel`]: a supervised child process implementing the handle
//! - [`GcloudRunner`]: `gcloud compute ssh` / `start-iap-tunnel` transports

#[cfg(test)]
pub(crate) mod fake;
mod gcloud;
mod process;
mod traits;

pub use gcloud::{GcloudRunner, GcloudTransport};
pub use process::ProcessTunnel;
pub use traits::{Liveness, TunnelHandle, TunnelRunner, TunnelTarget};
