//! Connection tester.
//!
//! A single bounded TCP dial to `localhost:port`. No retries here; callers
//! that want a retry policy (such as the runner's readiness wait) own it.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Host every forward listens on.
pub const LOCALHOST: &str = "localhost";

/// Returns `true` if `localhost:port` accepts a TCP connection within
/// `timeout`, `false` on refusal or timeout.
pub async fn test_connection(port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((LOCALHOST, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!("Connection test to {}:{} failed: {}", LOCALHOST, port, e);
            false
        }
        Err(_) => {
            debug!(
                "Connection test to {}:{} timed out after {:?}",
                LOCALHOST, port, timeout
            );
            false
        }
    }
}
