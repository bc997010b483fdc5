//! Configuration resolution for the port forward manager.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FORWARD_START_TIMEOUT` | 60s | Caller deadline for starting a forward |
//! | `FORWARD_STOP_TIMEOUT` | 15s | Caller deadline for stopping a forward |
//! | `FORWARD_STOP_GRACE_MS` | 3000ms | Grace period before a tunnel is killed |
//! | `FORWARD_READY_TIMEOUT` | 45s | Wait for the local port to accept connections |
//! | `FORWARD_TEST_TIMEOUT_MS` | 2000ms | Connection test timeout |
//! | `FORWARD_MAX_RETRIES` | 1 | Retries of a transient start failure |
//! | `FORWARD_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `FORWARD_SHUTDOWN_TIMEOUT` | 10s | Bound for stopping all tunnels on exit |
//! | `FORWARD_TRANSPORT` | ssh | `ssh` or `iap` |
//! | `GCLOUD_PATH` | gcloud | gcloud executable |

use std::env;
use std::time::Duration;

/// Default caller deadline for a start in seconds
pub(crate) const DEFAULT_START_TIMEOUT_SECS: u64 = 60;

/// Default caller deadline for a stop in seconds
pub(crate) const DEFAULT_STOP_TIMEOUT_SECS: u64 = 15;

/// Default graceful termination period in milliseconds
pub(crate) const DEFAULT_STOP_GRACE_MS: u64 = 3000;

/// Default readiness wait in seconds
pub(crate) const DEFAULT_READY_TIMEOUT_SECS: u64 = 45;

/// Default connection test timeout in milliseconds
pub(crate) const DEFAULT_TEST_TIMEOUT_MS: u64 = 2000;

/// Default retries for a transient start failure
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Default bound for stopping everything on shutdown in seconds
pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Default gcloud executable
pub(crate) const DEFAULT_GCLOUD_PATH: &str = "gcloud";

/// Maximum retry delay cap (10 seconds)
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const START_TIMEOUT_ENV_VAR: &str = "FORWARD_START_TIMEOUT";
pub(crate) const STOP_TIMEOUT_ENV_VAR: &str = "FORWARD_STOP_TIMEOUT";
pub(crate) const STOP_GRACE_MS_ENV_VAR: &str = "FORWARD_STOP_GRACE_MS";
pub(crate) const READY_TIMEOUT_ENV_VAR: &str = "FORWARD_READY_TIMEOUT";
pub(crate) const TEST_TIMEOUT_MS_ENV_VAR: &str = "FORWARD_TEST_TIMEOUT_MS";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "FORWARD_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "FORWARD_RETRY_DELAY_MS";
pub(crate) const SHUTDOWN_TIMEOUT_ENV_VAR: &str = "FORWARD_SHUTDOWN_TIMEOUT";
pub(crate) const TRANSPORT_ENV_VAR: &str = "FORWARD_TRANSPORT";
pub(crate) const GCLOUD_PATH_ENV_VAR: &str = "GCLOUD_PATH";

/// Resolve a numeric setting with priority: parameter -> env var -> default
fn resolve_u64(param: Option<u64>, env_var: &str, default: u64) -> u64 {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<u64>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

pub(crate) fn resolve_start_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        timeout_secs,
        START_TIMEOUT_ENV_VAR,
        DEFAULT_START_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_stop_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        timeout_secs,
        STOP_TIMEOUT_ENV_VAR,
        DEFAULT_STOP_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_stop_grace(grace_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve_u64(
        grace_ms,
        STOP_GRACE_MS_ENV_VAR,
        DEFAULT_STOP_GRACE_MS,
    ))
}

pub(crate) fn resolve_ready_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        timeout_secs,
        READY_TIMEOUT_ENV_VAR,
        DEFAULT_READY_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_test_timeout(timeout_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve_u64(
        timeout_ms,
        TEST_TIMEOUT_MS_ENV_VAR,
        DEFAULT_TEST_TIMEOUT_MS,
    ))
}

/// Resolve the max retries value with priority: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries: Option<u32>) -> u32 {
    if let Some(value) = max_retries {
        return value;
    }

    if let Ok(raw) = env::var(MAX_RETRIES_ENV_VAR)
        && let Ok(value) = raw.trim().parse::<u32>()
    {
        return value;
    }

    DEFAULT_MAX_RETRIES
}

/// Resolve the retry delay, capped at [`MAX_RETRY_DELAY`]
pub(crate) fn resolve_retry_delay(retry_delay_ms: Option<u64>) -> Duration {
    let delay = Duration::from_millis(resolve_u64(
        retry_delay_ms,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ));
    delay.min(MAX_RETRY_DELAY)
}

pub(crate) fn resolve_shutdown_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        timeout_secs,
        SHUTDOWN_TIMEOUT_ENV_VAR,
        DEFAULT_SHUTDOWN_TIMEOUT_SECS,
    ))
}

/// Resolve the gcloud executable with priority: parameter -> env var -> default
pub(crate) fn resolve_gcloud_path(path: Option<String>) -> String {
    if let Some(path) = path {
        return path;
    }

    match env::var(GCLOUD_PATH_ENV_VAR) {
        Ok(path) if !path.trim().is_empty() => path,
        _ => DEFAULT_GCLOUD_PATH.to_string(),
    }
}

/// Resolve the tunnel transport name, returning `true` for the IAP tunnel
/// transport and `false` for the default ssh transport.
pub(crate) fn resolve_use_iap_transport(transport: Option<&str>) -> bool {
    let value = match transport {
        Some(t) => t.to_string(),
        None => env::var(TRANSPORT_ENV_VAR).unwrap_or_default(),
    };
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "iap" | "iap-tunnel" | "start-iap-tunnel"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Use a mutex to serialize env var tests to avoid race conditions
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    mod start_timeout {
        use super::*;

        #[test]
        fn test_uses_param_when_provided() {
            assert_eq!(resolve_start_timeout(Some(5)), Duration::from_secs(5));
        }

        #[test]
        fn test_param_takes_priority_over_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(START_TIMEOUT_ENV_VAR, "120") };
            let result = resolve_start_timeout(Some(45));
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(START_TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(45));
        }

        #[test]
        fn test_uses_env_var_when_no_param() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(START_TIMEOUT_ENV_VAR, "90") };
            let result = resolve_start_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(START_TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(90));
        }

        #[test]
        fn test_uses_default_when_no_param_or_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(START_TIMEOUT_ENV_VAR) };
            assert_eq!(
                resolve_start_timeout(None),
                Duration::from_secs(DEFAULT_START_TIMEOUT_SECS)
            );
        }

        #[test]
        fn test_ignores_invalid_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(START_TIMEOUT_ENV_VAR, "-10") };
            let result = resolve_start_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(START_TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(DEFAULT_START_TIMEOUT_SECS));
        }
    }

    mod stop_grace {
        use super::*;

        #[test]
        fn test_uses_env_var_in_millis() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(STOP_GRACE_MS_ENV_VAR, "250") };
            let result = resolve_stop_grace(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(STOP_GRACE_MS_ENV_VAR) };
            assert_eq!(result, Duration::from_millis(250));
        }

        #[test]
        fn test_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(STOP_GRACE_MS_ENV_VAR) };
            assert_eq!(
                resolve_stop_grace(None),
                Duration::from_millis(DEFAULT_STOP_GRACE_MS)
            );
        }
    }

    mod retries {
        use super::*;

        #[test]
        fn test_max_retries_param() {
            assert_eq!(resolve_max_retries(Some(4)), 4);
        }

        #[test]
        fn test_max_retries_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(MAX_RETRIES_ENV_VAR, "0") };
            let result = resolve_max_retries(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(MAX_RETRIES_ENV_VAR) };
            assert_eq!(result, 0);
        }

        #[test]
        fn test_retry_delay_is_capped() {
            assert_eq!(resolve_retry_delay(Some(60_000)), MAX_RETRY_DELAY);
        }

        #[test]
        fn test_retry_delay_param() {
            assert_eq!(resolve_retry_delay(Some(200)), Duration::from_millis(200));
        }
    }

    mod transport {
        use super::*;

        #[test]
        fn test_explicit_values() {
            assert!(resolve_use_iap_transport(Some("iap")));
            assert!(resolve_use_iap_transport(Some("IAP")));
            assert!(!resolve_use_iap_transport(Some("ssh")));
            assert!(!resolve_use_iap_transport(Some("bogus")));
        }

        #[test]
        fn test_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(TRANSPORT_ENV_VAR, "start-iap-tunnel") };
            let result = resolve_use_iap_transport(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(TRANSPORT_ENV_VAR) };
            assert!(result);
        }

        #[test]
        fn test_default_is_ssh() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(TRANSPORT_ENV_VAR) };
            assert!(!resolve_use_iap_transport(None));
        }
    }

    mod gcloud_path {
        use super::*;

        #[test]
        fn test_param_wins() {
            assert_eq!(
                resolve_gcloud_path(Some("/opt/google-cloud-sdk/bin/gcloud".to_string())),
                "/opt/google-cloud-sdk/bin/gcloud"
            );
        }

        #[test]
        fn test_blank_env_falls_back_to_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { set_env(GCLOUD_PATH_ENV_VAR, "  ") };
            let result = resolve_gcloud_path(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe { remove_env(GCLOUD_PATH_ENV_VAR) };
            assert_eq!(result, DEFAULT_GCLOUD_PATH);
        }
    }
}
