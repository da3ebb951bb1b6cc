//! Configuration resolution for the engine.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DCOPS_CONNECT_TIMEOUT` | 10s | Remote handshake timeout in seconds |
//! | `DCOPS_COMMAND_TIMEOUT` | 30s | Remote command / transfer timeout in seconds |
//! | `DCOPS_MAX_RETRIES` | 2 | Connect retry attempts for transient errors |
//! | `DCOPS_RETRY_DELAY_MS` | 500ms | Initial retry delay in milliseconds |
//! | `DCOPS_READ_POLL_MS` | 50ms | Session output poll timeout |
//! | `DCOPS_SWEEP_INTERVAL` | 30s | Reachability sweep interval |
//! | `DCOPS_PROBE_TIMEOUT` | 2s | Per-device probe timeout |
//! | `DCOPS_SWEEP_BACKOFF` | 10s | Wait after a failed sweep |
//! | `DCOPS_STATS_INTERVAL` | 3s | Per-client stats stream period |

use std::env;
use std::str::FromStr;
use std::time::Duration;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 2;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub(crate) const DEFAULT_READ_POLL_MS: u64 = 50;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub(crate) const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 2;
pub(crate) const DEFAULT_SWEEP_BACKOFF_SECS: u64 = 10;
pub(crate) const DEFAULT_STATS_INTERVAL_SECS: u64 = 3;

/// Maximum retry delay cap (10 seconds)
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "DCOPS_CONNECT_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "DCOPS_COMMAND_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "DCOPS_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "DCOPS_RETRY_DELAY_MS";
pub(crate) const READ_POLL_MS_ENV_VAR: &str = "DCOPS_READ_POLL_MS";
pub(crate) const SWEEP_INTERVAL_ENV_VAR: &str = "DCOPS_SWEEP_INTERVAL";
pub(crate) const PROBE_TIMEOUT_ENV_VAR: &str = "DCOPS_PROBE_TIMEOUT";
pub(crate) const SWEEP_BACKOFF_ENV_VAR: &str = "DCOPS_SWEEP_BACKOFF";
pub(crate) const STATS_INTERVAL_ENV_VAR: &str = "DCOPS_STATS_INTERVAL";

/// Resolve a value with priority: parameter -> env var -> default.
///
/// Unparseable environment values are ignored and fall through to the default.
pub(crate) fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

fn resolve_secs(param: Option<u64>, env_var: &str, default: u64) -> Duration {
    Duration::from_secs(resolve(param, env_var, default))
}

fn resolve_millis(param: Option<u64>, env_var: &str, default: u64) -> Duration {
    Duration::from_millis(resolve(param, env_var, default))
}

/// Resolve the remote handshake timeout.
pub(crate) fn resolve_connect_timeout(param: Option<u64>) -> Duration {
    resolve_secs(param, CONNECT_TIMEOUT_ENV_VAR, DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the one-shot command timeout.
pub(crate) fn resolve_command_timeout(param: Option<u64>) -> Duration {
    resolve_secs(param, COMMAND_TIMEOUT_ENV_VAR, DEFAULT_COMMAND_TIMEOUT_SECS)
}

pub(crate) fn resolve_max_retries(param: Option<u32>) -> u32 {
    resolve(param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

pub(crate) fn resolve_retry_delay(param: Option<u64>) -> Duration {
    resolve_millis(param, RETRY_DELAY_MS_ENV_VAR, DEFAULT_RETRY_DELAY_MS)
}

pub(crate) fn resolve_read_poll(param: Option<u64>) -> Duration {
    resolve_millis(param, READ_POLL_MS_ENV_VAR, DEFAULT_READ_POLL_MS)
}

pub(crate) fn resolve_sweep_interval(param: Option<u64>) -> Duration {
    resolve_secs(param, SWEEP_INTERVAL_ENV_VAR, DEFAULT_SWEEP_INTERVAL_SECS)
}

pub(crate) fn resolve_probe_timeout(param: Option<u64>) -> Duration {
    resolve_secs(param, PROBE_TIMEOUT_ENV_VAR, DEFAULT_PROBE_TIMEOUT_SECS)
}

pub(crate) fn resolve_sweep_backoff(param: Option<u64>) -> Duration {
    resolve_secs(param, SWEEP_BACKOFF_ENV_VAR, DEFAULT_SWEEP_BACKOFF_SECS)
}

pub(crate) fn resolve_stats_interval(param: Option<u64>) -> Duration {
    resolve_secs(param, STATS_INTERVAL_ENV_VAR, DEFAULT_STATS_INTERVAL_SECS)
}

/// Settings for establishing remote connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl ConnectSettings {
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_connect_timeout(None),
            command_timeout: resolve_command_timeout(None),
            max_retries: resolve_max_retries(None),
            retry_delay: resolve_retry_delay(None),
        }
    }
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Settings for the fleet-wide reachability sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub sweep_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_backoff: Duration,
}

impl MonitorSettings {
    pub fn from_env() -> Self {
        Self {
            sweep_interval: resolve_sweep_interval(None),
            probe_timeout: resolve_probe_timeout(None),
            failure_backoff: resolve_sweep_backoff(None),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            failure_backoff: Duration::from_secs(DEFAULT_SWEEP_BACKOFF_SECS),
        }
    }
}

/// All engine settings in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub connect: ConnectSettings,
    pub monitor: MonitorSettings,
    pub read_poll: Duration,
    pub stats_interval: Duration,
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self {
            connect: ConnectSettings::from_env(),
            monitor: MonitorSettings::from_env(),
            read_poll: resolve_read_poll(None),
            stats_interval: resolve_stats_interval(None),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect: ConnectSettings::default(),
            monitor: MonitorSettings::default(),
            read_poll: Duration::from_millis(DEFAULT_READ_POLL_MS),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // SAFETY: Tests are serialized via ENV_TEST_MUTEX to prevent data races
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

    mod config_resolution {
        use super::*;

        #[test]
        fn test_uses_param_when_provided() {
            assert_eq!(resolve_connect_timeout(Some(45)), Duration::from_secs(45));
            assert_eq!(resolve_max_retries(Some(0)), 0);
            assert_eq!(resolve_retry_delay(Some(250)), Duration::from_millis(250));
        }

        #[test]
        fn test_param_takes_priority_over_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(SWEEP_INTERVAL_ENV_VAR, "120");
            }
            let result = resolve_sweep_interval(Some(5));
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(SWEEP_INTERVAL_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(5));
        }

        #[test]
        fn test_uses_env_var_when_no_param() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PROBE_TIMEOUT_ENV_VAR, "4");
            }
            let result = resolve_probe_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(4));
        }

        #[test]
        fn test_uses_default_when_no_param_or_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(STATS_INTERVAL_ENV_VAR);
            }
            assert_eq!(
                resolve_stats_interval(None),
                Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS)
            );
        }

        #[test]
        fn test_ignores_invalid_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(READ_POLL_MS_ENV_VAR, "soon");
            }
            let result = resolve_read_poll(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(READ_POLL_MS_ENV_VAR);
            }
            assert_eq!(result, Duration::from_millis(DEFAULT_READ_POLL_MS));
        }

        #[test]
        fn test_ignores_negative_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(MAX_RETRIES_ENV_VAR, "-1");
            }
            let result = resolve_max_retries(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(MAX_RETRIES_ENV_VAR);
            }
            assert_eq!(result, DEFAULT_MAX_RETRIES);
        }
    }

    mod defaults {
        use super::*;

        #[test]
        fn test_monitor_defaults_match_sweep_contract() {
            let settings = MonitorSettings::default();
            assert_eq!(settings.sweep_interval, Duration::from_secs(30));
            assert_eq!(settings.probe_timeout, Duration::from_secs(2));
        }

        #[test]
        fn test_read_poll_is_tens_of_millis() {
            let settings = EngineSettings::default();
            assert!(settings.read_poll >= Duration::from_millis(10));
            assert!(settings.read_poll < Duration::from_millis(100));
        }

        #[test]
        fn test_max_retry_delay_is_reasonable() {
            assert!(MAX_RETRY_DELAY.as_secs() >= 5);
            assert!(MAX_RETRY_DELAY.as_secs() <= 60);
        }
    }
}
