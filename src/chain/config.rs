//! Runtime configuration for session chains.
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
//! | `SSH_CHAIN_CONFIG` | `ssh_hosts.json` | Host inventory path |
//! | `SSH_CHAIN_CONNECT_TIMEOUT` | 30s | Per-hop timeout when a host sets none |
//! | `SSH_CHAIN_COMMAND_TIMEOUT` | 30s | Command execution timeout |
//! | `SSH_CHAIN_POLL_INTERVAL_MS` | 100ms | Sleep between receive polls |
//! | `SSH_CHAIN_MAX_RETRIES` | 0 | Retries of retryable failures (CLI) |
//! | `SSH_CHAIN_RETRY_DELAY_MS` | 1000ms | Initial retry delay (CLI) |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default inventory file name
pub const DEFAULT_CONFIG_PATH: &str = "ssh_hosts.json";

/// Default per-hop timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default command execution timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default sleep between non-blocking receive polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default retry attempts (the chain itself never retries)
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Default initial retry delay in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub const CONFIG_PATH_ENV_VAR: &str = "SSH_CHAIN_CONFIG";
pub const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CHAIN_CONNECT_TIMEOUT";
pub const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_CHAIN_COMMAND_TIMEOUT";
pub const POLL_INTERVAL_ENV_VAR: &str = "SSH_CHAIN_POLL_INTERVAL_MS";
pub const MAX_RETRIES_ENV_VAR: &str = "SSH_CHAIN_MAX_RETRIES";
pub const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_CHAIN_RETRY_DELAY_MS";

/// Parameter -> environment variable -> default. Unparsable env values fall
/// through to the default.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
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

/// Resolve the inventory path.
pub fn resolve_config_path(path_param: Option<PathBuf>) -> PathBuf {
    resolve(
        path_param,
        CONFIG_PATH_ENV_VAR,
        PathBuf::from(DEFAULT_CONFIG_PATH),
    )
}

/// Resolve the per-hop timeout used when a host entry has no `timeout`.
pub fn resolve_connect_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_secs,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

/// Resolve the command execution timeout.
pub fn resolve_command_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_secs,
        COMMAND_TIMEOUT_ENV_VAR,
        DEFAULT_COMMAND_TIMEOUT_SECS,
    ))
}

/// Resolve the sleep between receive polls in the expect loop.
pub fn resolve_poll_interval(interval_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        interval_ms,
        POLL_INTERVAL_ENV_VAR,
        DEFAULT_POLL_INTERVAL_MS,
    ))
}

/// Resolve the number of retries the CLI performs on retryable failures.
pub fn resolve_max_retries(max_retries: Option<u32>) -> u32 {
    resolve(max_retries, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

/// Resolve the initial retry delay.
pub fn resolve_retry_delay(delay_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        delay_ms,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ))
}
