//! Error taxonomy for session chains.
//!
//! Every failure surfaced by the chain is a [`ChainError`]. The variants map
//! onto a small set of kinds ([`ErrorKind`]) so callers can react the same way
//! regardless of which connection strategy produced the failure:
//!
//! 1. **Configuration** (`UnknownHost`, `CyclicChain`, `InvalidConfig`): the
//!    inventory is wrong. Never retried.
//! 2. **Connection**: transport failure while a hop was opening (network,
//!    handshake, authentication). Retryable only when the message looks
//!    transient, see [`is_retryable_error`].
//! 3. **Timeout**: a wall-clock deadline elapsed while waiting for a pattern
//!    or a command. Always retryable.
//! 4. **Command**: the target ran the command but reported failure.
//! 5. **NotConnected**: a hop was used before it was open. Programmer error.
//! 6. **Teardown**: the command succeeded but closing the chain failed. The
//!    captured output travels with the error so the success is not lost.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::node::HopState;

/// All possible errors produced while building, establishing, using or tearing
/// down a session chain.
#[derive(Error, Debug)]
pub enum ChainError {
    /// A referenced host name is not in the inventory.
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// Bastion resolution revisited a host.
    #[error("Cyclic bastion chain at '{host}': {}", .path.join(" -> "))]
    CyclicChain { host: String, path: Vec<String> },

    /// Transport-level failure while opening (or closing) a hop.
    #[error("Connection to '{host}' failed: {message}")]
    Connection { host: String, message: String },

    /// `send`/`run` on a hop that is not open.
    #[error("Host '{host}' is not connected (state: {state})")]
    NotConnected { host: String, state: HopState },

    /// The target reported a failed command.
    #[error("Command failed on '{host}': {message}")]
    Command {
        host: String,
        message: String,
        partial_output: String,
    },

    /// A deadline elapsed while waiting for an expected pattern or output.
    #[error("Timed out on '{host}' after {waited:?} waiting for {pattern}")]
    Timeout {
        host: String,
        pattern: String,
        waited: Duration,
        partial_output: String,
    },

    /// The command succeeded, closing one or more hops did not.
    #[error("Teardown failed after the command completed: {}", join_messages(.errors))]
    Teardown {
        output: String,
        errors: Vec<ChainError>,
    },

    /// The inventory could not be turned into host configurations.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read the inventory from disk.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The inventory is not valid JSON.
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a [`ChainError`], printed by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownHost,
    CyclicChain,
    Connection,
    NotConnected,
    Command,
    Timeout,
    Teardown,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UnknownHost => "UnknownHostError",
            ErrorKind::CyclicChain => "CyclicChainError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::NotConnected => "NotConnectedError",
            ErrorKind::Command => "CommandError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Teardown => "TeardownError",
            ErrorKind::Config => "ConfigError",
        };
        f.write_str(name)
    }
}

impl ChainError {
    pub(crate) fn connection(host: &str, message: impl fmt::Display) -> Self {
        ChainError::Connection {
            host: host.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn command(
        host: &str,
        message: impl fmt::Display,
        partial_output: impl Into<String>,
    ) -> Self {
        ChainError::Command {
            host: host.to_string(),
            message: message.to_string(),
            partial_output: partial_output.into(),
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::UnknownHost(_) => ErrorKind::UnknownHost,
            ChainError::CyclicChain { .. } => ErrorKind::CyclicChain,
            ChainError::Connection { .. } => ErrorKind::Connection,
            ChainError::NotConnected { .. } => ErrorKind::NotConnected,
            ChainError::Command { .. } => ErrorKind::Command,
            ChainError::Timeout { .. } => ErrorKind::Timeout,
            ChainError::Teardown { .. } => ErrorKind::Teardown,
            ChainError::InvalidConfig(_) | ChainError::Io(_) | ChainError::Json(_) => {
                ErrorKind::Config
            }
        }
    }

    /// Output captured before the failure, when there is any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            ChainError::Command { partial_output, .. }
            | ChainError::Timeout { partial_output, .. } => Some(partial_output),
            ChainError::Teardown { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Whether a caller may reasonably retry the whole invocation.
    ///
    /// The chain itself never retries; this is advice for the collaborator
    /// that owns the retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChainError::Timeout { .. } => true,
            ChainError::Connection { message, .. } => is_retryable_error(message),
            _ => false,
        }
    }
}

fn join_messages(errors: &[ChainError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Authentication error patterns that indicate permanent failures.
///
/// Retrying these only risks locking the account.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "password rejected",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Determines if a transport error message describes a transient failure.
///
/// Authentication failures are checked first and take precedence, so
/// "timeout during authentication failed" is NOT retryable. Messages that
/// match neither list are retried unless they look like SSH protocol errors.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|auth_err| error_lower.contains(auth_err)) {
        return false;
    }

    if RETRYABLE_ERRORS
        .iter()
        .any(|retryable_err| error_lower.contains(retryable_err))
    {
        return true;
    }

    !error_lower.contains("ssh") || error_lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn test_auth_failures_not_retryable() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("permission denied (publickey)"));
            assert!(!is_retryable_error("Password rejected by bastion-1"));
        }

        #[test]
        fn test_network_failures_retryable() {
            assert!(is_retryable_error("Connection refused"));
            assert!(is_retryable_error("Connection timed out after 30s"));
            assert!(is_retryable_error("No route to host"));
        }

        #[test]
        fn test_auth_takes_precedence_over_network() {
            assert!(!is_retryable_error(
                "Connection timeout during authentication failed"
            ));
        }

        #[test]
        fn test_ssh_protocol_errors_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error"));
            assert!(is_retryable_error("SSH failed to connect"));
        }
    }

    mod chain_error {
        use super::*;

        #[test]
        fn test_kind_mapping() {
            assert_eq!(
                ChainError::UnknownHost("ghost".into()).kind(),
                ErrorKind::UnknownHost
            );
            assert_eq!(
                ChainError::InvalidConfig("bad".into()).kind(),
                ErrorKind::Config
            );
            assert_eq!(
                ChainError::command("t", "exit status 1", "").kind(),
                ErrorKind::Command
            );
        }

        #[test]
        fn test_timeout_is_retryable() {
            let err = ChainError::Timeout {
                host: "app".into(),
                pattern: "USERNAME :".into(),
                waited: Duration::from_secs(5),
                partial_output: String::new(),
            };
            assert!(err.is_retryable());
        }

        #[test]
        fn test_connection_retry_follows_message() {
            assert!(ChainError::connection("b", "Connection refused").is_retryable());
            assert!(!ChainError::connection("b", "Authentication failed").is_retryable());
        }

        #[test]
        fn test_command_and_config_errors_not_retryable() {
            assert!(!ChainError::command("t", "exit status 2", "out").is_retryable());
            assert!(!ChainError::UnknownHost("x".into()).is_retryable());
        }

        #[test]
        fn test_cyclic_chain_message_shows_path() {
            let err = ChainError::CyclicChain {
                host: "a".into(),
                path: vec!["a".into(), "b".into(), "a".into()],
            };
            assert_eq!(err.to_string(), "Cyclic bastion chain at 'a': a -> b -> a");
        }

        #[test]
        fn test_teardown_keeps_output() {
            let err = ChainError::Teardown {
                output: "hi".into(),
                errors: vec![ChainError::connection("bastion", "Broken pipe")],
            };
            assert_eq!(err.partial_output(), Some("hi"));
            assert!(err.to_string().contains("Broken pipe"));
        }

        #[test]
        fn test_error_kind_display() {
            assert_eq!(ErrorKind::Timeout.to_string(), "TimeoutError");
            assert_eq!(ErrorKind::CyclicChain.to_string(), "CyclicChainError");
        }
    }
}
