//! Transport capability consumed by the connection strategies.
//!
//! The chain never speaks the SSH protocol itself. It relies on three small
//! traits:
//!
//! - [`Transport`]: opens a fresh, authenticated session to an endpoint
//! - [`RemoteSession`]: an authenticated session that can run one-shot
//!   commands, open PTY shells, and tunnel a new session to another endpoint
//! - [`ShellStream`]: a bidirectional PTY byte stream with a non-blocking
//!   receive, driven by the [`expect`](super::expect) primitive
//!
//! [`ssh`] implements them over `russh`.

pub mod handler;
pub mod ssh;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{Credential, HostConfig};

pub use ssh::RusshTransport;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub host_name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    /// Connect and authentication deadline.
    pub timeout: Duration,
}

impl From<&HostConfig> for Endpoint {
    fn from(host: &HostConfig) -> Self {
        Self {
            host_name: host.host_name.clone(),
            address: host.address.clone(),
            port: host.port,
            username: host.username.clone(),
            credential: host.credential.clone(),
            timeout: host.timeout,
        }
    }
}

/// Result of a one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server never sent one (or on timeout).
    pub exit_status: Option<u32>,
    /// The deadline elapsed; stdout/stderr hold what arrived before it.
    pub timed_out: bool,
}

/// Failures reported by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{0}")]
    Connect(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Channel(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel closed by remote")]
    Closed,
}

/// Opens fresh sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `endpoint` over a new network connection and authenticate.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteSession>, TransportError>;
}

/// An authenticated remote session.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Open a new authenticated session to `endpoint`, tunneled through this
    /// one.
    async fn connect_through(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn RemoteSession>, TransportError>;

    /// Run `command` non-interactively. A timeout is reported through
    /// [`ExecOutput::timed_out`], not as an error.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;

    /// Open a PTY-backed login shell.
    async fn open_shell(&self) -> Result<Box<dyn ShellStream>, TransportError>;

    /// Close the session. Sessions tunneled through this one stop working.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// PTY byte stream.
///
/// `Sync` so a hop channel can be lent to the strategy opening the next hop.
#[async_trait]
pub trait ShellStream: Send + Sync {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Next chunk of output if one is ready. `Ok(None)` means nothing yet;
    /// `Err(TransportError::Closed)` means nothing will ever arrive.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_host_config() {
        let host = HostConfig::new("db", "10.0.1.5", "svc", Credential::Agent)
            .with_timeout(Duration::from_secs(4));
        let endpoint = Endpoint::from(&host);
        assert_eq!(endpoint.host_name, "db");
        assert_eq!(endpoint.address, "10.0.1.5");
        assert_eq!(endpoint.port, 22);
        assert_eq!(endpoint.timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(2)).to_string(),
            "timed out after 2s"
        );
        assert_eq!(
            TransportError::Connect("Connection refused".into()).to_string(),
            "Connection refused"
        );
    }
}
