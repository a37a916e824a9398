//! Per-hop connection strategies.
//!
//! A [`ConnectionStrategy`] knows how to open one hop (optionally through the
//! channel of the hop before it), how to run a command over the opened
//! channel, and how to close it again:
//!
//! - [`DirectExec`]: transport session plus one-shot exec channels
//! - [`InteractiveShell`]: PTY shell driven by prompt detection
//! - [`ScriptedLogin`]: PTY shell driven through a multi-step text login
//!
//! # Error mapping
//!
//! Failures while opening surface as `Connection`, except expect deadlines
//! which stay `Timeout`. Failures while running surface as `Command` (with
//! whatever output arrived), again except deadlines.

mod direct;
mod interactive;
mod scripted;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::ChainError;
use super::expect::ExpectError;
use super::transport::{Endpoint, RemoteSession, ShellStream};
use super::types::{Credential, HostConfig, TransportKind};

pub use direct::DirectExec;
pub use interactive::InteractiveShell;
pub use scripted::ScriptedLogin;

/// How one hop is opened, used and closed.
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    /// Open the hop, tunneling through `parent` when there is one.
    ///
    /// On failure nothing stays open.
    async fn open(&self, parent: Option<&HopChannel>) -> Result<HopChannel, ChainError>;

    /// Release everything `open` acquired.
    async fn close(&self, channel: HopChannel) -> Result<(), ChainError>;

    /// Run `command` and return its output.
    async fn run(
        &self,
        channel: &mut HopChannel,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ChainError>;

    fn kind(&self) -> TransportKind;
}

/// An open hop.
pub enum HopChannel {
    /// An authenticated transport session on the hop.
    Session(Arc<dyn RemoteSession>),
    /// A logged-in PTY shell.
    Shell(ShellChannel),
}

/// PTY shell of a hop.
pub struct ShellChannel {
    pub stream: Box<dyn ShellStream>,
    /// The hop's own transport session. `None` when the shell was reached by
    /// typing a login command into a shell on the previous hop.
    pub session: Option<Arc<dyn RemoteSession>>,
}

impl HopChannel {
    /// The hop's own transport session, which later hops tunnel through.
    pub fn session(&self) -> Option<Arc<dyn RemoteSession>> {
        match self {
            HopChannel::Session(session) => Some(Arc::clone(session)),
            HopChannel::Shell(shell) => shell.session.clone(),
        }
    }

    pub(crate) fn shell_mut(&mut self, host_name: &str) -> Result<&mut ShellChannel, ChainError> {
        match self {
            HopChannel::Shell(shell) => Ok(shell),
            HopChannel::Session(_) => Err(ChainError::command(
                host_name,
                "channel is not an interactive shell",
                "",
            )),
        }
    }
}

impl fmt::Debug for HopChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopChannel::Session(_) => f.write_str("HopChannel::Session"),
            HopChannel::Shell(shell) => f
                .debug_struct("HopChannel::Shell")
                .field("own_session", &shell.session.is_some())
                .finish(),
        }
    }
}

/// The session a new hop must be opened through.
pub(crate) fn tunnel_session(
    parent: &HopChannel,
    host_name: &str,
) -> Result<Arc<dyn RemoteSession>, ChainError> {
    parent.session().ok_or_else(|| {
        ChainError::connection(
            host_name,
            "previous hop has no transport session to tunnel through",
        )
    })
}

/// Open a session to `host` tunneled through `parent`.
///
/// A `key_filename` names a file on the previous hop, so the key text is read
/// there over the parent session and offered from memory.
pub(crate) async fn connect_through(
    parent: &HopChannel,
    host: &HostConfig,
) -> Result<Arc<dyn RemoteSession>, ChainError> {
    let via = tunnel_session(parent, &host.host_name)?;
    let mut endpoint = Endpoint::from(host);
    if let Credential::KeyFile(path) = &host.credential {
        let key = read_remote_key(via.as_ref(), &host.host_name, path, host.timeout).await?;
        endpoint.credential = Credential::KeyData(key);
    }

    via.connect_through(&endpoint)
        .await
        .map_err(|e| ChainError::connection(&host.host_name, e))
}

async fn read_remote_key(
    via: &dyn RemoteSession,
    host_name: &str,
    path: &Path,
    timeout: Duration,
) -> Result<String, ChainError> {
    tracing::debug!("Reading private key {} for {} on previous hop", path.display(), host_name);
    let output = via
        .exec(&format!("cat {}", path.display()), timeout)
        .await
        .map_err(|e| ChainError::connection(host_name, e))?;

    let stderr = output.stderr.trim();
    let reason = if output.timed_out {
        Some(format!("timed out after {:?}", timeout))
    } else if !stderr.is_empty() {
        Some(stderr.to_string())
    } else if output.exit_status != Some(0) {
        Some(format!("exit status {:?}", output.exit_status))
    } else if output.stdout.trim().is_empty() {
        Some("file is empty".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ChainError::connection(
            host_name,
            format!(
                "failed to read private key {} from previous hop: {}",
                path.display(),
                reason
            ),
        )),
        None => Ok(output.stdout),
    }
}

/// Map an expect failure during `open`.
pub(crate) fn login_error(host_name: &str, error: ExpectError) -> ChainError {
    match error {
        ExpectError::Timeout {
            pattern,
            waited,
            partial,
        } => ChainError::Timeout {
            host: host_name.to_string(),
            pattern,
            waited,
            partial_output: partial,
        },
        other => ChainError::connection(host_name, other),
    }
}

/// Map an expect failure during `run`.
pub(crate) fn run_error(host_name: &str, error: ExpectError) -> ChainError {
    match error {
        ExpectError::Timeout {
            pattern,
            waited,
            partial,
        } => ChainError::Timeout {
            host: host_name.to_string(),
            pattern,
            waited,
            partial_output: partial,
        },
        other => {
            let partial = other.partial().to_string();
            ChainError::command(host_name, other, partial)
        }
    }
}

/// Close a half-opened shell and its session, logging what fails.
pub(crate) async fn abandon(
    host_name: &str,
    stream: Option<&mut Box<dyn ShellStream>>,
    session: Option<&Arc<dyn RemoteSession>>,
) {
    if let Some(stream) = stream
        && let Err(e) = stream.close().await
    {
        tracing::debug!("Closing abandoned shell on {} failed: {}", host_name, e);
    }
    if let Some(session) = session
        && let Err(e) = session.disconnect().await
    {
        tracing::debug!("Disconnecting abandoned session on {} failed: {}", host_name, e);
    }
}

/// Close a shell channel: optional logout line, stream, own session.
///
/// Every step runs; the first failure is reported.
pub(crate) async fn close_shell(
    host_name: &str,
    mut shell: ShellChannel,
    logout_command: &str,
) -> Result<(), ChainError> {
    let mut first_error = None;

    if !logout_command.is_empty()
        && let Err(e) = super::expect::send_line(shell.stream.as_mut(), logout_command).await
    {
        first_error.get_or_insert(ChainError::connection(host_name, e));
    }
    if let Err(e) = shell.stream.close().await {
        first_error.get_or_insert(ChainError::connection(host_name, e));
    }
    if let Some(session) = shell.session
        && let Err(e) = session.disconnect().await
    {
        first_error.get_or_insert(ChainError::connection(host_name, e));
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
