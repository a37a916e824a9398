use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use super::{
    ConnectionStrategy, HopChannel, ShellChannel, abandon, close_shell, login_error, run_error,
    tunnel_session,
};
use crate::chain::error::ChainError;
use crate::chain::expect::{Anchor, ExpectStep, read_until, send_line, strip_response};
use crate::chain::transport::{Endpoint, RemoteSession, ShellStream, Transport};
use crate::chain::types::{Credential, HostConfig, TransportKind};

/// Host key confirmation asked by an `ssh` client on first contact.
const HOST_KEY_PROMPT: &str = r"(?i)are you sure you want to continue connecting";

/// Lines an `ssh` client prints when the login cannot succeed.
static LOGIN_FAILURES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)permission denied",
        r"(?i)connection refused",
        r"(?i)connection timed out",
        r"(?i)no route to host",
        r"(?i)could not resolve hostname",
        r"(?i)host key verification failed",
        r"(?i)connection closed by",
        r"(?i)connection reset",
        r"(?i)kex_exchange_identification",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid login failure regex"))
    .collect()
});

/// What the login dialogue is waiting on.
const PROMPT: usize = 0;
const PASSWORD: usize = 1;
const HOST_KEY: usize = 2;

/// PTY shell hop for hosts that only allow interactive logins.
///
/// Without a parent the hop gets its own transport session and shell. With a
/// parent, a fresh shell is opened on the parent's session and an `ssh` line
/// is typed into it; the dialogue answers host-key and password prompts until
/// the hop's command prompt shows up.
pub struct InteractiveShell {
    host: HostConfig,
    transport: Arc<dyn Transport>,
    poll_interval: Duration,
    /// `[command_prompt, password_prompt, host key prompt]`
    login_patterns: [Regex; 3],
}

impl InteractiveShell {
    pub fn new(
        host: HostConfig,
        transport: Arc<dyn Transport>,
        poll_interval: Duration,
    ) -> Result<Self, ChainError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                ChainError::InvalidConfig(format!(
                    "host '{}': invalid pattern '{}': {}",
                    host.host_name, pattern, e
                ))
            })
        };
        let login_patterns = [
            compile(&host.command_prompt)?,
            compile(&host.password_prompt)?,
            compile(HOST_KEY_PROMPT)?,
        ];

        Ok(Self {
            host,
            transport,
            poll_interval,
            login_patterns,
        })
    }

    fn prompt(&self) -> &Regex {
        &self.login_patterns[PROMPT]
    }

    /// The line typed on the previous hop.
    fn connect_line(&self) -> String {
        let mut line = format!("ssh -p {}", self.host.port);
        if let Credential::KeyFile(path) = &self.host.credential {
            line.push_str(&format!(" -i {}", path.display()));
        }
        line.push_str(&format!(" {}@{}", self.host.username, self.host.address));
        line
    }

    async fn open_fresh(&self) -> Result<HopChannel, ChainError> {
        let host_name = &self.host.host_name;
        let session = self
            .transport
            .connect(&Endpoint::from(&self.host))
            .await
            .map_err(|e| ChainError::connection(host_name, e))?;

        let mut stream = match session.open_shell().await {
            Ok(stream) => stream,
            Err(e) => {
                abandon(host_name, None, Some(&session)).await;
                return Err(ChainError::connection(host_name, e));
            }
        };

        let step = ExpectStep::new(std::slice::from_ref(self.prompt()), self.host.timeout)
            .anchored(Anchor::LastLine);
        if let Err(e) = read_until(stream.as_mut(), step, self.poll_interval).await {
            abandon(host_name, Some(&mut stream), Some(&session)).await;
            return Err(login_error(host_name, e));
        }

        info!("Shell ready on {}", host_name);
        Ok(HopChannel::Shell(ShellChannel {
            stream,
            session: Some(session),
        }))
    }

    async fn open_through(&self, via: Arc<dyn RemoteSession>) -> Result<HopChannel, ChainError> {
        let host_name = &self.host.host_name;
        let mut stream = via
            .open_shell()
            .await
            .map_err(|e| ChainError::connection(host_name, e))?;

        if let Err(e) = self.login(stream.as_mut()).await {
            abandon(host_name, Some(&mut stream), None).await;
            return Err(e);
        }

        info!("Logged in to {} through previous hop", host_name);
        Ok(HopChannel::Shell(ShellChannel {
            stream,
            session: None,
        }))
    }

    /// Drive the `ssh` dialogue until the command prompt appears.
    async fn login(&self, stream: &mut dyn ShellStream) -> Result<(), ChainError> {
        let host_name = &self.host.host_name;
        let connect_line = self.connect_line();
        debug!("Logging in to {}: {}", host_name, connect_line);
        send_line(stream, &connect_line)
            .await
            .map_err(|e| ChainError::connection(host_name, e))?;

        let mut echo = Some(connect_line);
        let mut password_sent = false;

        loop {
            let mut step = ExpectStep::new(&self.login_patterns, self.host.timeout)
                .anchored(Anchor::LastLine)
                .failing_on(&LOGIN_FAILURES);
            if let Some(echo) = echo.as_deref() {
                step = step.after_echo(echo);
            }

            let matched = read_until(stream, step, self.poll_interval)
                .await
                .map_err(|e| login_error(host_name, e))?;

            match matched.index {
                PASSWORD => {
                    let password = self.host.password().ok_or_else(|| {
                        ChainError::connection(host_name, "password requested but none configured")
                    })?;
                    if password_sent {
                        return Err(ChainError::connection(host_name, "password rejected"));
                    }
                    debug!("Sending password for {}", host_name);
                    send_line(stream, password)
                        .await
                        .map_err(|e| ChainError::connection(host_name, e))?;
                    password_sent = true;
                    echo = None;
                }
                HOST_KEY => {
                    debug!("Accepting host key of {}", host_name);
                    send_line(stream, "yes")
                        .await
                        .map_err(|e| ChainError::connection(host_name, e))?;
                    echo = Some("yes".to_string());
                }
                _ => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl ConnectionStrategy for InteractiveShell {
    async fn open(&self, parent: Option<&HopChannel>) -> Result<HopChannel, ChainError> {
        match parent {
            Some(parent) => {
                let via = tunnel_session(parent, &self.host.host_name)?;
                self.open_through(via).await
            }
            None => self.open_fresh().await,
        }
    }

    async fn close(&self, channel: HopChannel) -> Result<(), ChainError> {
        match channel {
            HopChannel::Shell(shell) => {
                close_shell(&self.host.host_name, shell, &self.host.logout_command).await
            }
            HopChannel::Session(session) => session
                .disconnect()
                .await
                .map_err(|e| ChainError::connection(&self.host.host_name, e)),
        }
    }

    async fn run(
        &self,
        channel: &mut HopChannel,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ChainError> {
        let host_name = &self.host.host_name;
        let shell = channel.shell_mut(host_name)?;
        let echo = command.lines().next().unwrap_or_default();

        send_line(shell.stream.as_mut(), command)
            .await
            .map_err(|e| ChainError::command(host_name, e, ""))?;

        let step = ExpectStep::new(std::slice::from_ref(self.prompt()), timeout)
            .after_echo(echo)
            .anchored(Anchor::LastLine);
        let matched = read_until(shell.stream.as_mut(), step, self.poll_interval)
            .await
            .map_err(|e| run_error(host_name, e))?;

        Ok(strip_response(&matched.output, Some(echo), self.prompt()))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::InteractiveShell
    }
}
