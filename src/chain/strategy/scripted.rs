use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::{
    ConnectionStrategy, HopChannel, ShellChannel, abandon, close_shell, connect_through,
    login_error, run_error,
};
use crate::chain::error::ChainError;
use crate::chain::expect::{
    Anchor, ExpectStep, interpolate, last_response_line, read_until, send_line, strip_response,
};
use crate::chain::transport::{Endpoint, ShellStream, Transport};
use crate::chain::types::{HostConfig, LoginStep, TransportKind};

/// Application prompt shown once the login completes: `[<host_name>]`.
const APP_PROMPT_TEMPLATE: &str = r"\[{host}\]";

/// Login into an application shell nested inside a remote host.
///
/// The hop gets a transport session (tunneled through the parent when there
/// is one) and a PTY, then walks its login script. Without a configured
/// script the dialogue is: optional `login_command`, `USERNAME :`,
/// `PASSWORD :`, application prompt.
pub struct ScriptedLogin {
    host: HostConfig,
    transport: Arc<dyn Transport>,
    poll_interval: Duration,
    steps: Vec<LoginStep>,
    app_prompt: Regex,
}

impl ScriptedLogin {
    pub fn new(
        host: HostConfig,
        transport: Arc<dyn Transport>,
        poll_interval: Duration,
    ) -> Result<Self, ChainError> {
        let app_prompt = Regex::new(&format!(r"\[{}\]", regex::escape(&host.host_name)))
            .map_err(|e| ChainError::InvalidConfig(e.to_string()))?;
        let steps = if host.login_script.is_empty() {
            default_script(&host)
        } else {
            host.login_script.clone()
        };

        Ok(Self {
            host,
            transport,
            poll_interval,
            steps,
            app_prompt,
        })
    }

    /// Placeholder values available to every step.
    fn variables(&self) -> HashMap<String, String> {
        HashMap::from([
            ("host".to_string(), self.host.host_name.clone()),
            ("username".to_string(), self.host.username.clone()),
            (
                "password".to_string(),
                self.host.password().unwrap_or_default().to_string(),
            ),
        ])
    }

    async fn walk_script(&self, stream: &mut dyn ShellStream) -> Result<(), ChainError> {
        let host_name = &self.host.host_name;
        let mut vars = self.variables();

        for (index, step) in self.steps.iter().enumerate() {
            let sent = step.send.as_deref().map(|line| interpolate(line, &vars, false));
            let expect_source = interpolate(&step.expect, &vars, true);
            let expect = Regex::new(&expect_source).map_err(|e| {
                ChainError::InvalidConfig(format!(
                    "host '{}': login step {} pattern '{}': {}",
                    host_name, index, expect_source, e
                ))
            })?;

            if let Some(line) = sent.as_deref() {
                if step.secret {
                    debug!("Login step {} on {}: sending secret", index, host_name);
                } else {
                    debug!("Login step {} on {}: sending '{}'", index, host_name, line);
                }
                send_line(stream, line)
                    .await
                    .map_err(|e| ChainError::connection(host_name, e))?;
            }

            let echo = sent.as_deref().filter(|_| step.require_echo && !step.secret);
            let patterns = std::slice::from_ref(&expect);
            let mut wait = ExpectStep::new(patterns, self.host.timeout);
            if let Some(echo) = echo {
                wait = wait.after_echo(echo);
            }

            let matched = read_until(stream, wait, self.poll_interval)
                .await
                .map_err(|e| login_error(host_name, e))?;

            if let Some(name) = &step.capture {
                let body = strip_response(&matched.output, echo, &expect);
                let value = last_response_line(&body, &expect).ok_or_else(|| {
                    ChainError::connection(
                        host_name,
                        format!("login step {} captured nothing for '{}'", index, name),
                    )
                })?;
                debug!("Captured {} = '{}' on {}", name, value, host_name);
                vars.insert(name.clone(), value);
            }
        }

        Ok(())
    }
}

/// The script used when a host configures none.
pub(crate) fn default_script(host: &HostConfig) -> Vec<LoginStep> {
    let first = match &host.login_command {
        Some(command) => LoginStep::new(Some(command.as_str()), "USERNAME :").echoed(),
        None => LoginStep::new(None, "USERNAME :"),
    };
    vec![
        first,
        LoginStep::new(Some("{username}"), "PASSWORD :").echoed(),
        LoginStep::new(Some("{password}"), APP_PROMPT_TEMPLATE).secret(),
    ]
}

#[async_trait]
impl ConnectionStrategy for ScriptedLogin {
    async fn open(&self, parent: Option<&HopChannel>) -> Result<HopChannel, ChainError> {
        let host_name = &self.host.host_name;
        let session = match parent {
            Some(parent) => connect_through(parent, &self.host).await?,
            None => self
                .transport
                .connect(&Endpoint::from(&self.host))
                .await
                .map_err(|e| ChainError::connection(host_name, e))?,
        };

        let mut stream = match session.open_shell().await {
            Ok(stream) => stream,
            Err(e) => {
                abandon(host_name, None, Some(&session)).await;
                return Err(ChainError::connection(host_name, e));
            }
        };

        if let Err(e) = self.walk_script(stream.as_mut()).await {
            abandon(host_name, Some(&mut stream), Some(&session)).await;
            return Err(e);
        }

        info!("Application login complete on {}", host_name);
        Ok(HopChannel::Shell(ShellChannel {
            stream,
            session: Some(session),
        }))
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

        let step = ExpectStep::new(std::slice::from_ref(&self.app_prompt), timeout)
            .after_echo(echo)
            .anchored(Anchor::LastLine);
        let matched = read_until(shell.stream.as_mut(), step, self.poll_interval)
            .await
            .map_err(|e| run_error(host_name, e))?;

        Ok(strip_response(&matched.output, Some(echo), &self.app_prompt))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::ScriptedLogin
    }
}
