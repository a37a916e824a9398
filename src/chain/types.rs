//! Host configuration types.
//!
//! The inventory is a JSON object keyed by host name. Each entry is parsed
//! into a raw [`HostEntry`] (mirroring the file format, with lenient types)
//! and then normalized into a [`HostConfig`], which is what the rest of the
//! crate works with.
//!
//! ```json
//! {
//!   "bastion-1": {
//!     "ip_address": "10.0.0.1",
//!     "port": "22",
//!     "username": "ops",
//!     "password": "secret",
//!     "connect_type": "invoke_shell",
//!     "command_prompt": "\\$ $"
//!   },
//!   "app-db": {
//!     "ip_address": "10.0.1.5",
//!     "username": "svc",
//!     "key_filename": "~/.ssh/id_ed25519",
//!     "bastions": ["bastion-1"]
//!   }
//! }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ChainError;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Default shell prompt: `#`, `$` or `>` at the end of the line
pub const DEFAULT_COMMAND_PROMPT: &str = r"[#$>]\s*$";

/// Default password prompt for the interactive login dialogue
pub const DEFAULT_PASSWORD_PROMPT: &str = r"(?i)password:";

/// Default command sent before closing a shell-backed hop
pub const DEFAULT_LOGOUT_COMMAND: &str = "exit";

/// How a hop's channel is opened and how commands run over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One-shot command channels on a transport session.
    #[default]
    #[serde(alias = "ssh", alias = "exec")]
    DirectExec,
    /// PTY-backed shell driven by prompt detection.
    #[serde(alias = "shell", alias = "invoke_shell", alias = "interactive")]
    InteractiveShell,
    /// Multi-step text login into an application shell.
    #[serde(alias = "pod", alias = "scripted")]
    ScriptedLogin,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::DirectExec => "direct_exec",
            TransportKind::InteractiveShell => "interactive_shell",
            TransportKind::ScriptedLogin => "scripted_login",
        };
        f.write_str(name)
    }
}

/// Position of a host in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Bastion,
    Target,
}

/// How a hop authenticates.
///
/// `Debug` never prints the password or key text.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
    /// Private key text, read from the previous hop of a tunneled connection.
    KeyData(String),
    /// Identities offered by the local SSH agent.
    Agent,
}

impl Credential {
    /// The password, if this credential carries one.
    pub fn password(&self) -> Option<&str> {
        match self {
            Credential::Password(password) => Some(password),
            _ => None,
        }
    }

    /// The private key path, if this credential carries one.
    pub fn key_file(&self) -> Option<&PathBuf> {
        match self {
            Credential::KeyFile(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Credential::KeyData(_) => f.write_str("KeyData(***)"),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

/// Password kept beside a key credential for in-band login prompts.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// One `(send, expect)` step of a scripted login.
///
/// `send` and `expect` may contain `{host}`, `{username}`, `{password}` and
/// `{<capture>}` placeholders filled in right before the step runs. Values
/// substituted into `expect` are regex-escaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginStep {
    /// Line to send. `None` only waits.
    #[serde(default)]
    pub send: Option<String>,
    /// Regex that completes the step.
    pub expect: String,
    /// Only match text received after the sent line has been echoed back.
    #[serde(default)]
    pub require_echo: bool,
    /// Store the last non-prompt response line under this name.
    #[serde(default)]
    pub capture: Option<String>,
    /// The sent line is a secret; never log or echo-match it.
    #[serde(default)]
    pub secret: bool,
}

impl LoginStep {
    pub fn new(send: Option<&str>, expect: &str) -> Self {
        Self {
            send: send.map(str::to_string),
            expect: expect.to_string(),
            require_echo: false,
            capture: None,
            secret: false,
        }
    }

    pub fn echoed(mut self) -> Self {
        self.require_echo = true;
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn capture(mut self, name: &str) -> Self {
        self.capture = Some(name.to_string());
        self
    }
}

/// Normalized connection parameters of one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    pub host_name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    /// Inventory password when `credential` is a key. Answers password
    /// prompts of typed logins and application logins.
    pub login_password: Option<Secret>,
    /// Configured role. Informational; the chain position decides.
    pub role: Option<Role>,
    pub transport_kind: TransportKind,
    pub command_prompt: String,
    pub password_prompt: String,
    pub logout_command: String,
    /// Bastions to traverse, outermost first.
    pub bastion_chain: Vec<String>,
    /// Deadline for each expect-step and transport operation of this hop.
    pub timeout: Duration,
    /// First line sent by a scripted login (e.g. the exec into a container).
    pub login_command: Option<String>,
    /// Custom scripted login. Empty means the default dialogue.
    pub login_script: Vec<LoginStep>,
}

impl HostConfig {
    /// A host with defaults for everything but the essentials.
    pub fn new(host_name: &str, address: &str, username: &str, credential: Credential) -> Self {
        Self {
            host_name: host_name.to_string(),
            address: address.to_string(),
            port: DEFAULT_PORT,
            username: username.to_string(),
            credential,
            login_password: None,
            role: None,
            transport_kind: TransportKind::default(),
            command_prompt: DEFAULT_COMMAND_PROMPT.to_string(),
            password_prompt: DEFAULT_PASSWORD_PROMPT.to_string(),
            logout_command: DEFAULT_LOGOUT_COMMAND.to_string(),
            bastion_chain: Vec::new(),
            timeout: Duration::from_secs(super::config::DEFAULT_CONNECT_TIMEOUT_SECS),
            login_command: None,
            login_script: Vec::new(),
        }
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport_kind = kind;
        self
    }

    pub fn with_bastions(mut self, bastions: &[&str]) -> Self {
        self.bastion_chain = bastions.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.command_prompt = prompt.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Password for in-band prompts: the password credential, else the one
    /// kept beside a key.
    pub fn password(&self) -> Option<&str> {
        self.credential
            .password()
            .or_else(|| self.login_password.as_ref().map(Secret::expose))
    }

    /// `address:port`, for log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Port as written in inventories: a number or a numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

/// Raw inventory entry, field names as they appear in the JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    #[serde(default)]
    pub host_name: Option<String>,
    pub ip_address: String,
    #[serde(default)]
    pub port: Option<PortValue>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_filename: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub connect_type: Option<TransportKind>,
    #[serde(default)]
    pub command_prompt: Option<String>,
    #[serde(default)]
    pub password_prompt: Option<String>,
    #[serde(default)]
    pub logout_command: Option<String>,
    #[serde(default)]
    pub bastions: Vec<String>,
    /// Seconds; fractions allowed.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub login_command: Option<String>,
    #[serde(default)]
    pub login_script: Vec<LoginStep>,
}

impl HostEntry {
    /// Normalize into a [`HostConfig`] stored under `key`.
    ///
    /// # Arguments
    ///
    /// * `key` - The inventory key; an explicit `host_name` must agree with it
    /// * `default_timeout` - Used when the entry has no `timeout`
    ///
    /// # Credential selection
    ///
    /// A non-empty `key_filename` wins, then a non-empty password, then the
    /// SSH agent. Empty strings count as absent. A password given together
    /// with a key is kept as `login_password`.
    pub fn into_host_config(
        self,
        key: &str,
        default_timeout: Duration,
    ) -> Result<HostConfig, ChainError> {
        if let Some(name) = &self.host_name
            && name != key
        {
            return Err(ChainError::InvalidConfig(format!(
                "entry '{}' declares host_name '{}'",
                key, name
            )));
        }

        let port = match self.port {
            None => DEFAULT_PORT,
            Some(PortValue::Number(port)) => port,
            Some(PortValue::Text(text)) => text.trim().parse::<u16>().map_err(|_| {
                ChainError::InvalidConfig(format!("host '{}': invalid port '{}'", key, text))
            })?,
        };

        let timeout = match self.timeout {
            None => default_timeout,
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::try_from_secs_f64(secs)
                .map_err(|e| {
                    ChainError::InvalidConfig(format!(
                        "host '{}': timeout {} out of range: {}",
                        key, secs, e
                    ))
                })?,
            Some(secs) => {
                return Err(ChainError::InvalidConfig(format!(
                    "host '{}': timeout must be positive, got {}",
                    key, secs
                )));
            }
        };

        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());
        let (credential, login_password) =
            match (non_empty(self.key_filename), non_empty(self.password)) {
                (Some(key_file), password) => (
                    Credential::KeyFile(expand_home(&key_file)),
                    password.map(Secret::new),
                ),
                (None, Some(password)) => (Credential::Password(password), None),
                (None, None) => (Credential::Agent, None),
            };

        Ok(HostConfig {
            host_name: key.to_string(),
            address: self.ip_address,
            port,
            username: self.username,
            credential,
            login_password,
            role: self.role,
            transport_kind: self.connect_type.unwrap_or_default(),
            command_prompt: non_empty(self.command_prompt)
                .unwrap_or_else(|| DEFAULT_COMMAND_PROMPT.to_string()),
            password_prompt: non_empty(self.password_prompt)
                .unwrap_or_else(|| DEFAULT_PASSWORD_PROMPT.to_string()),
            logout_command: self
                .logout_command
                .unwrap_or_else(|| DEFAULT_LOGOUT_COMMAND.to_string()),
            bastion_chain: self.bastions,
            timeout,
            login_command: non_empty(self.login_command),
            login_script: self.login_script,
        })
    }
}

/// Expand a leading `~/` using `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}
