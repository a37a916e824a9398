use async_trait::async_trait;
use russh::client;
use tracing::{debug, info};

use super::{AgentAuth, AuthStrategy, KeyAuth, PasswordAuth};
use crate::chain::transport::TransportError;
use crate::chain::transport::handler::ChainClientHandler;
use crate::chain::types::Credential;

/// Ordered list of strategies; the first accepted one wins.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// The chain used for a configured credential.
    ///
    /// A key file falls back to the agent, so a key that is present in the
    /// agent but unreadable on disk still works.
    pub fn for_credential(credential: &Credential) -> Self {
        match credential {
            Credential::Password(password) => Self::new().with_password(password.as_str()),
            Credential::KeyFile(path) => Self::new().with_key(path.clone()).with_agent(),
            Credential::KeyData(text) => Self::new().with_key_text(text.as_str()).with_agent(),
            Credential::Agent => Self::new().with_agent(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, key_path: impl Into<std::path::PathBuf>) -> Self {
        self.strategies.push(Box::new(KeyAuth::new(key_path)));
        self
    }

    pub fn with_key_text(mut self, key_text: impl Into<String>) -> Self {
        self.strategies.push(Box::new(KeyAuth::from_text(key_text)));
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.strategies.push(Box::new(AgentAuth));
        self
    }

    #[cfg(test)]
    fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ChainClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError> {
        if self.strategies.is_empty() {
            return Err(TransportError::Auth(
                "No authentication strategies configured".to_string(),
            ));
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!(user = %username, "Trying {} authentication", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    info!(user = %username, "Authenticated with {}", strategy.name());
                    return Ok(true);
                }
                Ok(false) => {
                    last_error = Some(TransportError::Auth(format!(
                        "{} authentication rejected",
                        strategy.name()
                    )));
                }
                Err(e) => {
                    debug!("{} authentication error: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::Auth("All authentication methods failed".to_string())
        }))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
