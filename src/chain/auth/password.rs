use std::fmt;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use super::AuthStrategy;
use crate::chain::transport::TransportError;
use crate::chain::transport::handler::ChainClientHandler;

/// Password from the host inventory. Never logged.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordAuth(***)")
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ChainClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError> {
        debug!(user = %username, "Offering password");
        let outcome = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| TransportError::Auth(format!("Password exchange with server failed: {}", e)))?;

        Ok(outcome.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
