use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use super::AuthStrategy;
use crate::chain::transport::TransportError;
use crate::chain::transport::handler::ChainClientHandler;

/// Authentication through the local SSH agent (`SSH_AUTH_SOCK`).
///
/// Every identity the agent holds is offered in turn.
#[derive(Default)]
pub struct AgentAuth;

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ChainClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| TransportError::Auth(format!("Failed to connect to SSH agent: {}", e)))?;

        let identities = agent.request_identities().await.map_err(|e| {
            TransportError::Auth(format!("Failed to list SSH agent identities: {}", e))
        })?;

        if identities.is_empty() {
            return Err(TransportError::Auth(
                "No identities found in SSH agent".to_string(),
            ));
        }

        for identity in identities {
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => debug!(comment = ?identity.comment(), "Agent identity rejected"),
                Err(e) => debug!(comment = ?identity.comment(), "Agent identity failed: {}", e),
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_auth_usable_as_strategy() {
        fn requires_auth_strategy(_: &dyn AuthStrategy) {}
        let auth = AgentAuth;
        requires_auth_strategy(&auth);
        assert_eq!(auth.name(), "agent");
    }
}
