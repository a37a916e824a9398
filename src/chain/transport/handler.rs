//! russh client handler shared by direct and tunneled connections.

use russh::{client, keys};
use tracing::debug;

/// Client handler that accepts every server host key, like
/// `StrictHostKeyChecking=no`. Hops behind bastions are typically reached by
/// private addresses that rotate keys with their instances.
pub struct ChainClientHandler {
    host_name: String,
}

impl ChainClientHandler {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }
}

impl client::Handler for ChainClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            host = %self.host_name,
            algorithm = %server_public_key.algorithm(),
            "Accepting server host key"
        );
        Ok(true)
    }
}
