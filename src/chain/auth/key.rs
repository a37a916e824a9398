use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use super::AuthStrategy;
use crate::chain::transport::TransportError;
use crate::chain::transport::handler::ChainClientHandler;

enum KeySource {
    File(PathBuf),
    /// Key text read from the previous hop.
    Text(String),
}

/// Public key authentication with an unencrypted private key.
pub struct KeyAuth {
    source: KeySource,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            source: KeySource::File(key_path.into()),
        }
    }

    pub fn from_text(key_text: impl Into<String>) -> Self {
        Self {
            source: KeySource::Text(key_text.into()),
        }
    }

    fn load(&self) -> Result<keys::PrivateKey, TransportError> {
        match &self.source {
            KeySource::File(path) => keys::load_secret_key(path, None).map_err(|e| {
                TransportError::Auth(format!(
                    "Failed to load private key from {}: {}",
                    path.display(),
                    e
                ))
            }),
            KeySource::Text(text) => keys::decode_secret_key(text, None).map_err(|e| {
                TransportError::Auth(format!(
                    "Failed to decode private key read from previous hop: {}",
                    e
                ))
            }),
        }
    }

    fn origin(&self) -> String {
        match &self.source {
            KeySource::File(path) => path.display().to_string(),
            KeySource::Text(_) => "previous hop".to_string(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ChainClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError> {
        let key_pair = self.load()?;

        // RSA keys need the strongest hash the server supports
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!(key = %self.origin(), ?hash_alg, "Offering private key");

        let result = handle
            .authenticate_publickey(
                username,
                keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| TransportError::Auth(format!("Key authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
