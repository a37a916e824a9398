//! Authentication for russh-backed hops.
//!
//! Each [`Credential`](super::types::Credential) maps onto an [`AuthChain`]
//! of one or more [`AuthStrategy`] implementations, tried in order until the
//! server accepts one:
//!
//! - [`PasswordAuth`]: `password` from the inventory
//! - [`KeyAuth`]: private key read from `key_filename`, or key text fetched
//!   from the previous hop
//! - [`AgentAuth`]: identities from the agent at `SSH_AUTH_SOCK`

mod agent;
mod chain;
mod key;
mod password;

use async_trait::async_trait;
use russh::client;

use super::transport::TransportError;
use super::transport::handler::ChainClientHandler;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;

/// One way of proving identity to an SSH server.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt authentication on an already handshaken connection.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The server accepted the credentials
    /// * `Ok(false)` - The server rejected them
    /// * `Err(_)` - The attempt itself failed (unreadable key, no agent, I/O)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ChainClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError>;

    /// Short name for log lines.
    fn name(&self) -> &'static str;
}
