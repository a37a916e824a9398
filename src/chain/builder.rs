//! Chain construction from the host inventory.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::error::ChainError;
use super::node::{Chain, SessionNode};
use super::store::ConfigStore;
use super::strategy::{ConnectionStrategy, DirectExec, InteractiveShell, ScriptedLogin};
use super::transport::{RusshTransport, Transport};
use super::types::{HostConfig, Role, TransportKind};

/// Creates the strategy driving one hop.
pub trait StrategyFactory: Send + Sync {
    fn create(&self, host: &HostConfig) -> Result<Box<dyn ConnectionStrategy>, ChainError>;
}

/// Picks the strategy named by each host's `transport_kind`, all sharing one
/// transport.
pub struct TransportStrategyFactory {
    transport: Arc<dyn Transport>,
    poll_interval: Duration,
}

impl TransportStrategyFactory {
    pub fn new(transport: Arc<dyn Transport>, poll_interval: Duration) -> Self {
        Self {
            transport,
            poll_interval,
        }
    }

    /// Strategies over real SSH connections.
    pub fn russh(poll_interval: Duration) -> Self {
        Self::new(Arc::new(RusshTransport::new()), poll_interval)
    }
}

impl StrategyFactory for TransportStrategyFactory {
    fn create(&self, host: &HostConfig) -> Result<Box<dyn ConnectionStrategy>, ChainError> {
        let transport = Arc::clone(&self.transport);
        let strategy: Box<dyn ConnectionStrategy> = match host.transport_kind {
            TransportKind::DirectExec => Box::new(DirectExec::new(host.clone(), transport)),
            TransportKind::InteractiveShell => Box::new(InteractiveShell::new(
                host.clone(),
                transport,
                self.poll_interval,
            )?),
            TransportKind::ScriptedLogin => Box::new(ScriptedLogin::new(
                host.clone(),
                transport,
                self.poll_interval,
            )?),
        };
        Ok(strategy)
    }
}

/// Turns a target host name into an unopened [`Chain`].
pub struct ChainBuilder {
    factory: Arc<dyn StrategyFactory>,
}

impl ChainBuilder {
    pub fn new(factory: Arc<dyn StrategyFactory>) -> Self {
        Self { factory }
    }

    pub fn with_transport(transport: Arc<dyn Transport>, poll_interval: Duration) -> Self {
        Self::new(Arc::new(TransportStrategyFactory::new(transport, poll_interval)))
    }

    /// Build the chain reaching `target`: bastions first, target last, each
    /// node the only child of the one before.
    ///
    /// Inventory errors are returned as they are and nothing is constructed.
    pub fn build(&self, store: &ConfigStore, target: &str) -> Result<Chain, ChainError> {
        let hosts = store.resolve_chain(target)?;
        let last = hosts.len().saturating_sub(1);

        let mut chain = Chain::new();
        let mut parent = None;
        for (position, host) in hosts.into_iter().enumerate() {
            let expected = if position == last {
                Role::Target
            } else {
                Role::Bastion
            };
            if let Some(role) = host.role
                && role != expected
            {
                debug!(
                    "Host {} is configured as {:?} but used as {:?}",
                    host.host_name, role, expected
                );
            }

            let strategy = self.factory.create(host)?;
            let id = chain.add_node(SessionNode::new(&host.host_name, strategy), parent)?;
            parent = Some(id);
        }

        debug!("Chain for {}: {}", target, chain.host_names().join(" -> "));
        Ok(chain)
    }
}
