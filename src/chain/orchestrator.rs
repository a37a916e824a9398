//! Runs one command at the end of a chain.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::builder::{ChainBuilder, StrategyFactory};
use super::error::ChainError;
use super::node::Chain;
use super::store::ConfigStore;
use super::transport::Transport;

/// Builds, establishes, uses and tears down one chain per call.
///
/// Calls are independent; one orchestrator can serve concurrent tasks, each
/// owning its own chain.
pub struct ChainOrchestrator {
    builder: ChainBuilder,
}

impl ChainOrchestrator {
    pub fn new(factory: Arc<dyn StrategyFactory>) -> Self {
        Self {
            builder: ChainBuilder::new(factory),
        }
    }

    pub fn with_transport(transport: Arc<dyn Transport>, poll_interval: Duration) -> Self {
        Self {
            builder: ChainBuilder::with_transport(transport, poll_interval),
        }
    }

    /// Run `command` on `target`, reached through its bastion chain.
    ///
    /// # Arguments
    ///
    /// * `store` - Host inventory
    /// * `target` - Host name of the final hop
    /// * `command` - Command line to run there
    /// * `timeout` - Deadline for the command's output
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - The command output
    /// * `Err(ChainError)` - The establishment error, else the command error,
    ///   else `Teardown` carrying the output when only closing failed
    pub async fn run_command(
        &self,
        store: &ConfigStore,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ChainError> {
        let span = info_span!("run_command", run_id = %Uuid::new_v4(), host = %target);
        async move {
            let mut chain = self.builder.build(store, target)?;
            info!("Running command over {} hop(s)", chain.len());
            Self::drive(&mut chain, command, timeout).await
        }
        .instrument(span)
        .await
    }

    async fn drive(
        chain: &mut Chain,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ChainError> {
        let Some(first) = chain.first() else {
            return Err(ChainError::InvalidConfig("chain has no nodes".to_string()));
        };

        if let Err(e) = chain.establish_subtree(first).await {
            if let Err(cleanup) = chain.teardown_all().await {
                for error in &cleanup {
                    warn!("Cleanup after failed establish: {}", error);
                }
            }
            return Err(e);
        }

        let result = chain.send_to_target(command, timeout).await;
        let teardown = chain.teardown_all().await;

        match (result, teardown) {
            (Ok(output), Ok(())) => {
                info!("Command finished ({} bytes)", output.len());
                Ok(output)
            }
            (Ok(output), Err(errors)) => Err(ChainError::Teardown { output, errors }),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(errors)) => {
                warn!(
                    "Teardown failed with {} error(s) after command error",
                    errors.len()
                );
                Err(e)
            }
        }
    }
}
