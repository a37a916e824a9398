//! Session chain module providing multi-hop connection orchestration.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Host configuration types parsed from the JSON inventory
//! - `store`: Read-only host inventory with bastion chain resolution
//! - `config`: Runtime knobs with environment variable support
//! - `error`: Error taxonomy and retry classification
//! - `transport`: Transport capability traits and the russh implementation
//! - `auth`: Authentication strategies used by the russh transport
//! - `expect`: Shared read-until-prompt primitive for text dialogues
//! - `strategy`: Per-hop connection strategies (exec, shell, scripted login)
//! - `node`: Session nodes, hop states and the chain arena
//! - `builder`: Chain construction from the inventory
//! - `orchestrator`: The `run_command` entry point

pub(crate) mod auth;
pub mod builder;
pub mod config;
pub mod error;
pub mod expect;
pub mod node;
pub mod orchestrator;
pub mod store;
pub mod strategy;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod types;

pub use builder::{ChainBuilder, StrategyFactory, TransportStrategyFactory};
pub use error::{ChainError, ErrorKind};
pub use node::{Chain, HopState, NodeId, SessionNode};
pub use orchestrator::ChainOrchestrator;
pub use store::ConfigStore;
pub use strategy::{ConnectionStrategy, HopChannel, ShellChannel};
pub use types::{Credential, HostConfig, LoginStep, Role, Secret, TransportKind};
