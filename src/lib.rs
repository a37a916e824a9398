//! Multi-hop SSH session chains.
//!
//! Establishes a chain of authenticated remote shells (bastion -> bastion ->
//! target), runs one command on the final hop, and tears the chain down in
//! reverse order. See [`chain`] for the building blocks.

pub mod chain;

pub use chain::{
    ChainBuilder, ChainError, ChainOrchestrator, ConfigStore, ErrorKind, HostConfig,
    TransportKind,
};
