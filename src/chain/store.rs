//! Read-only host inventory.
//!
//! A [`ConfigStore`] is populated once (from a JSON document or from
//! already-built [`HostConfig`]s) and never mutated afterwards, so a single
//! instance can be shared behind an `Arc` by any number of concurrent
//! invocations without locking.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use super::config::resolve_connect_timeout;
use super::error::ChainError;
use super::types::{HostConfig, HostEntry};

/// Immutable mapping of host name to [`HostConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    hosts: HashMap<String, HostConfig>,
}

impl ConfigStore {
    /// Build a store from host configurations.
    ///
    /// Fails with `InvalidConfig` on duplicate names or invalid prompt
    /// patterns.
    pub fn from_hosts(hosts: impl IntoIterator<Item = HostConfig>) -> Result<Self, ChainError> {
        let mut map = HashMap::new();
        for host in hosts {
            validate_patterns(&host)?;
            if map.contains_key(&host.host_name) {
                return Err(ChainError::InvalidConfig(format!(
                    "duplicate host '{}'",
                    host.host_name
                )));
            }
            map.insert(host.host_name.clone(), host);
        }
        Ok(Self { hosts: map })
    }

    /// Parse an inventory document.
    ///
    /// # Arguments
    ///
    /// * `json` - Object keyed by host name (see [`super::types`])
    /// * `default_timeout` - Per-hop timeout for entries without `timeout`
    pub fn from_json_str(json: &str, default_timeout: Duration) -> Result<Self, ChainError> {
        // BTreeMap keeps error reporting deterministic.
        let entries: BTreeMap<String, HostEntry> = serde_json::from_str(json)?;
        let hosts = entries
            .into_iter()
            .map(|(key, entry)| entry.into_host_config(&key, default_timeout))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_hosts(hosts)
    }

    /// Read and parse an inventory file. Entries without `timeout` use
    /// [`resolve_connect_timeout`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let store = Self::from_json_str(&json, resolve_connect_timeout(None))?;
        debug!("Loaded {} host(s) from {}", store.len(), path.display());
        Ok(store)
    }

    /// Look up one host.
    pub fn resolve(&self, host_name: &str) -> Result<&HostConfig, ChainError> {
        self.hosts
            .get(host_name)
            .ok_or_else(|| ChainError::UnknownHost(host_name.to_string()))
    }

    /// Expand the bastion chain of `host_name` into hop order.
    ///
    /// Each bastion's own chain is expanded before the bastion itself and the
    /// named host comes last. A host that appears twice on the resulting path
    /// is a `CyclicChain` error, checked before the host is looked up.
    pub fn resolve_chain(&self, host_name: &str) -> Result<Vec<&HostConfig>, ChainError> {
        let mut path = Vec::new();
        let mut ordered = Vec::new();
        self.expand(host_name, &mut path, &mut ordered)?;
        Ok(ordered)
    }

    fn expand<'a>(
        &'a self,
        host_name: &str,
        path: &mut Vec<String>,
        ordered: &mut Vec<&'a HostConfig>,
    ) -> Result<(), ChainError> {
        let revisited = path.iter().any(|h| h == host_name)
            || ordered.iter().any(|h| h.host_name == host_name);
        if revisited {
            let mut cycle = path.clone();
            cycle.push(host_name.to_string());
            return Err(ChainError::CyclicChain {
                host: host_name.to_string(),
                path: cycle,
            });
        }

        let host = self.resolve(host_name)?;
        path.push(host_name.to_string());
        for bastion in &host.bastion_chain {
            self.expand(bastion, path, ordered)?;
        }
        path.pop();
        ordered.push(host);
        Ok(())
    }

    /// All host names, sorted.
    pub fn host_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hosts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Prompts are compiled on every use; reject bad ones at load time.
/// Login-script patterns contain placeholders and are only checked once
/// interpolated.
fn validate_patterns(host: &HostConfig) -> Result<(), ChainError> {
    for (field, pattern) in [
        ("command_prompt", &host.command_prompt),
        ("password_prompt", &host.password_prompt),
    ] {
        Regex::new(pattern).map_err(|e| {
            ChainError::InvalidConfig(format!(
                "host '{}': invalid {} '{}': {}",
                host.host_name, field, pattern, e
            ))
        })?;
    }
    Ok(())
}
