//! Session nodes and the chain arena.
//!
//! A [`Chain`] owns its [`SessionNode`]s in a `Vec`; parent and child links
//! are indices into it ([`NodeId`]). A parent is always added before its
//! children, so a node's parent index is lower than its own and the parent
//! channel can be borrowed immutably while the child is opened.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::ChainError;
use super::strategy::{ConnectionStrategy, HopChannel};
use super::types::TransportKind;

/// Index of a node in its [`Chain`].
pub type NodeId = usize;

/// Lifecycle of one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for HopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HopState::Unopened => "unopened",
            HopState::Opening => "opening",
            HopState::Open => "open",
            HopState::Closing => "closing",
            HopState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One hop of a chain.
pub struct SessionNode {
    host_name: String,
    strategy: Box<dyn ConnectionStrategy>,
    channel: Option<HopChannel>,
    state: HopState,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl SessionNode {
    pub fn new(host_name: &str, strategy: Box<dyn ConnectionStrategy>) -> Self {
        Self {
            host_name: host_name.to_string(),
            strategy,
            channel: None,
            state: HopState::Unopened,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn state(&self) -> HopState {
        self.state
    }

    pub fn kind(&self) -> TransportKind {
        self.strategy.kind()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Whether the node holds an open channel.
    pub fn is_connected(&self) -> bool {
        self.state == HopState::Open && self.channel.is_some()
    }

    fn needs_teardown(&self) -> bool {
        matches!(self.state, HopState::Open | HopState::Opening)
    }

    fn not_connected(&self) -> ChainError {
        ChainError::NotConnected {
            host: self.host_name.clone(),
            state: self.state,
        }
    }

    /// The open channel, for a child to tunnel through.
    fn open_channel(&self) -> Result<&HopChannel, ChainError> {
        match (&self.channel, self.state) {
            (Some(channel), HopState::Open) => Ok(channel),
            _ => Err(self.not_connected()),
        }
    }

    /// Open the hop through `parent`.
    ///
    /// Only an unopened node can be established; an already open one is left
    /// as is. A failed open leaves the node `Closed` with nothing to release.
    pub async fn establish(&mut self, parent: Option<&HopChannel>) -> Result<(), ChainError> {
        match self.state {
            HopState::Unopened => {}
            HopState::Open => return Ok(()),
            _ => return Err(self.not_connected()),
        }

        self.state = HopState::Opening;
        info!(
            "Opening hop {} ({}){}",
            self.host_name,
            self.strategy.kind(),
            if parent.is_some() { " through parent" } else { "" }
        );

        match self.strategy.open(parent).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = HopState::Open;
                debug!("Hop {} is open", self.host_name);
                Ok(())
            }
            Err(e) => {
                self.state = HopState::Closed;
                warn!("Opening hop {} failed: {}", self.host_name, e);
                Err(e)
            }
        }
    }

    /// Close the hop. A no-op unless it is `Open` or `Opening`.
    pub async fn teardown(&mut self) -> Result<(), ChainError> {
        if !self.needs_teardown() {
            return Ok(());
        }

        self.state = HopState::Closing;
        let result = match self.channel.take() {
            Some(channel) => self.strategy.close(channel).await,
            None => Ok(()),
        };
        self.state = HopState::Closed;
        debug!("Hop {} is closed", self.host_name);
        result
    }

    /// Run `command` over the open channel.
    pub async fn send(&mut self, command: &str, timeout: Duration) -> Result<String, ChainError> {
        if self.state != HopState::Open {
            return Err(self.not_connected());
        }
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => return Err(self.not_connected()),
        };
        self.strategy.run(channel, command, timeout).await
    }
}

impl fmt::Debug for SessionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionNode")
            .field("host_name", &self.host_name)
            .field("kind", &self.strategy.kind())
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish()
    }
}

/// Arena of session nodes, first bastion at index 0.
///
/// Dropping a chain that still has open hops spawns a background teardown on
/// the current tokio runtime.
#[derive(Debug, Default)]
pub struct Chain {
    nodes: Vec<SessionNode>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `node` as a child of `parent`.
    pub fn add_node(
        &mut self,
        mut node: SessionNode,
        parent: Option<NodeId>,
    ) -> Result<NodeId, ChainError> {
        let id = self.nodes.len();
        if let Some(parent) = parent {
            let Some(parent_node) = self.nodes.get_mut(parent) else {
                return Err(ChainError::InvalidConfig(format!(
                    "parent node {} of '{}' does not exist",
                    parent, node.host_name
                )));
            };
            parent_node.children.push(id);
        }
        node.parent = parent;
        self.nodes.push(node);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&SessionNode> {
        self.nodes.get(id)
    }

    /// The first bastion (or the target when there are no bastions).
    pub fn first(&self) -> Option<NodeId> {
        if self.nodes.is_empty() { None } else { Some(0) }
    }

    /// The last node added.
    pub fn target(&self) -> Option<NodeId> {
        self.nodes.len().checked_sub(1)
    }

    pub fn host_names(&self) -> Vec<&str> {
        self.nodes.iter().map(SessionNode::host_name).collect()
    }

    pub fn states(&self) -> Vec<HopState> {
        self.nodes.iter().map(SessionNode::state).collect()
    }

    /// `id` and its ancestors, nearest first.
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = self.nodes.get(id).map(|_| id);
        while let Some(node_id) = current {
            path.push(node_id);
            current = self.nodes[node_id].parent;
        }
        path
    }

    /// Node before its children, children in declaration order.
    pub fn preorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes.get(root).map(|_| root).into_iter().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev());
        }
        order
    }

    /// Children (each fully) before the node.
    pub fn postorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes.get(root).map(|_| root).into_iter().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter());
        }
        order.reverse();
        order
    }

    /// Open `root` and everything below it, parents first.
    ///
    /// Stops at the first failure; nodes already open stay open for the
    /// caller to tear down.
    pub async fn establish_subtree(&mut self, root: NodeId) -> Result<(), ChainError> {
        for id in self.preorder(root) {
            let (before, rest) = self.nodes.split_at_mut(id);
            let node = &mut rest[0];
            let parent = match node.parent {
                Some(parent) => Some(before[parent].open_channel()?),
                None => None,
            };
            node.establish(parent).await?;
        }
        Ok(())
    }

    /// Close `root` and everything below it, children first.
    ///
    /// Every node is attempted; the failures are returned together.
    pub async fn teardown_subtree(&mut self, root: NodeId) -> Result<(), Vec<ChainError>> {
        let mut errors = Vec::new();
        for id in self.postorder(root) {
            if let Err(e) = self.nodes[id].teardown().await {
                warn!("Closing hop {} failed: {}", self.nodes[id].host_name, e);
                errors.push(e);
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Tear down every root in the arena.
    pub async fn teardown_all(&mut self) -> Result<(), Vec<ChainError>> {
        let roots: Vec<NodeId> = (0..self.nodes.len())
            .filter(|&id| self.nodes[id].parent.is_none())
            .collect();

        let mut errors = Vec::new();
        for root in roots {
            if let Err(mut failed) = self.teardown_subtree(root).await {
                errors.append(&mut failed);
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Run `command` on the target node.
    pub async fn send_to_target(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ChainError> {
        let target = self
            .target()
            .ok_or_else(|| ChainError::InvalidConfig("chain has no nodes".to_string()))?;
        self.nodes[target].send(command, timeout).await
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        let open = self.nodes.iter().filter(|n| n.needs_teardown()).count();
        if open == 0 {
            return;
        }

        let nodes = std::mem::take(&mut self.nodes);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Chain dropped with {} open hop(s), closing in background", open);
                handle.spawn(async move {
                    let mut chain = Chain { nodes };
                    if let Err(errors) = chain.teardown_all().await {
                        warn!("Background teardown finished with {} error(s)", errors.len());
                    }
                });
            }
            Err(_) => {
                warn!("Chain dropped outside a runtime; {} open hop(s) not closed", open);
            }
        }
    }
}
