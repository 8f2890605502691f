//! DSL module: builder API for topologies with named blocks.
//!
//! Endpoints are written `"<block>:<port>"`; `"self:<port>"` names a
//! boundary port of the topology being built.

use crate::block::Block;
use crate::config::KernelConfig;
use crate::registry::BlockRegistry;
use crate::topology::{BlockId, Endpoint, Topology, TopologyError};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Handle to a node in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(pub BlockId);

/// DSL-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DslError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("no block named {0:?}")]
    MissingNode(String),
    #[error("block name {0:?} already used")]
    DuplicateName(String),
    #[error("endpoint {0:?} is not of the form <block>:<port>")]
    BadEndpoint(String),
}

/// The topology builder.
#[derive(Debug)]
pub struct TopologyBuilder {
    topology: Topology,
    names: HashMap<String, BlockId>,
}

impl TopologyBuilder {
    /// Builder over a default topology.
    pub fn new(name: &str) -> Self {
        Self::from_topology(Topology::new(name))
    }

    /// Builder with explicit config and registry.
    pub fn with_config(name: &str, config: KernelConfig, registry: BlockRegistry) -> Self {
        Self::from_topology(Topology::with_config(name, config, registry))
    }

    fn from_topology(topology: Topology) -> Self {
        Self {
            topology,
            names: HashMap::new(),
        }
    }

    fn claim(&self, name: &str) -> Result<(), DslError> {
        if name == "self" || self.names.contains_key(name) {
            return Err(DslError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Add a named block.
    pub fn block(&mut self, name: &str, block: Box<dyn Block>) -> Result<NodeHandle, DslError> {
        self.claim(name)?;
        let id = self.topology.add_block(name, block)?;
        self.names.insert(name.to_string(), id);
        Ok(NodeHandle(id))
    }

    /// Add a named block built from the registry.
    pub fn registered(&mut self, name: &str, path: &str, args: &[Value]) -> Result<NodeHandle, DslError> {
        self.claim(name)?;
        let id = self.topology.instantiate(name, path, args)?;
        self.names.insert(name.to_string(), id);
        Ok(NodeHandle(id))
    }

    /// Add a named nested topology.
    pub fn topology(&mut self, name: &str, topology: Topology) -> Result<NodeHandle, DslError> {
        self.claim(name)?;
        let id = self.topology.add_topology(topology);
        self.names.insert(name.to_string(), id);
        Ok(NodeHandle(id))
    }

    /// Handle of a named node.
    pub fn handle(&self, name: &str) -> Result<NodeHandle, DslError> {
        self.names
            .get(name)
            .map(|id| NodeHandle(*id))
            .ok_or_else(|| DslError::MissingNode(name.to_string()))
    }

    fn endpoint(&self, text: &str) -> Result<Endpoint, DslError> {
        let (block, port) = text
            .split_once(':')
            .filter(|(b, p)| !b.is_empty() && !p.is_empty())
            .ok_or_else(|| DslError::BadEndpoint(text.to_string()))?;
        if block == "self" {
            return Ok(Endpoint::boundary(port));
        }
        Ok(Endpoint::port(self.handle(block)?.0, port))
    }

    /// Connect `"src:port"` to `"dst:port"`.
    pub fn connect(&mut self, src: &str, dst: &str) -> Result<&mut Self, DslError> {
        let src = self.endpoint(src)?;
        let dst = self.endpoint(dst)?;
        self.topology.connect(src, dst)?;
        Ok(self)
    }

    /// Build the topology.
    pub fn build(self) -> Topology {
        self.topology
    }
}
