//! Hierarchical topologies.
//!
//! A topology is an arena of nodes, each either a block (owned by its
//! [`Worker`]) or a nested topology, plus flows between node ports and the
//! topology's own boundary ports. [`Topology::commit`] flattens the
//! hierarchy into block-to-block flows, resolves memory domains, installs
//! output pools, subscribes ports and activates blocks. It either succeeds
//! completely or leaves the topology inert.

use crate::block::{Block, BlockError};
use crate::config::KernelConfig;
use crate::domain::{BridgeSource, BufferMode, DomainFlowResolver, DomainQuery, DomainResolutionError, Flow};
use crate::invariant_ppt::{assert_invariant, DOMAIN_ALL_OR_NOTHING, TOPOLOGY_LEGALITY, TOPOLOGY_REJECTS_INVALID};
use crate::pool::BufferPool;
use crate::port::PortError;
use crate::registry::{BlockRegistry, RegistryError, COPIER_PATH};
use crate::worker::{WorkStats, Worker};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

/// Index of a node within its topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// One side of a flow inside a topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A port of a child node.
    Port(BlockId, String),
    /// A port of the topology itself.
    Boundary(String),
}

impl Endpoint {
    pub fn port(id: BlockId, name: impl Into<String>) -> Self {
        Endpoint::Port(id, name.into())
    }

    pub fn boundary(name: impl Into<String>) -> Self {
        Endpoint::Boundary(name.into())
    }
}

/// A concrete block after flattening.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockRef {
    /// Node ids from the root down to the block.
    Path(Vec<BlockId>),
    /// Bridge inserted by the last commit.
    Bridge(usize),
}

/// A concrete block port after flattening.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub block: BlockRef,
    pub port: String,
}

impl PortRef {
    pub fn new(block: BlockRef, port: impl Into<String>) -> Self {
        Self {
            block,
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.block {
            BlockRef::Path(path) => {
                let ids: Vec<String> = path.iter().map(|id| id.0.to_string()).collect();
                write!(f, "{}[{}]", ids.join("/"), self.port)
            }
            BlockRef::Bridge(n) => write!(f, "bridge{}[{}]", n, self.port),
        }
    }
}

/// Errors from building, committing or driving a topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("no node with id {0}")]
    UnknownBlock(usize),
    #[error("{block} has no {direction} port {port:?}")]
    UnknownPort {
        block: String,
        port: String,
        direction: &'static str,
    },
    #[error("flow {0} already exists")]
    DuplicateFlow(String),
    #[error("flow {0} does not exist")]
    NoSuchFlow(String),
    #[error("{0} does not name a block")]
    Dangling(String),
    #[error("output {0} feeds several destinations with their own pools")]
    SharedCustomPool(String),
    #[error("activating {block} failed: {source}")]
    Activation { block: String, source: BlockError },
    #[error("topology is not active")]
    NotActive,
    #[error(transparent)]
    Domain(#[from] DomainResolutionError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn describe(flow: &Flow<Endpoint>) -> String {
    format!("{:?} -> {:?}", flow.src, flow.dst)
}

/// A node of a topology.
#[derive(Debug)]
pub enum Node {
    Block(Worker),
    Topology(Topology),
}

/// Blocks, nested topologies and their flows.
#[derive(Debug)]
pub struct Topology {
    name: String,
    config: KernelConfig,
    registry: BlockRegistry,
    nodes: Vec<Option<Node>>,
    flows: Vec<Flow<Endpoint>>,
    bridges: Vec<Worker>,
    active_flows: Vec<Flow<PortRef>>,
    schedule: Vec<BlockRef>,
    active: bool,
}

impl Topology {
    /// Empty topology with default config and the built-in blocks.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, KernelConfig::default(), BlockRegistry::with_builtins())
    }

    pub fn with_config(name: impl Into<String>, config: KernelConfig, registry: BlockRegistry) -> Self {
        Self {
            name: name.into(),
            config,
            registry,
            nodes: Vec::new(),
            flows: Vec::new(),
            bridges: Vec::new(),
            active_flows: Vec::new(),
            schedule: Vec::new(),
            active: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut BlockRegistry {
        &mut self.registry
    }

    /// Wrap `block` in a worker and add it.
    pub fn add_block(&mut self, name: impl Into<String>, block: Box<dyn Block>) -> Result<BlockId, TopologyError> {
        let worker = Worker::with_config(name, block, self.config.clone())?;
        Ok(self.add_worker(worker))
    }

    /// Build a block from the registry and add it.
    pub fn instantiate(&mut self, name: impl Into<String>, path: &str, args: &[Value]) -> Result<BlockId, TopologyError> {
        let block = self.registry.instantiate_with(path, args)?;
        self.add_block(name, block)
    }

    pub fn add_worker(&mut self, worker: Worker) -> BlockId {
        self.nodes.push(Some(Node::Block(worker)));
        BlockId(self.nodes.len() - 1)
    }

    /// Nest another topology.
    pub fn add_topology(&mut self, topology: Topology) -> BlockId {
        self.nodes.push(Some(Node::Topology(topology)));
        BlockId(self.nodes.len() - 1)
    }

    fn node(&self, id: BlockId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn block(&self, id: BlockId) -> Option<&Worker> {
        match self.node(id) {
            Some(Node::Block(worker)) => Some(worker),
            _ => None,
        }
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Worker> {
        match self.nodes.get_mut(id.0).and_then(Option::as_mut) {
            Some(Node::Block(worker)) => Some(worker),
            _ => None,
        }
    }

    pub fn topology(&self, id: BlockId) -> Option<&Topology> {
        match self.node(id) {
            Some(Node::Topology(topology)) => Some(topology),
            _ => None,
        }
    }

    pub fn topology_mut(&mut self, id: BlockId) -> Option<&mut Topology> {
        match self.nodes.get_mut(id.0).and_then(Option::as_mut) {
            Some(Node::Topology(topology)) => Some(topology),
            _ => None,
        }
    }

    /// First direct child whose name matches.
    pub fn find(&self, name: &str) -> Option<BlockId> {
        self.nodes.iter().position(|node| match node {
            Some(Node::Block(worker)) => worker.name() == name,
            Some(Node::Topology(topology)) => topology.name() == name,
            None => false,
        })
        .map(BlockId)
    }

    /// Boundary inputs, in first-use order.
    pub fn input_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for flow in &self.flows {
            if let Endpoint::Boundary(name) = &flow.src {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Boundary outputs, in first-use order.
    pub fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for flow in &self.flows {
            if let Endpoint::Boundary(name) = &flow.dst {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Flows as declared, hierarchy intact.
    pub fn flows(&self) -> &[Flow<Endpoint>] {
        &self.flows
    }

    fn check_endpoint(&self, endpoint: &Endpoint, as_source: bool) -> Result<(), TopologyError> {
        let Endpoint::Port(id, port) = endpoint else {
            return Ok(());
        };
        match self.node(*id) {
            None => Err(TopologyError::UnknownBlock(id.0)),
            Some(Node::Block(worker)) => {
                if as_source {
                    worker.output(port)?;
                } else {
                    worker.input(port)?;
                }
                Ok(())
            }
            Some(Node::Topology(child)) => {
                let names = if as_source {
                    child.output_names()
                } else {
                    child.input_names()
                };
                if names.contains(port) {
                    Ok(())
                } else {
                    Err(TopologyError::UnknownPort {
                        block: child.name().to_string(),
                        port: port.clone(),
                        direction: if as_source { "output" } else { "input" },
                    })
                }
            }
        }
    }

    /// Add a flow. Boundary endpoints declare the topology's own ports.
    pub fn connect(&mut self, src: Endpoint, dst: Endpoint) -> Result<(), TopologyError> {
        let flow = Flow::new(src, dst);
        let checked = self
            .check_endpoint(&flow.src, true)
            .and_then(|()| self.check_endpoint(&flow.dst, false));
        if let Err(err) = checked {
            assert_invariant(
                TOPOLOGY_REJECTS_INVALID,
                !self.flows.contains(&flow),
                "rejected flow is not recorded",
                Some("connect"),
            );
            return Err(err);
        }
        if self.flows.contains(&flow) {
            return Err(TopologyError::DuplicateFlow(describe(&flow)));
        }
        self.flows.push(flow);
        assert_invariant(
            TOPOLOGY_LEGALITY,
            self.flows.iter().all(|f| self.endpoint_live(&f.src) && self.endpoint_live(&f.dst)),
            "every flow endpoint names a live node",
            Some("connect"),
        );
        Ok(())
    }

    fn endpoint_live(&self, endpoint: &Endpoint) -> bool {
        match endpoint {
            Endpoint::Port(id, _) => self.node(*id).is_some(),
            Endpoint::Boundary(_) => true,
        }
    }

    /// Remove a flow. Takes effect at the next commit.
    pub fn disconnect(&mut self, src: Endpoint, dst: Endpoint) -> Result<(), TopologyError> {
        let flow = Flow::new(src, dst);
        match self.flows.iter().position(|f| *f == flow) {
            Some(i) => {
                self.flows.remove(i);
                Ok(())
            }
            None => Err(TopologyError::NoSuchFlow(describe(&flow))),
        }
    }

    /// Remove a node and every flow touching it.
    pub fn remove_block(&mut self, id: BlockId) -> Result<Node, TopologyError> {
        let node = self
            .nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(TopologyError::UnknownBlock(id.0))?;
        let touches = |e: &Endpoint| matches!(e, Endpoint::Port(n, _) if *n == id);
        self.flows.retain(|f| !touches(&f.src) && !touches(&f.dst));
        Ok(node)
    }

    /// Block-to-block flows with nested topologies and boundary ports squashed out.
    pub fn flatten(&self) -> Vec<Flow<PortRef>> {
        let mut out = Vec::new();
        let mut frames: Vec<Frame<'_>> = vec![(self, Vec::new())];
        flatten_frame(&mut frames, &mut out);
        out
    }

    /// Flows installed by the last successful commit, bridges included.
    pub fn active_flows(&self) -> &[Flow<PortRef>] {
        &self.active_flows
    }

    /// Bridges inserted by the last successful commit.
    pub fn bridges(&self) -> &[Worker] {
        &self.bridges
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Worker behind a flattened block reference.
    pub fn worker(&self, block: &BlockRef) -> Option<&Worker> {
        match block {
            BlockRef::Bridge(n) => self.bridges.get(*n),
            BlockRef::Path(path) => find_worker(&self.nodes, path),
        }
    }

    pub fn worker_mut(&mut self, block: &BlockRef) -> Option<&mut Worker> {
        lookup(&mut self.nodes, &mut self.bridges, block)
    }

    /// Flatten, resolve domains, install pools, subscribe and activate.
    ///
    /// On failure the previous wiring stays when nothing was touched yet;
    /// failures after rewiring began leave the topology inert.
    pub fn commit(&mut self) -> Result<(), TopologyError> {
        let flat = self.flatten();

        let mut factory = BridgeFactory {
            registry: &self.registry,
            config: &self.config,
            created: Vec::new(),
        };
        let resolved = DomainFlowResolver::new(CommitQuery { nodes: &mut self.nodes }).resolve(&flat, &mut factory);
        let mut bridges = factory.created;
        let resolution = match resolved {
            Ok(resolution) => resolution,
            Err(err) => {
                tracing::error!(topology = %self.name, error = %err, "domain resolution failed");
                return Err(err.into());
            }
        };
        if resolution.bridges != 0 {
            tracing::debug!(topology = %self.name, bridges = resolution.bridges, "inserted domain bridges");
        }

        let pools = plan_pools(&mut self.nodes, &mut bridges, &resolution.flows)?;

        let previous: Vec<BlockRef> = std::mem::take(&mut self.schedule)
            .into_iter()
            .filter(|b| matches!(b, BlockRef::Path(_)))
            .collect();
        self.unwire();
        self.bridges = bridges;
        let schedule = schedule(&resolution.flows);

        if let Err(err) = self.wire(pools, &resolution.flows, &schedule) {
            self.unwire();
            self.halt(previous.iter());
            return Err(err);
        }

        for block in &schedule {
            let Some(worker) = self.worker_mut(block) else {
                continue;
            };
            if let Err(source) = worker.activate() {
                let name = worker.name().to_string();
                // blocks kept running from the previous commit stop as well
                self.halt(schedule.iter().chain(previous.iter()));
                self.unwire();
                assert_invariant(
                    DOMAIN_ALL_OR_NOTHING,
                    schedule
                        .iter()
                        .chain(previous.iter())
                        .all(|b| self.worker(b).map_or(true, |w| !w.is_active()))
                        && self.bridges.is_empty(),
                    "failed commit leaves nothing activated",
                    Some(&self.name),
                );
                return Err(TopologyError::Activation { block: name, source });
            }
        }

        for block in previous.iter().filter(|b| !schedule.contains(b)) {
            if let Some(worker) = self.worker_mut(block) {
                if let Err(err) = worker.deactivate() {
                    tracing::error!(block = %worker.name(), error = %err, "deactivate failed");
                }
            }
        }

        self.active_flows = resolution.flows;
        self.schedule = schedule;
        self.active = true;
        Ok(())
    }

    /// Deactivate each listed block that is still active.
    fn halt<'a>(&mut self, blocks: impl IntoIterator<Item = &'a BlockRef>) {
        for block in blocks {
            let Some(worker) = self.worker_mut(block) else {
                continue;
            };
            if let Err(err) = worker.deactivate() {
                tracing::error!(block = %worker.name(), error = %err, "rollback deactivate failed");
            }
        }
    }

    fn wire(
        &mut self,
        pools: Vec<(PortRef, BufferPool)>,
        flows: &[Flow<PortRef>],
        schedule: &[BlockRef],
    ) -> Result<(), TopologyError> {
        for (src, pool) in pools {
            self.worker_ref_mut(&src.block)?.install_pool(&src.port, pool)?;
        }
        for flow in flows {
            let handle = self.worker_ref_mut(&flow.dst.block)?.input_handle(&flow.dst.port)?;
            self.worker_ref_mut(&flow.src.block)?
                .output_mut(&flow.src.port)?
                .subscribe(handle);
        }
        for block in schedule {
            self.worker_ref_mut(block)?.ensure_output_pools()?;
        }
        Ok(())
    }

    fn worker_ref_mut(&mut self, block: &BlockRef) -> Result<&mut Worker, TopologyError> {
        let name = format!("{:?}", block);
        self.worker_mut(block).ok_or(TopologyError::Dangling(name))
    }

    /// Drop every subscription and bridge.
    fn unwire(&mut self) {
        for_each_worker(&mut self.nodes, &mut |worker| {
            for output in worker.outputs_mut() {
                output.clear_subscribers();
            }
        });
        for bridge in &mut self.bridges {
            if let Err(err) = bridge.deactivate() {
                tracing::error!(block = %bridge.name(), error = %err, "bridge deactivate failed");
            }
        }
        self.bridges.clear();
        self.active_flows.clear();
        self.active = false;
    }

    /// Deactivate every scheduled block. Wiring stays for the next commit.
    pub fn deactivate(&mut self) -> Result<(), TopologyError> {
        let mut first: Option<TopologyError> = None;
        for block in self.schedule.clone() {
            let Some(worker) = self.worker_mut(&block) else {
                continue;
            };
            if let Err(source) = worker.deactivate() {
                tracing::error!(block = %worker.name(), error = %source, "deactivate failed");
                first.get_or_insert(TopologyError::Activation {
                    block: worker.name().to_string(),
                    source,
                });
            }
        }
        self.active = false;
        first.map_or(Ok(()), Err)
    }

    /// Run one work pass of every active block in flow order.
    /// Returns how many blocks ran their work.
    pub fn run_pass(&mut self) -> Result<usize, TopologyError> {
        if !self.active {
            return Err(TopologyError::NotActive);
        }
        let mut ran = 0;
        for i in 0..self.schedule.len() {
            let block = self.schedule[i].clone();
            if let Some(worker) = self.worker_mut(&block) {
                if worker.is_active() && worker.work_pass() {
                    ran += 1;
                }
            }
        }
        Ok(ran)
    }

    /// Counters of every scheduled block.
    pub fn stats(&self) -> Vec<WorkStats> {
        self.schedule
            .iter()
            .filter_map(|block| self.worker(block))
            .map(Worker::stats)
            .collect()
    }

    /// Active wiring and counters as JSON.
    pub fn to_json(&self) -> Value {
        let flows: Vec<Value> = self
            .active_flows
            .iter()
            .map(|f| json!({ "src": f.src.to_string(), "dst": f.dst.to_string() }))
            .collect();
        json!({
            "name": self.name,
            "active": self.active,
            "bridges": self.bridges.len(),
            "flows": flows,
            "stats": self.stats(),
        })
    }
}

type Frame<'a> = (&'a Topology, Vec<BlockId>);

fn child_path(prefix: &[BlockId], id: BlockId) -> Vec<BlockId> {
    let mut path = prefix.to_vec();
    path.push(id);
    path
}

/// Concrete input ports reached when data enters `endpoint`.
fn sinks<'a>(frames: &mut Vec<Frame<'a>>, endpoint: &Endpoint, out: &mut Vec<PortRef>) {
    trace_ports(frames, endpoint, out, true);
}

/// Concrete output ports feeding `endpoint`.
fn sources<'a>(frames: &mut Vec<Frame<'a>>, endpoint: &Endpoint, out: &mut Vec<PortRef>) {
    trace_ports(frames, endpoint, out, false);
}

fn trace_ports<'a>(frames: &mut Vec<Frame<'a>>, endpoint: &Endpoint, out: &mut Vec<PortRef>, downstream: bool) {
    let Some((topology, prefix)) = frames.last().cloned() else {
        return;
    };
    match endpoint {
        Endpoint::Port(id, port) => match topology.node(*id) {
            Some(Node::Block(_)) => {
                let port_ref = PortRef::new(BlockRef::Path(child_path(&prefix, *id)), port.clone());
                if !out.contains(&port_ref) {
                    out.push(port_ref);
                }
            }
            Some(Node::Topology(child)) => {
                frames.push((child, child_path(&prefix, *id)));
                for flow in &child.flows {
                    let (near, far) = if downstream { (&flow.src, &flow.dst) } else { (&flow.dst, &flow.src) };
                    if matches!(near, Endpoint::Boundary(name) if name == port) {
                        trace_ports(frames, far, out, downstream);
                    }
                }
                frames.pop();
            }
            None => {}
        },
        Endpoint::Boundary(name) => {
            // Leave the nested topology through its own port.
            if frames.len() < 2 {
                return;
            }
            let Some(frame) = frames.pop() else {
                return;
            };
            if let (Some(&child), Some(&(parent, _))) = (frame.1.last(), frames.last()) {
                let via = Endpoint::Port(child, name.clone());
                for flow in &parent.flows {
                    let (near, far) = if downstream { (&flow.src, &flow.dst) } else { (&flow.dst, &flow.src) };
                    if *near == via {
                        trace_ports(frames, far, out, downstream);
                    }
                }
            }
            frames.push(frame);
        }
    }
}

fn flatten_frame<'a>(frames: &mut Vec<Frame<'a>>, out: &mut Vec<Flow<PortRef>>) {
    let Some((topology, prefix)) = frames.last().cloned() else {
        return;
    };
    for flow in &topology.flows {
        if matches!(flow.src, Endpoint::Boundary(_)) || matches!(flow.dst, Endpoint::Boundary(_)) {
            continue;
        }
        let mut srcs = Vec::new();
        let mut dsts = Vec::new();
        sources(frames, &flow.src, &mut srcs);
        sinks(frames, &flow.dst, &mut dsts);
        for src in &srcs {
            for dst in &dsts {
                let flat = Flow::new(src.clone(), dst.clone());
                if !out.contains(&flat) {
                    out.push(flat);
                }
            }
        }
    }
    for (i, node) in topology.nodes.iter().enumerate() {
        if let Some(Node::Topology(child)) = node {
            frames.push((child, child_path(&prefix, BlockId(i))));
            flatten_frame(frames, out);
            frames.pop();
        }
    }
}

fn find_worker<'a>(nodes: &'a [Option<Node>], path: &[BlockId]) -> Option<&'a Worker> {
    let (first, rest) = path.split_first()?;
    match nodes.get(first.0)?.as_ref()? {
        Node::Block(worker) if rest.is_empty() => Some(worker),
        Node::Topology(child) if !rest.is_empty() => find_worker(&child.nodes, rest),
        _ => None,
    }
}

fn find_worker_mut<'a>(nodes: &'a mut [Option<Node>], path: &[BlockId]) -> Option<&'a mut Worker> {
    let (first, rest) = path.split_first()?;
    match nodes.get_mut(first.0)?.as_mut()? {
        Node::Block(worker) if rest.is_empty() => Some(worker),
        Node::Topology(child) if !rest.is_empty() => find_worker_mut(&mut child.nodes, rest),
        _ => None,
    }
}

fn lookup<'a>(nodes: &'a mut [Option<Node>], bridges: &'a mut [Worker], block: &BlockRef) -> Option<&'a mut Worker> {
    match block {
        BlockRef::Path(path) => find_worker_mut(nodes, path),
        BlockRef::Bridge(n) => bridges.get_mut(*n),
    }
}

fn for_each_worker(nodes: &mut [Option<Node>], f: &mut dyn FnMut(&mut Worker)) {
    for node in nodes.iter_mut().flatten() {
        match node {
            Node::Block(worker) => f(worker),
            Node::Topology(child) => for_each_worker(&mut child.nodes, f),
        }
    }
}

/// Flow order: sources first, blocks on cycles last in first-seen order.
fn schedule(flows: &[Flow<PortRef>]) -> Vec<BlockRef> {
    let mut blocks: Vec<BlockRef> = Vec::new();
    for flow in flows {
        for block in [&flow.src.block, &flow.dst.block] {
            if !blocks.contains(block) {
                blocks.push(block.clone());
            }
        }
    }
    let index: HashMap<&BlockRef, usize> = blocks.iter().enumerate().map(|(i, b)| (b, i)).collect();
    let mut in_degree = vec![0usize; blocks.len()];
    let mut adjacent: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];
    for flow in flows {
        let (from, to) = (index[&flow.src.block], index[&flow.dst.block]);
        if from != to && !adjacent[from].contains(&to) {
            adjacent[from].push(to);
            in_degree[to] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..blocks.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order: Vec<usize> = Vec::with_capacity(blocks.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &next in &adjacent[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    for i in 0..blocks.len() {
        if !order.contains(&i) {
            order.push(i);
        }
    }
    order.into_iter().map(|i| blocks[i].clone()).collect()
}

/// Choose the pool each source port produces into.
///
/// The source's own pool wins, then the pool of a custom destination, then
/// a generic pool.
fn plan_pools(
    nodes: &mut [Option<Node>],
    bridges: &mut [Worker],
    flows: &[Flow<PortRef>],
) -> Result<Vec<(PortRef, BufferPool)>, TopologyError> {
    let mut groups: Vec<(PortRef, Vec<PortRef>)> = Vec::new();
    for flow in flows {
        match groups.iter_mut().find(|(src, _)| *src == flow.src) {
            Some((_, dsts)) => dsts.push(flow.dst.clone()),
            None => groups.push((flow.src.clone(), vec![flow.dst.clone()])),
        }
    }

    let dangling = |port: &PortRef| TopologyError::Dangling(port.to_string());
    let mut pools = Vec::with_capacity(groups.len());
    for (src, dsts) in groups {
        let dst = &dsts[0];
        let src_domain = lookup(nodes, bridges, &src.block)
            .ok_or_else(|| dangling(&src))?
            .port_domain(&src.port, false)?;
        let dst_domain = lookup(nodes, bridges, &dst.block)
            .ok_or_else(|| dangling(dst))?
            .port_domain(&dst.port, true)?;
        let src_mode = lookup(nodes, bridges, &src.block)
            .ok_or_else(|| dangling(&src))?
            .buffer_mode(&src.port, &dst_domain, false)?;
        let dst_mode = lookup(nodes, bridges, &dst.block)
            .ok_or_else(|| dangling(dst))?
            .buffer_mode(&dst.port, &src_domain, true)?;

        let pool = if src_mode != BufferMode::Custom && dst_mode == BufferMode::Custom {
            for other in &dsts[1..] {
                let mode = lookup(nodes, bridges, &other.block)
                    .ok_or_else(|| dangling(other))?
                    .buffer_mode(&other.port, &src_domain, true)?;
                if mode != BufferMode::Abdicate {
                    return Err(TopologyError::SharedCustomPool(src.to_string()));
                }
            }
            lookup(nodes, bridges, &dst.block)
                .ok_or_else(|| dangling(dst))?
                .buffer_pool(&dst.port, &src_domain, true)?
        } else {
            lookup(nodes, bridges, &src.block)
                .ok_or_else(|| dangling(&src))?
                .buffer_pool(&src.port, &dst_domain, false)?
        };
        pools.push((src, pool));
    }
    Ok(pools)
}

/// Domain queries answered by the topology's workers.
struct CommitQuery<'a> {
    nodes: &'a mut Vec<Option<Node>>,
}

impl CommitQuery<'_> {
    fn worker(&mut self, port: &PortRef) -> Result<&mut Worker, DomainResolutionError> {
        let path = match &port.block {
            BlockRef::Path(path) => path,
            BlockRef::Bridge(_) => {
                return Err(DomainResolutionError::Query {
                    port: port.to_string(),
                    reason: "bridge ports are not queried".into(),
                })
            }
        };
        find_worker_mut(self.nodes, path).ok_or_else(|| DomainResolutionError::Query {
            port: port.to_string(),
            reason: "no such block".into(),
        })
    }
}

impl DomainQuery for CommitQuery<'_> {
    type Port = PortRef;

    fn domain(&mut self, port: &PortRef, is_input: bool) -> Result<String, DomainResolutionError> {
        if matches!(port.block, BlockRef::Bridge(_)) {
            return Ok(String::new());
        }
        self.worker(port)?
            .port_domain(&port.port, is_input)
            .map_err(|err| DomainResolutionError::Query {
                port: port.to_string(),
                reason: err.to_string(),
            })
    }

    fn buffer_mode(&mut self, port: &PortRef, domain: &str, is_input: bool) -> Result<BufferMode, DomainResolutionError> {
        if matches!(port.block, BlockRef::Bridge(_)) {
            return Ok(BufferMode::Abdicate);
        }
        self.worker(port)?
            .buffer_mode(&port.port, domain, is_input)
            .map_err(|err| DomainResolutionError::Query {
                port: port.to_string(),
                reason: err.to_string(),
            })
    }

    fn is_bridge(&self, port: &PortRef) -> bool {
        matches!(port.block, BlockRef::Bridge(_))
    }
}

/// Instantiates copier blocks from the registry.
struct BridgeFactory<'a> {
    registry: &'a BlockRegistry,
    config: &'a KernelConfig,
    created: Vec<Worker>,
}

impl BridgeSource for BridgeFactory<'_> {
    type Port = PortRef;

    fn create_bridge(&mut self) -> Result<(PortRef, PortRef), DomainResolutionError> {
        let block = self
            .registry
            .instantiate(COPIER_PATH)
            .map_err(|err| DomainResolutionError::Bridge(err.to_string()))?;
        let worker = Worker::with_config("DomainBridge", block, self.config.clone())
            .map_err(|err| DomainResolutionError::Bridge(err.to_string()))?;
        let n = self.created.len();
        self.created.push(worker);
        let port = PortRef::new(BlockRef::Bridge(n), "0");
        Ok((port.clone(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{PortDecl, PortDomainError, WorkContext};
    use crate::dtype::DType;
    use crate::pool::PoolArgs;
    use std::sync::{Arc, Mutex};

    struct Source {
        data: Vec<i32>,
        sent: usize,
        domain: &'static str,
        custom: bool,
    }

    impl Source {
        fn new(data: Vec<i32>) -> Self {
            Self {
                data,
                sent: 0,
                domain: "",
                custom: false,
            }
        }
    }

    impl Block for Source {
        fn input_ports(&self) -> Vec<PortDecl> {
            Vec::new()
        }

        fn output_ports(&self) -> Vec<PortDecl> {
            vec![PortDecl::stream("0", DType::of::<i32>()).in_domain(self.domain)]
        }

        fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<(), BlockError> {
            let out = &mut ctx.outputs[0];
            let n = (self.data.len() - self.sent).min(out.elements());
            let bytes: &[u8] = bytemuck::cast_slice(&self.data[self.sent..self.sent + n]);
            out.as_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
            out.produce(n);
            self.sent += n;
            Ok(())
        }

        fn output_buffer_pool(&mut self, _port: &str, _domain: &str) -> Result<Option<BufferPool>, PortDomainError> {
            if self.custom {
                Ok(BufferPool::make("generic").ok())
            } else {
                Ok(None)
            }
        }
    }

    struct Sink {
        domain: &'static str,
        seen: Arc<Mutex<Vec<i32>>>,
        fail_activate: bool,
        own_pool: bool,
    }

    impl Sink {
        fn new(domain: &'static str) -> (Self, Arc<Mutex<Vec<i32>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    domain,
                    seen: seen.clone(),
                    fail_activate: false,
                    own_pool: false,
                },
                seen,
            )
        }
    }

    impl Block for Sink {
        fn input_ports(&self) -> Vec<PortDecl> {
            vec![PortDecl::stream("0", DType::of::<i32>()).in_domain(self.domain)]
        }

        fn output_ports(&self) -> Vec<PortDecl> {
            Vec::new()
        }

        fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<(), BlockError> {
            let input = &mut ctx.inputs[0];
            let n = input.elements();
            self.seen.lock().unwrap().extend(input.buffer().to_vec::<i32>());
            input.consume(n);
            Ok(())
        }

        fn activate(&mut self) -> Result<(), BlockError> {
            if self.fail_activate {
                Err(BlockError::new("device missing"))
            } else {
                Ok(())
            }
        }

        fn input_buffer_pool(&mut self, port: &str, domain: &str) -> Result<Option<BufferPool>, PortDomainError> {
            if !self.own_pool {
                return Ok(None);
            }
            if domain.is_empty() || domain == self.domain {
                Ok(BufferPool::make("generic").ok())
            } else {
                Err(PortDomainError {
                    port: port.to_string(),
                    domain: domain.to_string(),
                })
            }
        }
    }

    /// Posts its input buffers downstream without copying.
    struct Forwarder {
        unique: bool,
    }

    impl Block for Forwarder {
        fn input_ports(&self) -> Vec<PortDecl> {
            vec![PortDecl::stream("0", DType::of::<i32>())]
        }

        fn output_ports(&self) -> Vec<PortDecl> {
            let port = PortDecl::stream("0", DType::of::<i32>());
            vec![if self.unique { port.in_unique_domain() } else { port }]
        }

        fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<(), BlockError> {
            let input = &mut ctx.inputs[0];
            let n = input.elements();
            let chunk = input.buffer().slice(0, n * 4)?;
            input.consume(n);
            ctx.outputs[0].post_buffer(chunk);
            Ok(())
        }
    }

    fn small() -> KernelConfig {
        KernelConfig {
            pool: PoolArgs {
                num_buffers: 4,
                buffer_size: 256,
                node_affinity: -1,
            },
            ..KernelConfig::default()
        }
    }

    #[test]
    fn chain_delivers_data() {
        let mut topology = Topology::with_config("chain", small(), BlockRegistry::with_builtins());
        let src = topology.add_block("src", Box::new(Source::new(vec![1, 2, 3, 4]))).unwrap();
        let (sink, seen) = Sink::new("");
        let dst = topology.add_block("dst", Box::new(sink)).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(dst, "0")).unwrap();
        topology.commit().unwrap();
        assert!(topology.bridges().is_empty());
        topology.run_pass().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn connect_rejects_unknown_ports() {
        let mut topology = Topology::new("bad");
        let src = topology.add_block("src", Box::new(Source::new(vec![]))).unwrap();
        let (sink, _) = Sink::new("");
        let dst = topology.add_block("dst", Box::new(sink)).unwrap();
        assert!(matches!(
            topology.connect(Endpoint::port(src, "7"), Endpoint::port(dst, "0")),
            Err(TopologyError::Port(PortError::UnknownPort { .. }))
        ));
        assert!(matches!(
            topology.connect(Endpoint::port(src, "0"), Endpoint::port(BlockId(9), "0")),
            Err(TopologyError::UnknownBlock(9))
        ));
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(dst, "0")).unwrap();
        assert!(matches!(
            topology.connect(Endpoint::port(src, "0"), Endpoint::port(dst, "0")),
            Err(TopologyError::DuplicateFlow(_))
        ));
        assert_eq!(topology.flows().len(), 1);
    }

    #[test]
    fn nested_topology_flattens() {
        let mut inner = Topology::new("inner");
        let (sink, _) = Sink::new("");
        let inner_sink = inner.add_block("sink", Box::new(sink)).unwrap();
        inner
            .connect(Endpoint::boundary("in"), Endpoint::port(inner_sink, "0"))
            .unwrap();

        let mut outer = Topology::new("outer");
        let src = outer.add_block("src", Box::new(Source::new(vec![]))).unwrap();
        let nested = outer.add_topology(inner);
        outer
            .connect(Endpoint::port(src, "0"), Endpoint::port(nested, "in"))
            .unwrap();

        let flat = outer.flatten();
        assert_eq!(
            flat,
            vec![Flow::new(
                PortRef::new(BlockRef::Path(vec![src]), "0"),
                PortRef::new(BlockRef::Path(vec![nested, inner_sink]), "0"),
            )]
        );
    }

    #[test]
    fn mixed_destination_domains_get_a_bridge() {
        let mut topology = Topology::with_config("scenario", small(), BlockRegistry::with_builtins());
        let mut source = Source::new(vec![5, 6, 7]);
        source.domain = "gpu";
        source.custom = true;
        let src = topology.add_block("src", Box::new(source)).unwrap();
        let (gpu_sink, gpu_seen) = Sink::new("gpu");
        let (cpu_sink, cpu_seen) = Sink::new("cpu");
        let a = topology.add_block("a", Box::new(gpu_sink)).unwrap();
        let b = topology.add_block("b", Box::new(cpu_sink)).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(a, "0")).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(b, "0")).unwrap();

        topology.commit().unwrap();
        assert_eq!(topology.bridges().len(), 1);
        assert_eq!(topology.active_flows().len(), 3);

        topology.run_pass().unwrap();
        assert_eq!(*gpu_seen.lock().unwrap(), vec![5, 6, 7]);
        assert_eq!(*cpu_seen.lock().unwrap(), vec![5, 6, 7]);

        // recommitting rebuilds the same wiring
        topology.commit().unwrap();
        assert_eq!(topology.bridges().len(), 1);
        assert_eq!(topology.active_flows().len(), 3);
    }

    #[test]
    fn missing_copier_aborts_commit() {
        let mut topology = Topology::with_config("no-copier", small(), BlockRegistry::new());
        let mut source = Source::new(vec![1]);
        source.domain = "gpu";
        source.custom = true;
        let src = topology.add_block("src", Box::new(source)).unwrap();
        let (a, _) = Sink::new("gpu");
        let (b, _) = Sink::new("cpu");
        let a = topology.add_block("a", Box::new(a)).unwrap();
        let b = topology.add_block("b", Box::new(b)).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(a, "0")).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(b, "0")).unwrap();

        assert!(matches!(
            topology.commit(),
            Err(TopologyError::Domain(DomainResolutionError::Bridge(_)))
        ));
        assert!(!topology.is_active());
        assert!(topology.bridges().is_empty());
        assert!(topology.block(src).unwrap().outputs()[0].subscribers().is_empty());
        assert!(matches!(topology.run_pass(), Err(TopologyError::NotActive)));
    }

    #[test]
    fn activation_failure_rolls_back() {
        let mut topology = Topology::with_config("rollback", small(), BlockRegistry::with_builtins());
        let src = topology.add_block("src", Box::new(Source::new(vec![1]))).unwrap();
        let (mut sink, _) = Sink::new("");
        sink.fail_activate = true;
        let dst = topology.add_block("dst", Box::new(sink)).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(dst, "0")).unwrap();

        let err = topology.commit().unwrap_err();
        assert!(matches!(err, TopologyError::Activation { ref block, .. } if block == "dst"));
        assert!(!topology.is_active());
        assert!(!topology.block(src).unwrap().is_active());
        assert!(topology.block(src).unwrap().outputs()[0].subscribers().is_empty());
    }

    #[test]
    fn failed_recommit_stops_running_blocks() {
        let mut topology = Topology::with_config("recommit", small(), BlockRegistry::with_builtins());
        let src = topology.add_block("src", Box::new(Source::new(vec![1]))).unwrap();
        let (sink, _) = Sink::new("");
        let dst = topology.add_block("dst", Box::new(sink)).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(dst, "0")).unwrap();
        topology.commit().unwrap();
        assert!(topology.block(src).unwrap().is_active());

        let (mut broken, _) = Sink::new("");
        broken.fail_activate = true;
        let extra = topology.add_block("extra", Box::new(broken)).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(extra, "0")).unwrap();

        assert!(matches!(
            topology.commit(),
            Err(TopologyError::Activation { ref block, .. }) if block == "extra"
        ));
        assert!(!topology.is_active());
        assert!(!topology.block(src).unwrap().is_active());
        assert!(!topology.block(dst).unwrap().is_active());
        assert!(matches!(topology.run_pass(), Err(TopologyError::NotActive)));
    }

    fn forwarding_chain(unique: bool) -> (Topology, Arc<Mutex<Vec<i32>>>) {
        let mut topology = Topology::with_config("forward", small(), BlockRegistry::with_builtins());
        let src = topology.add_block("src", Box::new(Source::new(vec![1, 2, 3]))).unwrap();
        let fwd = topology.add_block("fwd", Box::new(Forwarder { unique })).unwrap();
        let (mut sink, seen) = Sink::new("dev");
        sink.own_pool = true;
        let dst = topology.add_block("dst", Box::new(sink)).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(fwd, "0")).unwrap();
        topology.connect(Endpoint::port(fwd, "0"), Endpoint::port(dst, "0")).unwrap();
        (topology, seen)
    }

    #[test]
    fn forwarding_output_in_unique_domain_gets_a_bridge() {
        let (mut host, _) = forwarding_chain(false);
        host.commit().unwrap();
        assert!(host.bridges().is_empty(), "host domain hands the sink pool to the forwarder");

        let (mut topology, seen) = forwarding_chain(true);
        topology.commit().unwrap();
        assert_eq!(topology.bridges().len(), 1);
        assert_eq!(topology.active_flows().len(), 3);
        topology.run_pass().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn remove_block_drops_its_flows() {
        let mut topology = Topology::new("remove");
        let src = topology.add_block("src", Box::new(Source::new(vec![]))).unwrap();
        let (sink, _) = Sink::new("");
        let dst = topology.add_block("dst", Box::new(sink)).unwrap();
        topology.connect(Endpoint::port(src, "0"), Endpoint::port(dst, "0")).unwrap();
        topology.remove_block(dst).unwrap();
        assert!(topology.flows().is_empty());
        assert!(matches!(topology.remove_block(dst), Err(TopologyError::UnknownBlock(_))));
        assert_eq!(topology.find("src"), Some(src));
    }

    #[test]
    fn schedule_puts_sources_first() {
        let p = |id: usize| PortRef::new(BlockRef::Path(vec![BlockId(id)]), "0");
        let flows = vec![Flow::new(p(2), p(3)), Flow::new(p(1), p(2))];
        let order = schedule(&flows);
        assert_eq!(
            order,
            vec![
                BlockRef::Path(vec![BlockId(1)]),
                BlockRef::Path(vec![BlockId(2)]),
                BlockRef::Path(vec![BlockId(3)]),
            ]
        );
    }
}
