//! Worker: one block plus its ports and the pass that drives them.
//!
//! A pass has three steps. Pre-work loads every output's production
//! buffer and every input's window and decides whether the block should
//! run. Work calls the block with panics contained. Post-work propagates
//! labels, retires consumed input and publishes produced output.

use crate::block::{Block, PortDecl, PortKind, WorkContext, WorkInfo};
use crate::config::KernelConfig;
use crate::domain::BufferMode;
use crate::invariant_ppt::{assert_invariant, POOL_OWNERSHIP};
use crate::pool::BufferPool;
use crate::port::{InputHandle, InputPort, OutputPort, PortError, PortStats};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Element count standing in for "no constraint" in [`WorkInfo`].
const UNBOUNDED: usize = 1 << 30;

/// Decimal port names are indexed.
fn port_index(name: &str) -> Option<usize> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

type PortKey = (bool, String, String);

static NEXT_WORKER_UID: AtomicU64 = AtomicU64::new(1);

/// Counters snapshot for one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkStats {
    pub block: String,
    pub task_calls: u64,
    pub work_calls: u64,
    pub work_errors: u64,
    pub inputs: Vec<PortStats>,
    pub outputs: Vec<PortStats>,
}

/// Owns a block and runs its passes.
pub struct Worker {
    uid: u64,
    name: String,
    block: Box<dyn Block>,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    config: KernelConfig,
    wake: Arc<AtomicBool>,
    modes: HashMap<PortKey, BufferMode>,
    pools: HashMap<PortKey, BufferPool>,
    active: bool,
    task_calls: u64,
    work_calls: u64,
    work_errors: u64,
}

impl Worker {
    /// Wrap `block` with default config.
    pub fn new(name: impl Into<String>, block: Box<dyn Block>) -> Result<Self, PortError> {
        Self::with_config(name, block, KernelConfig::default())
    }

    /// Wrap `block`, creating the ports it declares.
    pub fn with_config(name: impl Into<String>, block: Box<dyn Block>, config: KernelConfig) -> Result<Self, PortError> {
        let inputs = block.input_ports();
        let outputs = block.output_ports();
        let mut worker = Self {
            uid: NEXT_WORKER_UID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            block,
            inputs: Vec::with_capacity(inputs.len()),
            outputs: Vec::with_capacity(outputs.len()),
            config,
            wake: Arc::new(AtomicBool::new(false)),
            modes: HashMap::new(),
            pools: HashMap::new(),
            active: false,
            task_calls: 0,
            work_calls: 0,
            work_errors: 0,
        };
        for decl in inputs {
            worker.setup_input(decl)?;
        }
        for decl in outputs {
            worker.setup_output(decl)?;
        }
        Ok(worker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Process-wide identifier of this worker.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Domain tag given to ports declared with [`PortDecl::in_unique_domain`].
    pub fn unique_domain(&self) -> String {
        format!("uid:{}", self.uid)
    }

    fn decl_domain(&self, decl: &PortDecl) -> String {
        if decl.unique_domain {
            self.unique_domain()
        } else {
            decl.domain.clone()
        }
    }

    /// Add an input port.
    pub fn setup_input(&mut self, decl: PortDecl) -> Result<(), PortError> {
        if self.inputs.iter().any(|p| p.name() == decl.name) {
            return Err(PortError::DuplicatePort {
                block: self.name.clone(),
                port: decl.name,
                direction: "input",
            });
        }
        let index = port_index(&decl.name);
        let domain = self.decl_domain(&decl);
        let mut port = InputPort::with_options(
            decl.name,
            decl.dtype,
            self.config.max_message_queue,
            self.config.accumulator_capacity,
            self.wake.clone(),
        );
        port.set_index(index);
        port.set_domain(domain);
        port.set_slot(decl.kind == PortKind::Message);
        self.inputs.push(port);
        Ok(())
    }

    /// Add an output port.
    pub fn setup_output(&mut self, decl: PortDecl) -> Result<(), PortError> {
        if self.outputs.iter().any(|p| p.name() == decl.name) {
            return Err(PortError::DuplicatePort {
                block: self.name.clone(),
                port: decl.name,
                direction: "output",
            });
        }
        let index = port_index(&decl.name);
        let domain = self.decl_domain(&decl);
        let mut port = OutputPort::new(decl.name, decl.dtype);
        port.set_index(index);
        port.set_domain(domain);
        port.set_signal(decl.kind == PortKind::Message);
        self.outputs.push(port);
        Ok(())
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn inputs_mut(&mut self) -> &mut [InputPort] {
        &mut self.inputs
    }

    pub fn outputs_mut(&mut self) -> &mut [OutputPort] {
        &mut self.outputs
    }

    fn unknown(&self, port: &str, is_input: bool) -> PortError {
        PortError::UnknownPort {
            block: self.name.clone(),
            port: port.to_string(),
            direction: if is_input { "input" } else { "output" },
        }
    }

    /// Input by name.
    pub fn input(&self, name: &str) -> Result<&InputPort, PortError> {
        self.inputs
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| self.unknown(name, true))
    }

    /// Output by name.
    pub fn output(&self, name: &str) -> Result<&OutputPort, PortError> {
        self.outputs
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| self.unknown(name, false))
    }

    /// Mutable input by name.
    pub fn input_mut(&mut self, name: &str) -> Result<&mut InputPort, PortError> {
        match self.inputs.iter().position(|p| p.name() == name) {
            Some(i) => Ok(&mut self.inputs[i]),
            None => Err(self.unknown(name, true)),
        }
    }

    /// Mutable output by name.
    pub fn output_mut(&mut self, name: &str) -> Result<&mut OutputPort, PortError> {
        match self.outputs.iter().position(|p| p.name() == name) {
            Some(i) => Ok(&mut self.outputs[i]),
            None => Err(self.unknown(name, false)),
        }
    }

    /// Upstream handle of an input.
    pub fn input_handle(&self, name: &str) -> Result<InputHandle, PortError> {
        self.input(name).map(InputPort::handle)
    }

    /// Domain tag of a port.
    pub fn port_domain(&self, name: &str, is_input: bool) -> Result<String, PortError> {
        if is_input {
            self.input(name).map(|p| p.domain().to_string())
        } else {
            self.output(name).map(|p| p.domain().to_string())
        }
    }

    /// How `port` wants buffers provisioned towards a peer in `domain`.
    ///
    /// The block is asked once per (direction, port, domain); a custom pool it
    /// returns is kept for [`buffer_pool`](Self::buffer_pool).
    pub fn buffer_mode(&mut self, port: &str, domain: &str, is_input: bool) -> Result<BufferMode, PortError> {
        let key = (is_input, port.to_string(), domain.to_string());
        if let Some(mode) = self.modes.get(&key) {
            return Ok(*mode);
        }
        let message_only = if is_input {
            self.input(port)?.is_slot()
        } else {
            self.output(port)?.is_signal()
        };
        let mode = if message_only {
            BufferMode::Abdicate
        } else {
            let answer = if is_input {
                self.block.input_buffer_pool(port, domain)
            } else {
                self.block.output_buffer_pool(port, domain)
            };
            match answer {
                Ok(Some(pool)) => {
                    self.pools.insert(key.clone(), pool);
                    BufferMode::Custom
                }
                Ok(None) => BufferMode::Abdicate,
                Err(err) => {
                    tracing::debug!(block = %self.name, port, domain, error = %err, "port rejects domain");
                    BufferMode::Error
                }
            }
        };
        self.modes.insert(key, mode);
        Ok(mode)
    }

    /// Pool for `port` towards `domain`: the block's own pool when it has
    /// one, otherwise a generic pool sized from the config.
    pub fn buffer_pool(&mut self, port: &str, domain: &str, is_input: bool) -> Result<BufferPool, PortError> {
        let key = (is_input, port.to_string(), domain.to_string());
        let mut pool = match self.pools.remove(&key) {
            Some(pool) => pool,
            None => {
                let answer = if is_input {
                    self.input(port)?;
                    self.block.input_buffer_pool(port, domain)
                } else {
                    self.output(port)?;
                    self.block.output_buffer_pool(port, domain)
                };
                match answer {
                    Ok(Some(pool)) => pool,
                    _ => BufferPool::make("generic")?,
                }
            }
        };
        if !pool.is_initialized() {
            pool.init(self.config.pool)?;
        }
        Ok(pool)
    }

    /// Install `pool` as the production pool of an output.
    pub fn install_pool(&mut self, port: &str, mut pool: BufferPool) -> Result<(), PortError> {
        let wake = self.wake.clone();
        pool.set_return_notifier(Some(Arc::new(move || wake.store(true, Ordering::Release))));
        self.output_mut(port)?.set_pool(Some(pool));
        Ok(())
    }

    /// Give every stream output without a pool a generic one.
    pub fn ensure_output_pools(&mut self) -> Result<(), PortError> {
        let missing: Vec<(String, String)> = self
            .outputs
            .iter()
            .filter(|p| !p.is_signal() && p.pool().is_none())
            .map(|p| (p.name().to_string(), p.domain().to_string()))
            .collect();
        for (name, domain) in missing {
            let pool = self.buffer_pool(&name, &domain, false)?;
            self.install_pool(&name, pool)?;
        }
        Ok(())
    }

    /// True once since the last call if a buffer, label, message or
    /// returned slot arrived.
    pub fn take_wake(&self) -> bool {
        self.wake.swap(false, Ordering::AcqRel)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Call the block's activate hook.
    pub fn activate(&mut self) -> Result<(), crate::block::BlockError> {
        if self.active {
            return Ok(());
        }
        self.block.activate()?;
        self.active = true;
        Ok(())
    }

    /// Call the block's deactivate hook.
    pub fn deactivate(&mut self) -> Result<(), crate::block::BlockError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.block.deactivate()
    }

    /// Run one pass. Returns whether the block's work was called.
    pub fn work_pass(&mut self) -> bool {
        self.task_calls += 1;
        let Some(info) = self.pre_work() else {
            return false;
        };

        self.work_calls += 1;
        let mut ctx = WorkContext {
            inputs: &mut self.inputs,
            outputs: &mut self.outputs,
            info,
        };
        let block = &mut self.block;
        match catch_unwind(AssertUnwindSafe(|| block.work(&mut ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.work_errors += 1;
                tracing::error!(block = %self.name, error = %err, "work failed");
            }
            Err(_) => {
                self.work_errors += 1;
                tracing::error!(block = %self.name, "work panicked");
            }
        }

        self.post_work();
        true
    }

    fn pre_work(&mut self) -> Option<WorkInfo> {
        let mut info = WorkInfo {
            min_in_elements: UNBOUNDED,
            min_out_elements: UNBOUNDED,
            min_elements: UNBOUNDED,
            min_all_in_elements: UNBOUNDED,
            min_all_out_elements: UNBOUNDED,
            min_all_elements: UNBOUNDED,
        };

        for output in self.outputs.iter_mut().filter(|p| !p.is_signal()) {
            let elements = output.pre_work();
            if elements == 0 {
                return None;
            }
            if output.index().is_some() {
                info.min_out_elements = info.min_out_elements.min(elements);
            }
            info.min_all_out_elements = info.min_all_out_elements.min(elements);
        }

        let mut reserve_met = false;
        let mut has_message = false;
        let mut has_buffered = false;
        for input in self.inputs.iter_mut() {
            has_message |= input.has_message();
            if input.is_slot() {
                continue;
            }
            has_buffered = true;
            let elements = match input.pre_work() {
                Ok(elements) => elements,
                Err(err) => {
                    tracing::error!(block = %self.name, port = %input.alias(), error = %err, "input window failed");
                    0
                }
            };
            if elements != 0 && elements >= input.reserve() {
                reserve_met = true;
            }
            if input.index().is_some() {
                info.min_in_elements = info.min_in_elements.min(elements);
            }
            info.min_all_in_elements = info.min_all_in_elements.min(elements);
        }

        info.min_elements = info.min_in_elements.min(info.min_out_elements);
        info.min_all_elements = info.min_all_in_elements.min(info.min_all_out_elements);

        (reserve_met || has_message || !has_buffered).then_some(info)
    }

    fn post_work(&mut self) {
        for i in 0..self.inputs.len() {
            let labels = self.inputs[i].take_consumed_labels();
            if !labels.is_empty() {
                if let Err(err) = self.block.propagate_labels(&self.inputs[i], &labels, &mut self.outputs) {
                    tracing::error!(
                        block = %self.name,
                        port = %self.inputs[i].alias(),
                        error = %err,
                        "label propagation failed"
                    );
                }
            }
            self.inputs[i].post_work();
        }
        for output in self.outputs.iter_mut() {
            if let Err(err) = output.post_work() {
                tracing::error!(block = %self.name, port = %output.alias(), error = %err, "output publish failed");
            }
            assert_invariant(
                POOL_OWNERSHIP,
                output.buffer().is_null() || output.buffer().is_empty(),
                "no production buffer held between passes",
                Some(output.name()),
            );
        }
    }

    /// Counters snapshot.
    pub fn stats(&self) -> WorkStats {
        WorkStats {
            block: self.name.clone(),
            task_calls: self.task_calls,
            work_calls: self.work_calls,
            work_errors: self.work_errors,
            inputs: self.inputs.iter().map(InputPort::stats).collect(),
            outputs: self.outputs.iter().map(OutputPort::stats).collect(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("active", &self.active)
            .finish()
    }
}
