//! Trait-based block definitions.

use crate::dtype::DType;
use crate::label::Label;
use crate::pool::BufferPool;
use crate::port::{InputPort, OutputPort};
use thiserror::Error;

/// Failure reported by a block's work, label or lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BlockError(pub String);

impl BlockError {
    /// Build from anything displayable.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

impl From<crate::buffer::BufferError> for BlockError {
    fn from(err: crate::buffer::BufferError) -> Self {
        Self::new(err)
    }
}

impl From<crate::convert::ConvertError> for BlockError {
    fn from(err: crate::convert::ConvertError) -> Self {
        Self::new(err)
    }
}

/// A port cannot work with memory of the requested domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("port {port} cannot use domain {domain:?}")]
pub struct PortDomainError {
    /// Port name.
    pub port: String,
    /// Requested domain.
    pub domain: String,
}

/// What a port carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Sample stream.
    Stream,
    /// Messages only: slot on inputs, signal on outputs.
    Message,
}

/// Declaration of one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDecl {
    /// Port name; decimal names are also indexed.
    pub name: String,
    /// Element descriptor.
    pub dtype: DType,
    /// Memory domain tag, empty for host memory.
    pub domain: String,
    /// Replace `domain` with the owning worker's unique domain at setup.
    pub unique_domain: bool,
    /// Stream or message port.
    pub kind: PortKind,
}

impl PortDecl {
    /// Stream port in host memory.
    pub fn stream(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            domain: String::new(),
            unique_domain: false,
            kind: PortKind::Stream,
        }
    }

    /// Message-only port.
    pub fn message(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: DType::empty(),
            domain: String::new(),
            unique_domain: false,
            kind: PortKind::Message,
        }
    }

    /// Builder-style domain setter.
    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self.unique_domain = false;
        self
    }

    /// Place the port in a domain no other block shares.
    ///
    /// Blocks that forward input buffers downstream declare their outputs
    /// this way, so peers with their own pools get a bridge instead of
    /// having foreign memory handed to them.
    pub fn in_unique_domain(mut self) -> Self {
        self.domain.clear();
        self.unique_domain = true;
        self
    }
}

/// Minimum element counts across a block's ports for the current pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkInfo {
    /// Minimum over indexed inputs.
    pub min_in_elements: usize,
    /// Minimum over indexed outputs.
    pub min_out_elements: usize,
    /// Minimum over indexed inputs and outputs.
    pub min_elements: usize,
    /// Minimum over all inputs.
    pub min_all_in_elements: usize,
    /// Minimum over all outputs.
    pub min_all_out_elements: usize,
    /// Minimum over all ports.
    pub min_all_elements: usize,
}

/// Ports and counts handed to [`Block::work`].
pub struct WorkContext<'a> {
    /// Input ports in declaration order.
    pub inputs: &'a mut [InputPort],
    /// Output ports in declaration order.
    pub outputs: &'a mut [OutputPort],
    /// Element minimums for this pass.
    pub info: WorkInfo,
}

impl WorkContext<'_> {
    /// Input by name.
    pub fn input(&mut self, name: &str) -> Option<&mut InputPort> {
        self.inputs.iter_mut().find(|p| p.name() == name)
    }

    /// Output by name.
    pub fn output(&mut self, name: &str) -> Option<&mut OutputPort> {
        self.outputs.iter_mut().find(|p| p.name() == name)
    }

    /// Shorthand for [`WorkInfo::min_elements`].
    pub fn min_elements(&self) -> usize {
        self.info.min_elements
    }
}

/// Implement this for your processing blocks.
pub trait Block: Send + 'static {
    /// Inputs the block exposes.
    fn input_ports(&self) -> Vec<PortDecl>;

    /// Outputs the block exposes.
    fn output_ports(&self) -> Vec<PortDecl>;

    /// Process what the ports offer.
    fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<(), BlockError>;

    /// Handle labels that fell inside the consumed range of `input`.
    ///
    /// The default forwards each label to every output, rescaled from the
    /// input's element size to the output's.
    fn propagate_labels(
        &mut self,
        input: &InputPort,
        labels: &[Label],
        outputs: &mut [OutputPort],
    ) -> Result<(), BlockError> {
        let in_size = input.dtype().size().max(1) as u64;
        for output in outputs.iter_mut() {
            let out_size = output.dtype().size().max(1) as u64;
            for label in labels {
                output.post_label(label.to_adjusted(in_size, out_size));
            }
        }
        Ok(())
    }

    /// Pool this input wants upstream to write into, for the given upstream domain.
    ///
    /// `Ok(None)` leaves the choice to the other side.
    fn input_buffer_pool(
        &mut self,
        _port: &str,
        _domain: &str,
    ) -> Result<Option<BufferPool>, PortDomainError> {
        Ok(None)
    }

    /// Pool this output produces into, for the given downstream domain.
    fn output_buffer_pool(
        &mut self,
        _port: &str,
        _domain: &str,
    ) -> Result<Option<BufferPool>, PortDomainError> {
        Ok(None)
    }

    /// Called when the topology goes live.
    fn activate(&mut self) -> Result<(), BlockError> {
        Ok(())
    }

    /// Called when the topology stops.
    fn deactivate(&mut self) -> Result<(), BlockError> {
        Ok(())
    }
}
