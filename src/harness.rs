//! Single-block test harness.
//!
//! Wraps one block in a [`Worker`], feeds its inputs through upstream
//! handles and captures each output in a private sink port, so a block
//! can be exercised without building a topology.

use crate::block::Block;
use crate::chunk::TypedChunk;
use crate::dtype::Element;
use crate::error::Result;
use crate::label::Label;
use crate::message::Message;
use crate::port::InputPort;
use crate::worker::Worker;

/// What one output produced since the last collect.
#[derive(Debug, Default)]
pub struct Captured {
    /// Raw output bytes in order.
    pub bytes: Vec<u8>,
    /// Labels, indexed in output elements.
    pub labels: Vec<Label>,
    /// Messages in posting order.
    pub messages: Vec<Message>,
}

impl Captured {
    /// Output bytes read as `T`.
    pub fn values<T: Element>(&self) -> Vec<T> {
        self.bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}

/// Drives one block pass by pass.
#[derive(Debug)]
pub struct BlockHarness {
    worker: Worker,
    sinks: Vec<InputPort>,
}

impl BlockHarness {
    /// Wrap and activate `block`.
    pub fn new(block: Box<dyn Block>) -> Result<Self> {
        let mut worker = Worker::new("harness", block)?;
        worker.ensure_output_pools()?;
        let mut sinks = Vec::with_capacity(worker.outputs().len());
        for output in worker.outputs_mut() {
            let sink = InputPort::new(output.name(), output.dtype());
            output.subscribe(sink.handle());
            sinks.push(sink);
        }
        worker.activate()?;
        Ok(Self { worker, sinks })
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn worker_mut(&mut self) -> &mut Worker {
        &mut self.worker
    }

    /// Queue elements on input `port`.
    pub fn feed<T: Element>(&mut self, port: &str, data: &[T]) -> Result<()> {
        let chunk = TypedChunk::from_elements(data)?;
        self.worker.input_handle(port)?.push_buffer(chunk);
        Ok(())
    }

    /// Queue a label on input `port`, indexed in elements.
    pub fn feed_label(&mut self, port: &str, label: Label) -> Result<()> {
        self.worker.input_handle(port)?.push_label(label);
        Ok(())
    }

    /// Queue a message on input `port`.
    pub fn feed_message(&mut self, port: &str, message: impl Into<Message>) -> Result<()> {
        self.worker.input_handle(port)?.push_message(message.into());
        Ok(())
    }

    /// Run passes until the block declines or `max_passes` is reached.
    /// Returns the number of passes that called work.
    pub fn run(&mut self, max_passes: usize) -> usize {
        let mut worked = 0;
        while worked < max_passes && self.worker.work_pass() {
            worked += 1;
        }
        worked
    }

    /// Take everything output `port` published so far.
    pub fn collect(&mut self, port: &str) -> Result<Captured> {
        let output = self.worker.output(port)?;
        let elem = output.dtype().size().max(1) as u64;
        let index = self
            .worker
            .outputs()
            .iter()
            .position(|p| p.name() == port)
            .unwrap_or_default();
        let (bytes, labels, messages) = self.sinks[index].drain_all();
        Ok(Captured {
            bytes,
            labels: labels.into_iter().map(|l| l.to_adjusted(1, elem)).collect(),
            messages,
        })
    }

    /// Deactivate the block.
    pub fn finish(mut self) -> Result<Worker> {
        self.worker.deactivate()?;
        Ok(self.worker)
    }
}
