//! Block-facing stream endpoints.
//!
//! An [`InputPort`] pairs an accumulator of unconsumed bytes with the
//! labels and messages that arrived alongside them. Upstream workers reach
//! it through an [`InputHandle`], which only touches the spin-locked queues.
//! An [`OutputPort`] hands out production buffers from its pool and queues
//! labels, messages and buffers for delivery to its subscribers at the end
//! of each work pass.

use crate::accumulator::Accumulator;
use crate::buffer::BufferError;
use crate::chunk::TypedChunk;
use crate::dtype::{DType, Element};
use crate::invariant_ppt::{assert_invariant, PORT_DTYPE_MATCH, PORT_LABEL_ORDER};
use crate::label::{sort_labels, Label};
use crate::message::Message;
use crate::pool::BufferPool;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default limit of queued messages per input port.
pub const MAX_MESSAGE_QUEUE: usize = 1024;

/// Port lookup and port-level buffer failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("block {block:?} has no {direction} port {port:?}")]
    UnknownPort {
        block: String,
        port: String,
        direction: &'static str,
    },
    #[error("block {block:?} already has {direction} port {port:?}")]
    DuplicatePort {
        block: String,
        port: String,
        direction: &'static str,
    },
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

fn elem_bytes(dtype: DType) -> usize {
    dtype.size().max(1)
}

struct InputQueues {
    accumulator: Accumulator,
    /// Labels not yet visible to the block, indexed in bytes from the accumulator start.
    labels: VecDeque<Label>,
}

struct InputShared {
    name: String,
    dtype: DType,
    queues: spin::Mutex<InputQueues>,
    messages: spin::Mutex<VecDeque<Message>>,
    max_messages: usize,
    total_buffers: AtomicU64,
    wake: Arc<AtomicBool>,
}

impl InputShared {
    fn push_buffer_locked(&self, queues: &mut InputQueues, mut chunk: TypedChunk) {
        let accepted = chunk.dtype.is_empty()
            || self.dtype.is_empty()
            || chunk.dtype.size() == self.dtype.size();
        if !accepted {
            tracing::error!(
                port = %self.name,
                got = %chunk.dtype,
                expected = %self.dtype,
                "dropped input buffer with mismatched element size"
            );
            return;
        }
        if chunk.dtype.is_empty() {
            chunk.dtype = self.dtype;
        }
        assert_invariant(
            PORT_DTYPE_MATCH,
            chunk.dtype.is_empty() || self.dtype.is_empty() || chunk.dtype.size() == self.dtype.size(),
            "accepted buffers match the port element size",
            Some(&self.name),
        );
        queues.accumulator.push(chunk);
        self.total_buffers.fetch_add(1, Ordering::Relaxed);
    }
}

/// Thread-safe upstream side of an [`InputPort`].
#[derive(Clone)]
pub struct InputHandle {
    shared: Arc<InputShared>,
}

impl InputHandle {
    /// Name of the port.
    pub fn port_name(&self) -> &str {
        &self.shared.name
    }

    /// Element descriptor of the port.
    pub fn dtype(&self) -> DType {
        self.shared.dtype
    }

    /// True when both handles reach the same port.
    pub fn same_port(&self, other: &InputHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Queue a buffer. Buffers whose element size differs from the port's are dropped.
    pub fn push_buffer(&self, chunk: TypedChunk) {
        {
            let mut queues = self.shared.queues.lock();
            self.shared.push_buffer_locked(&mut queues, chunk);
        }
        self.wake();
    }

    /// Queue a label whose index counts elements from the first unconsumed element.
    pub fn push_label(&self, label: Label) {
        let size = elem_bytes(self.shared.dtype) as u64;
        self.shared.queues.lock().labels.push_back(label.to_adjusted(size, 1));
        self.wake();
    }

    /// Queue an asynchronous message.
    ///
    /// The queue grows without blocking; once it holds the maximum number of
    /// messages it is cleared and an overflow is logged.
    pub fn push_message(&self, message: Message) {
        {
            let mut queue = self.shared.messages.lock();
            if queue.len() >= self.shared.max_messages {
                queue.clear();
                tracing::error!(port = %self.shared.name, "detected input message overflow");
            } else if queue.len() == queue.capacity() {
                let grow = queue.capacity().max(1);
                queue.reserve(grow);
            }
            queue.push_back(message);
        }
        self.wake();
    }

    /// Deliver the labels and buffers one upstream pass produced.
    ///
    /// Label indices count bytes from the start of the first buffer.
    pub(crate) fn buffer_label_push(&self, labels: &[Label], buffers: &[TypedChunk]) {
        assert_invariant(
            PORT_LABEL_ORDER,
            labels.windows(2).all(|w| w[0].index <= w[1].index),
            "labels are delivered in index order",
            Some(&self.shared.name),
        );
        {
            let mut queues = self.shared.queues.lock();
            let offset = queues.accumulator.total_bytes() as u64;
            for label in labels {
                let mut label = label.clone();
                label.index += offset;
                queues.labels.push_back(label);
            }
            for chunk in buffers {
                self.shared.push_buffer_locked(&mut queues, chunk.clone());
            }
        }
        self.wake();
    }

    fn wake(&self) {
        self.shared.wake.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for InputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputHandle")
            .field("port", &self.shared.name)
            .finish()
    }
}

/// Counters of one port, as reported in work statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortStats {
    /// Port name.
    pub name: String,
    /// Elements consumed or produced.
    pub total_elements: u64,
    /// Buffers accepted or posted.
    pub total_buffers: u64,
    /// Labels consumed or posted.
    pub total_labels: u64,
    /// Messages popped or posted.
    pub total_messages: u64,
}

/// A block's stream input.
pub struct InputPort {
    shared: Arc<InputShared>,
    index: Option<usize>,
    alias: Option<String>,
    domain: String,
    is_slot: bool,
    buffer: TypedChunk,
    elements: usize,
    labels: Vec<Label>,
    total_elements: u64,
    total_labels: u64,
    total_messages: u64,
    pending_elements: usize,
    reserve_elements: usize,
    work_events: usize,
}

impl InputPort {
    /// Standalone stream input.
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self::with_options(name.into(), dtype, MAX_MESSAGE_QUEUE, 64, Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn with_options(
        name: String,
        dtype: DType,
        max_messages: usize,
        accumulator_capacity: usize,
        wake: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared: Arc::new(InputShared {
                name,
                dtype,
                queues: spin::Mutex::new(InputQueues {
                    accumulator: Accumulator::with_capacity(accumulator_capacity),
                    labels: VecDeque::new(),
                }),
                messages: spin::Mutex::new(VecDeque::with_capacity(8)),
                max_messages,
                total_buffers: AtomicU64::new(0),
                wake,
            }),
            index: None,
            alias: None,
            domain: String::new(),
            is_slot: false,
            buffer: TypedChunk::null(),
            elements: 0,
            labels: Vec::new(),
            total_elements: 0,
            total_labels: 0,
            total_messages: 0,
            pending_elements: 0,
            reserve_elements: 0,
            work_events: 0,
        }
    }

    pub(crate) fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    pub(crate) fn set_domain(&mut self, domain: impl Into<String>) {
        self.domain = domain.into();
    }

    pub(crate) fn set_slot(&mut self, is_slot: bool) {
        self.is_slot = is_slot;
    }

    /// Handle for upstream producers.
    pub fn handle(&self) -> InputHandle {
        InputHandle {
            shared: self.shared.clone(),
        }
    }

    /// Position among indexed inputs, `None` for named-only ports.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Display name: the alias when set, otherwise the name.
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.shared.name)
    }

    /// Set the display name.
    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = Some(alias.into());
    }

    /// Element descriptor.
    pub fn dtype(&self) -> DType {
        self.shared.dtype
    }

    /// Memory domain tag; empty for plain host memory.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True for message-only ports.
    pub fn is_slot(&self) -> bool {
        self.is_slot
    }

    /// Window of available input for the current pass.
    pub fn buffer(&self) -> &TypedChunk {
        &self.buffer
    }

    /// Elements available in [`buffer`](Self::buffer).
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Total elements consumed.
    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    /// Total buffers accepted.
    pub fn total_buffers(&self) -> u64 {
        self.shared.total_buffers.load(Ordering::Relaxed)
    }

    /// Total labels consumed or removed.
    pub fn total_labels(&self) -> u64 {
        self.total_labels
    }

    /// Total messages popped.
    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    /// Labels inside the visible window, indexed in elements.
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Drop a label the block has fully handled.
    pub fn remove_label(&mut self, label: &Label) {
        if let Some(pos) = self.labels.iter().position(|l| l == label) {
            self.labels.remove(pos);
            self.total_labels += 1;
            self.work_events += 1;
        }
    }

    /// Retire `elements` elements at the end of the pass.
    pub fn consume(&mut self, elements: usize) {
        self.pending_elements += elements;
    }

    /// Elements marked for retirement this pass.
    pub fn pending(&self) -> usize {
        self.pending_elements
    }

    /// True when a message is queued.
    pub fn has_message(&self) -> bool {
        !self.shared.messages.lock().is_empty()
    }

    /// Next queued message.
    pub fn pop_message(&mut self) -> Option<Message> {
        let message = self.shared.messages.lock().pop_front()?;
        self.total_messages += 1;
        self.work_events += 1;
        Some(message)
    }

    /// Do not run the block until `elements` elements are available.
    pub fn set_reserve(&mut self, elements: usize) {
        if elements > self.reserve_elements {
            self.work_events += 1;
        }
        self.reserve_elements = elements;
    }

    /// Current reserve.
    pub fn reserve(&self) -> usize {
        self.reserve_elements
    }

    /// Readiness changes counted during the current pass.
    pub fn work_events(&self) -> usize {
        self.work_events
    }

    /// Drop every queued buffer, label and message.
    pub fn clear(&mut self) {
        {
            let mut queues = self.shared.queues.lock();
            queues.accumulator.clear();
            queues.labels.clear();
        }
        self.shared.messages.lock().clear();
        self.labels.clear();
        self.buffer.clear();
        self.elements = 0;
    }

    /// Counters snapshot.
    pub fn stats(&self) -> PortStats {
        PortStats {
            name: self.name().to_string(),
            total_elements: self.total_elements,
            total_buffers: self.total_buffers(),
            total_labels: self.total_labels,
            total_messages: self.total_messages,
        }
    }

    /// Load the window for a pass. Returns the available element count.
    pub(crate) fn pre_work(&mut self) -> Result<usize, BufferError> {
        self.work_events = 0;
        self.pending_elements = 0;
        let size = elem_bytes(self.dtype());
        let require = self.reserve_elements.max(1) * size;
        let mut front = {
            let mut queues = self.shared.queues.lock();
            queues.accumulator.require(require)?;
            while let Some(label) = queues.labels.pop_front() {
                self.labels.push(label.to_adjusted(1, size as u64));
            }
            queues.accumulator.front()
        };
        if front.dtype.is_empty() {
            front.dtype = self.dtype();
        }
        self.elements = front.len() / size;
        self.buffer = front;
        Ok(self.elements)
    }

    /// Split off the labels inside the consumed range; shift the rest.
    pub(crate) fn take_consumed_labels(&mut self) -> Vec<Label> {
        let pending = self.pending_elements as u64;
        let (consumed, rest): (Vec<Label>, Vec<Label>) =
            self.labels.drain(..).partition(|l| l.index < pending);
        self.labels = rest;
        for label in &mut self.labels {
            label.index -= pending;
        }
        self.total_labels += consumed.len() as u64;
        consumed
    }

    /// Retire consumed bytes from the accumulator.
    pub(crate) fn post_work(&mut self) {
        let bytes = self.pending_elements * elem_bytes(self.dtype());
        self.buffer.clear();
        if bytes != 0 {
            let mut queues = self.shared.queues.lock();
            let available = queues.accumulator.total_bytes();
            if bytes > available {
                drop(queues);
                tracing::error!(
                    port = %self.alias(),
                    bytes,
                    available,
                    "overconsumed input"
                );
            } else {
                queues.accumulator.pop(bytes);
                for label in queues.labels.iter_mut() {
                    label.index = label.index.saturating_sub(bytes as u64);
                }
                drop(queues);
                self.work_events += 1;
            }
        }
        self.total_elements += self.pending_elements as u64;
        self.pending_elements = 0;
    }

    /// Drain everything queued as raw bytes, labels (in bytes) and messages.
    pub(crate) fn drain_all(&mut self) -> (Vec<u8>, Vec<Label>, Vec<Message>) {
        let mut bytes = Vec::new();
        let mut labels = Vec::new();
        {
            let mut queues = self.shared.queues.lock();
            labels.extend(queues.labels.drain(..));
            loop {
                let front = queues.accumulator.front();
                if front.is_null() || front.is_empty() {
                    break;
                }
                bytes.extend_from_slice(front.as_bytes());
                queues.accumulator.pop(front.len());
            }
        }
        let messages = self.shared.messages.lock().drain(..).collect();
        (bytes, labels, messages)
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("name", &self.name())
            .field("dtype", &self.dtype().to_markup())
            .field("elements", &self.elements)
            .field("reserve", &self.reserve_elements)
            .finish()
    }
}

/// A block's stream output.
pub struct OutputPort {
    name: String,
    index: Option<usize>,
    alias: Option<String>,
    domain: String,
    dtype: DType,
    is_signal: bool,
    pool: Option<BufferPool>,
    buffer: TypedChunk,
    buffer_from_pool: bool,
    front_bytes: usize,
    elements: usize,
    total_elements: u64,
    total_buffers: u64,
    total_labels: u64,
    total_messages: u64,
    pending_elements: usize,
    reserve_elements: usize,
    work_events: usize,
    posted_labels: Vec<Label>,
    posted_buffers: Vec<TypedChunk>,
    subscribers: Vec<InputHandle>,
}

impl OutputPort {
    /// Standalone stream output without a pool.
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            index: None,
            alias: None,
            domain: String::new(),
            dtype,
            is_signal: false,
            pool: None,
            buffer: TypedChunk::null(),
            buffer_from_pool: false,
            front_bytes: 0,
            elements: 0,
            total_elements: 0,
            total_buffers: 0,
            total_labels: 0,
            total_messages: 0,
            pending_elements: 0,
            reserve_elements: 0,
            work_events: 0,
            posted_labels: Vec::new(),
            posted_buffers: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    pub(crate) fn set_domain(&mut self, domain: impl Into<String>) {
        self.domain = domain.into();
    }

    pub(crate) fn set_signal(&mut self, is_signal: bool) {
        self.is_signal = is_signal;
    }

    /// Position among indexed outputs.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display name: the alias when set, otherwise the name.
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Set the display name.
    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = Some(alias.into());
    }

    /// Element descriptor.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Memory domain tag.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True for message-only ports.
    pub fn is_signal(&self) -> bool {
        self.is_signal
    }

    /// Production buffer for the current pass.
    pub(crate) fn buffer(&self) -> &TypedChunk {
        &self.buffer
    }

    /// Writable bytes of the production buffer for the current pass.
    ///
    /// Empty outside a pass. Bytes written here reach subscribers once
    /// they are produced.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the production buffer never leaves the port before
        // post_work, and the pool front it views is not handed out until popped.
        unsafe { self.buffer.as_bytes_mut() }
    }

    /// Production buffer as `T` elements, or `None` when misaligned.
    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.as_bytes_mut()).ok()
    }

    /// Elements of room in the production buffer.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Total elements produced.
    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    /// Total buffers posted.
    pub fn total_buffers(&self) -> u64 {
        self.total_buffers
    }

    /// Total labels posted.
    pub fn total_labels(&self) -> u64 {
        self.total_labels
    }

    /// Total messages posted.
    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    /// Readiness changes counted during the current pass.
    pub fn work_events(&self) -> usize {
        self.work_events
    }

    /// Mark `elements` elements of the production buffer as produced.
    pub fn produce(&mut self, elements: usize) {
        self.pending_elements += elements;
    }

    /// Elements marked as produced this pass.
    pub fn pending(&self) -> usize {
        self.pending_elements
    }

    /// Remove bytes from the front of the production buffer without producing them.
    ///
    /// The production buffer then starts at the pool's new front, so call
    /// this before writing what the pass produces.
    pub fn pop_buffer(&mut self, num_bytes: usize) -> Result<(), BufferError> {
        match self.pool.as_mut() {
            Some(pool) if self.buffer_from_pool => {
                pool.pop(num_bytes)?;
                self.load_front();
            }
            Some(pool) => pool.pop(num_bytes)?,
            None => {
                self.buffer.consume_front(num_bytes);
                self.front_bytes = self.buffer.len();
                self.elements = self.buffer.elements();
            }
        }
        self.work_events += 1;
        Ok(())
    }

    /// A buffer of `elements` elements, from the pool when its head is large enough.
    pub fn get_buffer(&mut self, elements: usize) -> Result<TypedChunk, BufferError> {
        let num_bytes = elements * elem_bytes(self.dtype);
        if let Some(pool) = self.pool.as_mut() {
            let mut front = pool.front();
            if !front.is_null() && front.len() >= num_bytes {
                front.dtype = self.dtype;
                front.truncate(num_bytes);
                pool.pop(num_bytes)?;
                if self.buffer_from_pool {
                    self.load_front();
                }
                return Ok(front);
            }
        }
        TypedChunk::new(self.dtype, elements)
    }

    /// Queue a label; its index counts elements from the start of this pass's output.
    pub fn post_label(&mut self, label: Label) {
        let size = elem_bytes(self.dtype) as u64;
        self.posted_labels.push(label.to_adjusted(size, 1));
        self.total_labels += 1;
        self.work_events += 1;
    }

    /// Send a message to every subscriber now.
    pub fn post_message(&mut self, message: impl Into<Message>) {
        let message = message.into();
        for subscriber in &self.subscribers {
            subscriber.push_message(message.clone());
        }
        self.total_messages += 1;
        self.work_events += 1;
    }

    /// Queue a buffer for zero-copy delivery downstream.
    pub fn post_buffer(&mut self, mut chunk: TypedChunk) {
        if chunk.dtype.is_empty() {
            chunk.dtype = self.dtype;
        }
        self.posted_buffers.push(chunk);
        self.total_buffers += 1;
        self.work_events += 1;
    }

    /// Keep at least `elements` elements of room in the production buffer.
    pub fn set_reserve(&mut self, elements: usize) {
        if elements > self.reserve_elements {
            self.work_events += 1;
        }
        self.reserve_elements = elements;
    }

    /// Current reserve.
    pub fn reserve(&self) -> usize {
        self.reserve_elements
    }

    /// Add a downstream input.
    pub fn subscribe(&mut self, input: InputHandle) {
        if !self.subscribers.iter().any(|s| s.same_port(&input)) {
            self.subscribers.push(input);
        }
    }

    /// Remove a downstream input.
    pub fn unsubscribe(&mut self, input: &InputHandle) {
        self.subscribers.retain(|s| !s.same_port(input));
    }

    /// Remove every downstream input.
    pub fn clear_subscribers(&mut self) {
        self.subscribers.clear();
    }

    /// Downstream inputs.
    pub fn subscribers(&self) -> &[InputHandle] {
        &self.subscribers
    }

    /// Install the pool production buffers come from.
    pub fn set_pool(&mut self, pool: Option<BufferPool>) {
        self.pool = pool;
    }

    /// Installed pool.
    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Mutable access to the installed pool.
    pub fn pool_mut(&mut self) -> Option<&mut BufferPool> {
        self.pool.as_mut()
    }

    /// Counters snapshot.
    pub fn stats(&self) -> PortStats {
        PortStats {
            name: self.name.clone(),
            total_elements: self.total_elements,
            total_buffers: self.total_buffers,
            total_labels: self.total_labels,
            total_messages: self.total_messages,
        }
    }

    /// Load the production buffer for a pass. Returns the element room.
    pub(crate) fn pre_work(&mut self) -> usize {
        self.work_events = 0;
        self.pending_elements = 0;
        self.load_front();
        self.elements
    }

    /// Point the production buffer at the pool front.
    fn load_front(&mut self) {
        let front = self
            .pool
            .as_mut()
            .map(BufferPool::front)
            .filter(|front| !front.is_null());
        match front {
            Some(front) => {
                self.buffer = front;
                self.buffer_from_pool = true;
            }
            None => {
                self.buffer.clear();
                self.buffer_from_pool = false;
            }
        }
        self.buffer.dtype = self.dtype;
        self.front_bytes = self.buffer.len();
        self.elements = self.buffer.elements();
    }

    /// Publish what the pass produced and posted.
    pub(crate) fn post_work(&mut self) -> Result<(), BufferError> {
        let size = elem_bytes(self.dtype);
        let pending_bytes = self.pending_elements * size;
        let circular = self.buffer.is_circular();
        if pending_bytes != 0 {
            let mut produced = std::mem::take(&mut self.buffer);
            if self.buffer_from_pool {
                if pending_bytes > self.front_bytes {
                    tracing::error!(
                        port = %self.alias(),
                        bytes = pending_bytes,
                        available = self.front_bytes,
                        "overproduced output"
                    );
                } else if let Some(pool) = self.pool.as_mut() {
                    let remainder = self.elements.saturating_sub(self.pending_elements);
                    if self.reserve_elements != 0 && !circular && remainder < self.reserve_elements {
                        pool.pop(self.front_bytes)?;
                    } else {
                        pool.pop(pending_bytes)?;
                    }
                }
            }
            produced.set_elements(self.pending_elements.min(self.elements));
            self.post_buffer(produced);
        } else if self.work_events != 0 && self.reserve_elements != 0 && !circular {
            if let Some(pool) = self.pool.as_mut() {
                let front = pool.front();
                if !front.is_empty() && front.len() < self.reserve_elements * size {
                    pool.pop(front.len())?;
                }
            }
        }
        self.buffer.clear();
        self.buffer_from_pool = false;
        self.front_bytes = 0;
        self.elements = 0;
        self.pending_elements = 0;

        sort_labels(&mut self.posted_labels);
        if !self.posted_labels.is_empty() || !self.posted_buffers.is_empty() {
            for subscriber in &self.subscribers {
                subscriber.buffer_label_push(&self.posted_labels, &self.posted_buffers);
            }
        }
        self.posted_labels.clear();
        for chunk in self.posted_buffers.drain(..) {
            self.total_elements += chunk.elements() as u64;
        }
        Ok(())
    }
}

impl std::fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("name", &self.name)
            .field("dtype", &self.dtype.to_markup())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolArgs;
    use serde_json::json;

    fn f32_port() -> InputPort {
        InputPort::new("in0", DType::of::<f32>())
    }

    #[test]
    fn pushed_buffers_become_the_window() {
        let mut port = f32_port();
        port.handle()
            .push_buffer(TypedChunk::from_elements(&[1.0f32, 2.0, 3.0]).unwrap());
        assert_eq!(port.pre_work().unwrap(), 3);
        assert_eq!(port.buffer().to_vec::<f32>(), vec![1.0, 2.0, 3.0]);
        port.consume(2);
        port.post_work();
        assert_eq!(port.total_elements(), 2);
        assert_eq!(port.total_buffers(), 1);
        assert_eq!(port.pre_work().unwrap(), 1);
    }

    #[test]
    fn untyped_buffers_take_the_port_type() {
        let mut port = f32_port();
        port.handle().push_buffer(TypedChunk::with_bytes(8).unwrap());
        port.pre_work().unwrap();
        assert_eq!(port.buffer().dtype, DType::of::<f32>());
        assert_eq!(port.elements(), 2);
    }

    #[test]
    fn label_indices_follow_consumption() {
        let mut port = f32_port();
        let handle = port.handle();
        handle.push_buffer(TypedChunk::from_elements(&[0.0f32; 8]).unwrap());
        handle.push_label(Label::new("a", json!(null), 1));
        handle.push_label(Label::new("b", json!(null), 5));
        port.pre_work().unwrap();
        let indices: Vec<_> = port.labels().iter().map(|l| l.index).collect();
        assert_eq!(indices, [1, 5]);

        port.consume(4);
        let consumed = port.take_consumed_labels();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].id, "a");
        port.post_work();
        assert_eq!(port.labels()[0].index, 1);
        assert_eq!(port.total_labels(), 1);
    }

    #[test]
    fn work_events_track_readiness_changes() {
        let mut port = f32_port();
        port.set_reserve(4);
        port.set_reserve(2);
        assert_eq!(port.work_events(), 1);
        port.handle().push_message(Message::Value(json!(1)));
        assert!(port.has_message());
        assert!(port.pop_message().is_some());
        assert_eq!(port.work_events(), 2);
        assert_eq!(port.total_messages(), 1);
    }

    #[test]
    fn output_posts_reach_subscribers() {
        let mut input = f32_port();
        let mut output = OutputPort::new("out0", DType::of::<f32>());
        output.set_pool(Some(
            BufferPool::make_with(
                "generic",
                PoolArgs {
                    num_buffers: 2,
                    buffer_size: 64,
                    node_affinity: -1,
                },
            )
            .unwrap(),
        ));
        output.subscribe(input.handle());
        assert_eq!(output.pre_work(), 16);
        output.as_mut_slice::<f32>().unwrap()[..3].copy_from_slice(&[1.0, 2.0, 3.0]);
        output.produce(3);
        output.post_label(Label::new("mark", json!("x"), 2));
        output.post_work().unwrap();
        assert_eq!(output.total_elements(), 3);

        input.pre_work().unwrap();
        assert_eq!(input.buffer().to_vec::<f32>(), vec![1.0, 2.0, 3.0]);
        assert_eq!(input.labels()[0].index, 2);
    }

    fn byte_output(num_buffers: usize, buffer_size: usize) -> (OutputPort, InputPort) {
        let input = InputPort::new("in0", DType::of::<u8>());
        let mut output = OutputPort::new("out0", DType::of::<u8>());
        output.set_pool(Some(
            BufferPool::make_with(
                "generic",
                PoolArgs {
                    num_buffers,
                    buffer_size,
                    node_affinity: -1,
                },
            )
            .unwrap(),
        ));
        output.subscribe(input.handle());
        (output, input)
    }

    #[test]
    fn production_writes_never_reach_published_bytes() {
        let (mut output, mut input) = byte_output(1, 64);
        output.pre_work();
        output.as_bytes_mut()[..3].copy_from_slice(&[1, 2, 3]);
        output.produce(3);
        output.post_work().unwrap();
        assert!(output.as_bytes_mut().is_empty());

        assert_eq!(output.pre_work(), 61);
        output.as_bytes_mut().fill(0xFF);
        output.post_work().unwrap();

        input.pre_work().unwrap();
        assert_eq!(input.buffer().as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn pop_then_produce_writes_from_the_new_front() {
        let (mut output, mut input) = byte_output(2, 64);
        assert_eq!(output.pre_work(), 64);
        let first = output.buffer().address();

        // a small pop shrinks the head slot in place
        output.pop_buffer(8).unwrap();
        assert_eq!(output.elements(), 56);
        assert_eq!(output.buffer().address(), first + 8);

        // a large pop retires the head slot
        output.pop_buffer(40).unwrap();
        assert_eq!(output.elements(), 64);
        assert_eq!(output.buffer().address(), first + 64);

        output.as_bytes_mut()[..50].copy_from_slice(&[7u8; 50]);
        output.produce(50);
        output.post_work().unwrap();
        assert_eq!(output.total_elements(), 50);

        input.pre_work().unwrap();
        assert_eq!(input.buffer().as_bytes(), &[7u8; 50][..]);
    }

    #[test]
    fn get_buffer_moves_the_production_buffer_past_it() {
        let (mut output, _input) = byte_output(1, 64);
        output.pre_work();
        let start = output.buffer().address();
        let leased = output.get_buffer(16).unwrap();
        assert_eq!(leased.address(), start);
        assert_eq!(output.buffer().address(), start + 16);
        assert_eq!(output.elements(), 48);
    }
}
