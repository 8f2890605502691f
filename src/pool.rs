//! Buffer pools: fixed sets of reusable slots handed to producers.
//!
//! A pool owns `num_buffers` slots of `buffer_size` bytes. The owning worker
//! reads the head slot through [`BufferPool::front`], writes into it and
//! removes the written bytes with [`BufferPool::pop`]. Every chunk built
//! from a slot holds a [`PooledBuffer`] handle; when the last handle drops
//! the slot index travels back through a lock-free return queue and the
//! owner folds it into the ready set on its next call.
//!
//! Three strategies exist:
//!
//! * `"generic"`: one heap slab cut into equal slots, recycled FIFO.
//! * `"circular"`: one double-mapped ring; slots are windows that move
//!   around the ring and are released strictly in index order.
//! * device mapped: a generic layout whose memory and pop hooks come from a
//!   [`DmaDriver`].

use crate::buffer::{BufferError, SharedBuffer};
use crate::chunk::TypedChunk;
use crate::invariant_ppt::{assert_invariant, POOL_OWNERSHIP, POOL_SLOT_ORDER};
use crossbeam_queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Sizing and placement of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolArgs {
    /// Number of slots.
    pub num_buffers: usize,
    /// Bytes per slot.
    pub buffer_size: usize,
    /// Preferred NUMA node, or -1 for none. Advisory.
    pub node_affinity: i64,
}

impl Default for PoolArgs {
    fn default() -> Self {
        Self {
            num_buffers: 4,
            buffer_size: 8192,
            node_affinity: -1,
        }
    }
}

/// Replacement allocator for a pool's backing memory.
///
/// Receives the pool arguments and returns one buffer covering every slot.
pub type AllocateFn = Arc<dyn Fn(&PoolArgs) -> Result<SharedBuffer, BufferError> + Send + Sync>;

/// Callback run after a slot has been queued for return.
pub type ReturnNotifier = Arc<dyn Fn() + Send + Sync>;

/// Transfer direction of a device-mapped pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Host writes, device reads: popped bytes are handed to the device.
    Write,
    /// Device writes, host reads: the device fills slots before they are handed out.
    Read,
}

/// Hooks a device driver supplies for a device-mapped pool.
pub trait DmaDriver: Send + Sync {
    /// Allocate device-visible memory for every slot.
    fn allocate(&self, args: &PoolArgs) -> Result<SharedBuffer, BufferError>;
    /// Queue `region` for transfer to the device without blocking.
    fn enqueue_write(&self, region: &SharedBuffer) -> Result<(), BufferError>;
    /// Block until the device has filled `region`.
    fn blocking_read(&self, region: &SharedBuffer) -> Result<(), BufferError>;
}

/// Driver and direction of a device-mapped pool.
#[derive(Clone)]
pub struct DeviceConfig {
    /// Driver hooks.
    pub driver: Arc<dyn DmaDriver>,
    /// Transfer direction.
    pub direction: DmaDirection,
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Slot management strategy.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum PoolStrategy {
    /// FIFO recycling over a heap slab.
    Generic,
    /// Ordered windows over a double-mapped ring.
    Circular,
    /// Generic layout with driver-supplied memory and pop hooks.
    DeviceMapped(DeviceConfig),
}

impl PoolStrategy {
    /// Registered name of the strategy.
    pub fn name(&self) -> &'static str {
        match self {
            PoolStrategy::Generic => "generic",
            PoolStrategy::Circular => "circular",
            PoolStrategy::DeviceMapped(_) => "device",
        }
    }
}

/// Queue that releases items in index order, whatever order they arrive in.
#[derive(Debug)]
pub(crate) struct OrderedQueue<T> {
    pending: Vec<Option<T>>,
    next_index: usize,
    ready: VecDeque<T>,
}

impl<T> OrderedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: (0..capacity).map(|_| None).collect(),
            next_index: 0,
            ready: VecDeque::with_capacity(capacity),
        }
    }

    /// Queue `item` at sequence position `index`.
    pub(crate) fn push(&mut self, item: T, index: usize) {
        let capacity = self.pending.len();
        if index >= capacity {
            tracing::error!(index, capacity, "ordered queue index out of range");
            return;
        }
        if index != self.next_index {
            self.pending[index] = Some(item);
            return;
        }
        self.ready.push_back(item);
        self.next_index = (self.next_index + 1) % capacity;
        while let Some(next) = self.pending[self.next_index].take() {
            self.ready.push_back(next);
            self.next_index = (self.next_index + 1) % capacity;
        }
    }

    pub(crate) fn front(&self) -> Option<&T> {
        self.ready.front()
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.ready.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.ready.len()
    }
}

struct ReturnInner {
    pool_id: u64,
    queue: SegQueue<usize>,
    notifier: spin::Mutex<Option<ReturnNotifier>>,
}

/// Thread-safe path for handing slots back to their pool.
///
/// Cloned into every [`PooledBuffer`]; also handed out by
/// [`BufferPool::return_channel`] for threads that never see the pool itself.
#[derive(Clone)]
pub struct ReturnChannel {
    inner: Arc<ReturnInner>,
}

impl ReturnChannel {
    fn new(pool_id: u64) -> Self {
        Self {
            inner: Arc::new(ReturnInner {
                pool_id,
                queue: SegQueue::new(),
                notifier: spin::Mutex::new(None),
            }),
        }
    }

    /// Identity of the pool this channel feeds.
    pub fn pool_id(&self) -> u64 {
        self.inner.pool_id
    }

    /// Release a handle from any thread.
    ///
    /// The slot returns to the pool once every other handle to it is gone.
    pub fn push_external(&self, buffer: PooledBuffer) -> Result<(), BufferError> {
        if buffer.pool_id() != self.inner.pool_id {
            return Err(BufferError::ForeignBuffer {
                pool: self.inner.pool_id,
                buffer_pool: buffer.pool_id(),
            });
        }
        drop(buffer);
        Ok(())
    }

    fn send(&self, slot: usize) {
        self.inner.queue.push(slot);
        let notifier = self.inner.notifier.lock().clone();
        if let Some(notify) = notifier {
            notify();
        }
    }

    fn drain(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::from_fn(move || self.inner.queue.pop())
    }

    fn set_notifier(&self, notifier: Option<ReturnNotifier>) {
        *self.inner.notifier.lock() = notifier;
    }
}

impl fmt::Debug for ReturnChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnChannel")
            .field("pool_id", &self.inner.pool_id)
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

struct Lease {
    slot: usize,
    region: SharedBuffer,
    channel: ReturnChannel,
    armed: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed {
            self.channel.send(self.slot);
        }
    }
}

/// Shared handle on a checked-out pool slot.
///
/// Cloning shares the slot; it goes back to the pool when the last clone drops.
#[derive(Clone)]
pub struct PooledBuffer {
    lease: Arc<Lease>,
}

impl PooledBuffer {
    /// Slot index inside the owning pool.
    pub fn slot(&self) -> usize {
        self.lease.slot
    }

    /// Memory of the slot as it was when checked out.
    pub fn buffer(&self) -> &SharedBuffer {
        &self.lease.region
    }

    /// Identity of the owning pool.
    pub fn pool_id(&self) -> u64 {
        self.lease.channel.pool_id()
    }

    /// Number of handles sharing the slot.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.lease)
    }

    /// True when both handles refer to the same checkout.
    pub fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.lease, &other.lease)
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("pool", &self.pool_id())
            .field("slot", &self.slot())
            .field("use_count", &self.use_count())
            .finish()
    }
}

/// Slot bookkeeping behind a [`BufferPool`].
trait PoolBackend: Send {
    fn init(&mut self, args: &PoolArgs, allocate: Option<&AllocateFn>) -> Result<(), BufferError>;
    fn is_empty(&self) -> bool;
    /// Head slot and the view of its unconsumed bytes.
    fn front(&self) -> Option<(usize, SharedBuffer)>;
    /// Remove bytes from the head. Returns true when the head slot left the ready set.
    fn pop(&mut self, num_bytes: usize) -> bool;
    fn push(&mut self, slot: usize);
    fn is_circular(&self) -> bool {
        false
    }
    /// Runs on the popped region before the pool state changes.
    fn before_pop(&self, _region: &SharedBuffer) -> Result<(), BufferError> {
        Ok(())
    }
}

#[derive(Default)]
struct GenericBackend {
    slots: Vec<SharedBuffer>,
    ready: VecDeque<usize>,
    bytes_popped: usize,
    buffer_size: usize,
}

impl GenericBackend {
    fn carve(&mut self, slab: SharedBuffer, args: &PoolArgs) -> Result<(), BufferError> {
        let needed = args.num_buffers.saturating_mul(args.buffer_size);
        if slab.len() < needed {
            return Err(BufferError::Allocation {
                bytes: needed,
                reason: format!("allocator returned {} bytes", slab.len()),
            });
        }
        self.buffer_size = args.buffer_size;
        self.slots = (0..args.num_buffers)
            .map(|i| slab.sub_range(i * args.buffer_size, args.buffer_size))
            .collect::<Result<_, _>>()?;
        self.ready = (0..args.num_buffers).collect();
        self.bytes_popped = 0;
        Ok(())
    }
}

impl PoolBackend for GenericBackend {
    fn init(&mut self, args: &PoolArgs, allocate: Option<&AllocateFn>) -> Result<(), BufferError> {
        let slab = match allocate {
            Some(allocate) => allocate(args)?,
            None => SharedBuffer::allocate(
                args.num_buffers.saturating_mul(args.buffer_size),
                args.node_affinity,
            )?,
        };
        self.carve(slab, args)
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    fn front(&self) -> Option<(usize, SharedBuffer)> {
        let slot = *self.ready.front()?;
        let region = &self.slots[slot];
        let view = region.rebased(
            region.offset() + self.bytes_popped,
            self.buffer_size - self.bytes_popped,
        );
        Some((slot, view))
    }

    fn pop(&mut self, num_bytes: usize) -> bool {
        self.bytes_popped += num_bytes;
        // Small pops shrink the head in place; the slot stays checked in.
        if self.bytes_popped * 2 < self.buffer_size {
            return false;
        }
        self.bytes_popped = 0;
        self.ready.pop_front();
        true
    }

    fn push(&mut self, slot: usize) {
        self.ready.push_back(slot);
    }
}

struct CircularBackend {
    ring: Option<SharedBuffer>,
    ready: OrderedQueue<usize>,
    front_offset: usize,
    bytes_to_pop: usize,
    buffer_size: usize,
}

impl Default for CircularBackend {
    fn default() -> Self {
        Self {
            ring: None,
            ready: OrderedQueue::new(1),
            front_offset: 0,
            bytes_to_pop: 0,
            buffer_size: 0,
        }
    }
}

impl PoolBackend for CircularBackend {
    fn init(&mut self, args: &PoolArgs, allocate: Option<&AllocateFn>) -> Result<(), BufferError> {
        let needed = args.num_buffers.saturating_mul(args.buffer_size);
        let ring = match allocate {
            Some(allocate) => allocate(args)?,
            None => SharedBuffer::allocate_circular(needed, args.node_affinity)?,
        };
        if !ring.is_circular() || ring.capacity() < needed {
            return Err(BufferError::Allocation {
                bytes: needed,
                reason: "allocator did not return a circular ring large enough".to_string(),
            });
        }
        self.buffer_size = args.buffer_size;
        self.front_offset = ring.offset();
        self.bytes_to_pop = 0;
        self.ready = OrderedQueue::new(args.num_buffers);
        for slot in 0..args.num_buffers {
            self.ready.push(slot, slot);
        }
        self.ring = Some(ring);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    fn front(&self) -> Option<(usize, SharedBuffer)> {
        let slot = *self.ready.front()?;
        let ring = self.ring.as_ref()?;
        let view = ring.rebased(
            self.front_offset + self.bytes_to_pop,
            self.buffer_size - self.bytes_to_pop,
        );
        Some((slot, view))
    }

    fn pop(&mut self, num_bytes: usize) -> bool {
        self.bytes_to_pop += num_bytes;
        if self.bytes_to_pop * 2 < self.buffer_size {
            return false;
        }
        self.ready.pop();
        self.front_offset += self.bytes_to_pop;
        self.bytes_to_pop = 0;
        if let Some(ring) = &self.ring {
            if self.front_offset >= ring.capacity() {
                self.front_offset -= ring.capacity();
            }
        }
        true
    }

    fn push(&mut self, slot: usize) {
        let before = self.ready.len();
        self.ready.push(slot, slot);
        assert_invariant(
            POOL_SLOT_ORDER,
            self.ready.len() >= before,
            "circular slots re-enter in index order",
            Some("circular push"),
        );
    }

    fn is_circular(&self) -> bool {
        true
    }
}

struct DeviceBackend {
    config: DeviceConfig,
    layout: GenericBackend,
}

impl PoolBackend for DeviceBackend {
    fn init(&mut self, args: &PoolArgs, allocate: Option<&AllocateFn>) -> Result<(), BufferError> {
        let slab = match allocate {
            Some(allocate) => allocate(args)?,
            None => self.config.driver.allocate(args)?,
        };
        self.layout.carve(slab, args)
    }

    fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    fn front(&self) -> Option<(usize, SharedBuffer)> {
        self.layout.front()
    }

    fn pop(&mut self, num_bytes: usize) -> bool {
        self.layout.pop(num_bytes)
    }

    fn push(&mut self, slot: usize) {
        self.layout.push(slot);
    }

    fn before_pop(&self, region: &SharedBuffer) -> Result<(), BufferError> {
        match self.config.direction {
            DmaDirection::Write => self.config.driver.enqueue_write(region),
            DmaDirection::Read => self.config.driver.blocking_read(region),
        }
    }
}

/// A set of reusable slots owned by one worker.
///
/// Only the owner calls [`front`](Self::front), [`pop`](Self::pop) and
/// [`push`](Self::push); other threads return slots by dropping their
/// [`PooledBuffer`] handles or through a [`ReturnChannel`].
pub struct BufferPool {
    id: u64,
    strategy: PoolStrategy,
    args: Option<PoolArgs>,
    allocate: Option<AllocateFn>,
    backend: Box<dyn PoolBackend>,
    channel: ReturnChannel,
    front: Option<PooledBuffer>,
}

impl BufferPool {
    /// Uninitialized pool for a named strategy, `"generic"` or `"circular"`.
    pub fn make(name: &str) -> Result<Self, BufferError> {
        let strategy = match name {
            "generic" => PoolStrategy::Generic,
            "circular" => PoolStrategy::Circular,
            other => return Err(BufferError::UnknownStrategy(other.to_string())),
        };
        Ok(Self::with_strategy(strategy))
    }

    /// Named pool, initialized with `args`.
    pub fn make_with(name: &str, args: PoolArgs) -> Result<Self, BufferError> {
        let mut pool = Self::make(name)?;
        pool.init(args)?;
        Ok(pool)
    }

    /// Named pool whose memory comes from `allocate`, initialized with `args`.
    pub fn make_with_allocator(
        name: &str,
        args: PoolArgs,
        allocate: AllocateFn,
    ) -> Result<Self, BufferError> {
        let mut pool = Self::make(name)?;
        pool.set_allocate_fn(allocate);
        pool.init(args)?;
        Ok(pool)
    }

    /// Uninitialized pool for any strategy, including device-mapped ones.
    pub fn with_strategy(strategy: PoolStrategy) -> Self {
        let backend: Box<dyn PoolBackend> = match &strategy {
            PoolStrategy::Generic => Box::<GenericBackend>::default(),
            PoolStrategy::Circular => Box::<CircularBackend>::default(),
            PoolStrategy::DeviceMapped(config) => Box::new(DeviceBackend {
                config: config.clone(),
                layout: GenericBackend::default(),
            }),
        };
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            strategy,
            args: None,
            allocate: None,
            backend,
            channel: ReturnChannel::new(id),
            front: None,
        }
    }

    /// Replace the allocator used by [`init`](Self::init).
    pub fn set_allocate_fn(&mut self, allocate: AllocateFn) {
        self.allocate = Some(allocate);
    }

    /// Allocate memory and mark every slot ready.
    pub fn init(&mut self, args: PoolArgs) -> Result<(), BufferError> {
        if self.args.is_some() {
            return Err(BufferError::AlreadyInitialized);
        }
        self.backend.init(&args, self.allocate.as_ref())?;
        self.args = Some(args);
        tracing::debug!(
            pool = self.id,
            strategy = self.strategy.name(),
            num_buffers = args.num_buffers,
            buffer_size = args.buffer_size,
            "buffer pool initialized"
        );
        self.refresh();
        Ok(())
    }

    /// True once [`init`](Self::init) succeeded.
    pub fn is_initialized(&self) -> bool {
        self.args.is_some()
    }

    /// Arguments given to [`init`](Self::init).
    pub fn args(&self) -> Option<&PoolArgs> {
        self.args.as_ref()
    }

    /// Process-unique identity of the pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Strategy in use.
    pub fn strategy(&self) -> &PoolStrategy {
        &self.strategy
    }

    /// True when slots are windows over a circular ring.
    pub fn is_circular(&self) -> bool {
        self.backend.is_circular()
    }

    /// Handle other threads may use to return slots.
    pub fn return_channel(&self) -> ReturnChannel {
        self.channel.clone()
    }

    /// Callback run on the returning thread after each slot return.
    pub fn set_return_notifier(&mut self, notifier: Option<ReturnNotifier>) {
        self.channel.set_notifier(notifier);
    }

    /// True when no slot is ready.
    pub fn is_empty(&mut self) -> bool {
        self.reclaim();
        self.backend.is_empty()
    }

    /// The head slot as a chunk, or a null chunk when the pool is empty.
    pub fn front(&mut self) -> TypedChunk {
        self.reclaim();
        match (&self.front, self.backend.front()) {
            (Some(lease), Some((_, view))) => TypedChunk::from_pooled_view(lease.clone(), &view),
            _ => TypedChunk::null(),
        }
    }

    /// Remove `num_bytes` from the head slot.
    ///
    /// Consuming less than half a slot shrinks the head in place; otherwise
    /// the head leaves the ready set and the next slot becomes the head.
    pub fn pop(&mut self, num_bytes: usize) -> Result<(), BufferError> {
        self.reclaim();
        let (_, view) = self.backend.front().ok_or(BufferError::Empty)?;
        if num_bytes > view.len() {
            return Err(BufferError::OutOfBounds {
                offset: view.offset(),
                length: num_bytes,
                start: view.offset(),
                end: view.offset() + view.len(),
            });
        }
        let region = view.rebased(view.offset(), num_bytes);
        self.backend.before_pop(&region)?;
        if self.backend.pop(num_bytes) {
            self.front = None;
        }
        self.refresh();
        Ok(())
    }

    /// Return a slot handle on the owning thread.
    ///
    /// A unique handle goes straight back to the ready set; a shared one is
    /// released and the slot returns when the other holders drop theirs.
    pub fn push(&mut self, buffer: PooledBuffer) -> Result<(), BufferError> {
        if buffer.pool_id() != self.id {
            return Err(BufferError::ForeignBuffer {
                pool: self.id,
                buffer_pool: buffer.pool_id(),
            });
        }
        if let Ok(mut lease) = Arc::try_unwrap(buffer.lease) {
            lease.armed = false;
            let slot = lease.slot;
            drop(lease);
            assert_invariant(
                POOL_OWNERSHIP,
                self.args.map_or(false, |args| slot < args.num_buffers),
                "returned slot belongs to this pool",
                Some("push"),
            );
            self.backend.push(slot);
            self.refresh();
        }
        Ok(())
    }

    /// Return a slot handle from a thread that does not own the pool.
    pub fn push_external(&self, buffer: PooledBuffer) -> Result<(), BufferError> {
        self.channel.push_external(buffer)
    }

    fn reclaim(&mut self) {
        let mut returned = false;
        for slot in self.channel.drain() {
            self.backend.push(slot);
            returned = true;
        }
        if returned {
            self.refresh();
        }
    }

    fn refresh(&mut self) {
        if self.front.is_some() {
            return;
        }
        if let Some((slot, region)) = self.backend.front() {
            self.front = Some(PooledBuffer {
                lease: Arc::new(Lease {
                    slot,
                    region,
                    channel: self.channel.clone(),
                    armed: true,
                }),
            });
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("strategy", &self.strategy.name())
            .field("args", &self.args)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> PoolArgs {
        PoolArgs {
            num_buffers: 4,
            buffer_size: 64,
            node_affinity: -1,
        }
    }

    #[test]
    fn ordered_queue_releases_in_sequence() {
        let mut q = OrderedQueue::new(4);
        q.push('c', 2);
        q.push('b', 1);
        assert!(q.is_empty());
        q.push('a', 0);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some('a'));
        assert_eq!(q.pop(), Some('b'));
        assert_eq!(q.pop(), Some('c'));
        q.push('d', 3);
        assert_eq!(q.front(), Some(&'d'));
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let err = BufferPool::make("quux").unwrap_err();
        assert_eq!(err, BufferError::UnknownStrategy("quux".into()));
    }

    #[test]
    fn double_init_is_rejected() {
        let mut pool = BufferPool::make_with("generic", small()).unwrap();
        assert_eq!(pool.init(small()), Err(BufferError::AlreadyInitialized));
    }

    #[test]
    fn small_pop_shrinks_head_in_place() {
        let mut pool = BufferPool::make_with("generic", small()).unwrap();
        let first = pool.front();
        assert_eq!(first.len(), 64);
        pool.pop(10).unwrap();
        let shrunk = pool.front();
        assert_eq!(shrunk.len(), 54);
        assert_eq!(shrunk.address(), first.address() + 10);
    }

    #[test]
    fn generic_slots_recycle_fifo() {
        let mut pool = BufferPool::make_with("generic", small()).unwrap();
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.front());
            pool.pop(64).unwrap();
        }
        assert!(pool.is_empty());
        assert!(pool.front().is_null());
        assert_eq!(pool.pop(1), Err(BufferError::Empty));

        let first = held[0].address();
        drop(held);
        assert!(!pool.is_empty());
        assert_eq!(pool.front().address(), first);
    }

    #[test]
    fn slot_returns_after_last_handle_drops() {
        let mut pool = BufferPool::make_with(
            "generic",
            PoolArgs {
                num_buffers: 1,
                ..small()
            },
        )
        .unwrap();
        let held = pool.front();
        pool.pop(64).unwrap();
        assert!(pool.is_empty());
        let sub = held.slice(8, 8).unwrap();
        drop(held);
        assert!(pool.is_empty());
        drop(sub);
        assert!(!pool.is_empty());
    }

    #[derive(Default)]
    struct Recorder {
        writes: std::sync::atomic::AtomicUsize,
        reads: std::sync::atomic::AtomicUsize,
        fail_reads: bool,
    }

    impl DmaDriver for Recorder {
        fn allocate(&self, args: &PoolArgs) -> Result<SharedBuffer, BufferError> {
            SharedBuffer::allocate(args.num_buffers * args.buffer_size, -1)
        }
        fn enqueue_write(&self, region: &SharedBuffer) -> Result<(), BufferError> {
            self.writes.fetch_add(region.len(), Ordering::SeqCst);
            Ok(())
        }
        fn blocking_read(&self, region: &SharedBuffer) -> Result<(), BufferError> {
            if self.fail_reads {
                return Err(BufferError::Device("transfer timed out".into()));
            }
            // SAFETY: the test holds no borrow of the popped bytes.
            unsafe { region.bytes_at_mut(region.offset(), region.len()) }.fill(0xAB);
            self.reads.fetch_add(region.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn device_pool(driver: Arc<Recorder>, direction: DmaDirection) -> BufferPool {
        let mut pool = BufferPool::with_strategy(PoolStrategy::DeviceMapped(DeviceConfig {
            driver,
            direction,
        }));
        pool.init(small()).unwrap();
        pool
    }

    #[test]
    fn device_hooks_run_on_pop() {
        let driver = Arc::new(Recorder::default());
        let mut pool = device_pool(driver.clone(), DmaDirection::Write);
        pool.pop(40).unwrap();
        assert_eq!(driver.writes.load(Ordering::SeqCst), 40);
        assert_eq!(driver.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn device_reads_fill_popped_bytes() {
        let driver = Arc::new(Recorder::default());
        let mut pool = device_pool(driver.clone(), DmaDirection::Read);
        let head = pool.front();
        assert!(head.as_bytes().iter().all(|&b| b == 0));
        pool.pop(40).unwrap();
        assert_eq!(driver.reads.load(Ordering::SeqCst), 40);
        assert_eq!(driver.writes.load(Ordering::SeqCst), 0);
        assert!(head.as_bytes()[..40].iter().all(|&b| b == 0xAB));
        assert!(head.as_bytes()[40..].iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_device_read_leaves_the_head_in_place() {
        let driver = Arc::new(Recorder {
            fail_reads: true,
            ..Recorder::default()
        });
        let mut pool = device_pool(driver, DmaDirection::Read);
        let head = pool.front();
        assert!(matches!(pool.pop(16), Err(BufferError::Device(_))));
        let again = pool.front();
        assert_eq!(again.address(), head.address());
        assert_eq!(again.len(), 64);
    }
}
