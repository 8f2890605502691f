//! Input-side buffer accumulation.
//!
//! Upstream chunks arrive one by one. The accumulator keeps them in order,
//! merges chunks that continue each other in memory into one window, and
//! copies into a contiguous buffer when a consumer needs more bytes than the
//! front window holds.

use crate::chunk::TypedChunk;
use crate::invariant_ppt::{assert_invariant, ACCUMULATOR_CONSERVATION};
use std::collections::VecDeque;

/// Ordered queue of input chunks.
#[derive(Debug, Default)]
pub struct Accumulator {
    queue: VecDeque<TypedChunk>,
    bytes_available: usize,
    in_pool_buffer: bool,
    split_behind: bool,
}

impl Accumulator {
    /// Empty accumulator with room for `capacity` chunks before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// True when no bytes are queued.
    pub fn is_empty(&self) -> bool {
        self.bytes_available == 0
    }

    /// Total queued bytes.
    pub fn total_bytes(&self) -> usize {
        self.bytes_available
    }

    /// Number of distinct chunks in the queue.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Number of distinct pool slots referenced by queued chunks.
    pub fn unique_buffer_count(&self) -> usize {
        let mut seen: Vec<&crate::pool::PooledBuffer> = Vec::new();
        for slot in self.queue.iter().filter_map(TypedChunk::managed) {
            if !seen.iter().any(|s| s.same_slot(slot)) {
                seen.push(slot);
            }
        }
        seen.len()
    }

    /// Drop every queued chunk.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.bytes_available = 0;
        self.in_pool_buffer = false;
        self.split_behind = false;
    }

    /// Queue a chunk, merging it into the last one when contiguous.
    pub fn push(&mut self, chunk: TypedChunk) {
        if chunk.is_null() || chunk.is_empty() {
            return;
        }
        self.bytes_available += chunk.len();
        if self.queue.front().is_some_and(TypedChunk::is_empty) {
            self.queue.pop_front();
        }
        if let Some(back) = self.queue.back_mut() {
            if let Some(shift) = back.contiguous_shift(&chunk) {
                back.absorb(chunk, shift);
                self.check_conservation("push");
                return;
            }
        }
        self.queue.push_back(chunk);
        self.check_conservation("push");
    }

    /// The front window, or a null chunk when nothing is queued.
    pub fn front(&self) -> TypedChunk {
        self.queue.front().cloned().unwrap_or_default()
    }

    /// Remove `num_bytes` from the front window.
    ///
    /// `num_bytes` must not exceed the front window; callers check against
    /// [`total_bytes`](Self::total_bytes) first.
    pub fn pop(&mut self, num_bytes: usize) {
        let Some(front) = self.queue.front_mut() else {
            return;
        };
        let num_bytes = num_bytes.min(front.len());
        self.bytes_available -= num_bytes;
        front.consume_front(num_bytes);
        let remaining = front.len();

        // Bytes left in a copied front are also the tail of the chunk it was
        // split from, so step that chunk back instead of keeping the copy.
        if self.in_pool_buffer && self.split_behind && self.queue.len() > 1 {
            if remaining <= self.queue[1].headroom() {
                self.queue[1].unconsume(remaining);
                self.queue.pop_front();
                self.in_pool_buffer = false;
                self.split_behind = false;
            }
        } else if remaining == 0 {
            self.queue.pop_front();
            self.in_pool_buffer = false;
            self.split_behind = false;
        }
        self.check_conservation("pop");
    }

    /// Make the front window hold at least `num_bytes`, copying when needed.
    ///
    /// When fewer bytes are queued the front holds all of them.
    pub fn require(&mut self, num_bytes: usize) -> Result<(), crate::buffer::BufferError> {
        let Some(front) = self.queue.front() else {
            return Ok(());
        };
        if front.len() >= num_bytes || self.bytes_available == front.len() {
            return Ok(());
        }
        let dtype = front.dtype;
        let mut joined = TypedChunk::with_bytes(num_bytes)?;
        joined.dtype = dtype;
        let mut copied = 0;
        let mut split = false;
        while copied < num_bytes {
            let Some(next) = self.queue.front_mut() else {
                break;
            };
            let take = next.len().min(num_bytes - copied);
            let dst = joined.get_mut().ok_or(crate::buffer::BufferError::Shared)?;
            dst[copied..copied + take].copy_from_slice(&next.as_bytes()[..take]);
            copied += take;
            if take == next.len() {
                self.queue.pop_front();
            } else {
                next.consume_front(take);
                split = true;
            }
        }
        joined.truncate(copied);
        self.queue.push_front(joined);
        self.in_pool_buffer = true;
        self.split_behind = split;
        self.check_conservation("require");
        Ok(())
    }

    fn check_conservation(&self, context: &str) {
        let queued: usize = self.queue.iter().map(TypedChunk::len).sum();
        assert_invariant(
            ACCUMULATOR_CONSERVATION,
            queued == self.bytes_available,
            "queued bytes equal pushed minus popped",
            Some(context),
        );
    }
}
