//! Typed windows over shared memory.
//!
//! A [`TypedChunk`] is a descriptor, an offset and a length over a
//! [`SharedBuffer`]. When the memory came from a pool the chunk also holds
//! the slot's [`PooledBuffer`] handle, so the slot stays checked out for as
//! long as any chunk can still read it.
//!
//! Chunks merged by the input accumulator may run across several
//! consecutive pool slots. Each extra slot is kept as a span with the
//! offset where its bytes end; spans are released as the read position
//! moves past them.

use crate::buffer::{BufferError, SharedBuffer};
use crate::dtype::{DType, Element};
use crate::invariant_ppt::{assert_invariant, BUFFER_BOUNDS, CHUNK_SPAN_RELEASE};
use crate::pool::PooledBuffer;
use std::fmt;

#[derive(Clone)]
struct Span {
    slot: PooledBuffer,
    end: usize,
}

#[derive(Clone)]
struct Storage {
    buffer: SharedBuffer,
    managed: Option<PooledBuffer>,
    spans: Vec<Span>,
}

impl Storage {
    fn lower(&self) -> usize {
        self.buffer.offset()
    }

    fn main_end(&self) -> usize {
        self.buffer.offset() + self.buffer.len()
    }

    fn extent_end(&self) -> usize {
        self.spans.last().map_or(self.main_end(), |s| s.end)
    }

    fn holds(&self, slot: &PooledBuffer) -> bool {
        self.managed.as_ref().is_some_and(|m| m.same_slot(slot))
            || self.spans.iter().any(|s| s.slot.same_slot(slot))
    }

    fn contains(&self, start: usize, end: usize) -> bool {
        (start >= self.lower() && end <= self.extent_end()) || self.buffer.range_within(start, end)
    }
}

/// A typed window over shared memory.
#[derive(Clone, Default)]
pub struct TypedChunk {
    /// Element descriptor of the bytes in the window.
    pub dtype: DType,
    storage: Option<Storage>,
    offset: usize,
    length: usize,
}

impl TypedChunk {
    /// Chunk with no memory.
    pub fn null() -> Self {
        Self::default()
    }

    /// Freshly allocated chunk holding `elements` zeroed elements.
    pub fn new(dtype: DType, elements: usize) -> Result<Self, BufferError> {
        let num_bytes = elements
            .checked_mul(dtype.size())
            .ok_or_else(|| BufferError::Allocation {
                bytes: usize::MAX,
                reason: format!("{elements} elements of {dtype} overflow the address space"),
            })?;
        let mut chunk = Self::with_bytes(num_bytes)?;
        chunk.dtype = dtype;
        Ok(chunk)
    }

    /// Freshly allocated chunk of `num_bytes` zeroed bytes and no descriptor.
    pub fn with_bytes(num_bytes: usize) -> Result<Self, BufferError> {
        Ok(Self::from_shared(SharedBuffer::allocate(num_bytes, -1)?))
    }

    /// Chunk holding a copy of `data`.
    pub fn from_elements<T: Element>(data: &[T]) -> Result<Self, BufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut chunk = Self::with_bytes(bytes.len())?;
        chunk.get_mut().ok_or(BufferError::Shared)?.copy_from_slice(bytes);
        chunk.dtype = DType::of::<T>();
        Ok(chunk)
    }

    /// Chunk over a whole shared buffer.
    pub fn from_shared(buffer: SharedBuffer) -> Self {
        let offset = buffer.offset();
        let length = buffer.len();
        Self {
            dtype: DType::empty(),
            storage: Some(Storage {
                buffer,
                managed: None,
                spans: Vec::new(),
            }),
            offset,
            length,
        }
    }

    /// Chunk over a whole pool slot.
    pub fn from_pooled(slot: PooledBuffer) -> Self {
        let view = slot.buffer().clone();
        Self::from_pooled_view(slot, &view)
    }

    pub(crate) fn from_pooled_view(slot: PooledBuffer, view: &SharedBuffer) -> Self {
        Self {
            dtype: DType::empty(),
            storage: Some(Storage {
                buffer: slot.buffer().clone(),
                managed: Some(slot),
                spans: Vec::new(),
            }),
            offset: view.offset(),
            length: view.len(),
        }
    }

    /// True when the chunk has no memory.
    pub fn is_null(&self) -> bool {
        self.storage.is_none()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True for zero-length windows.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes per element, treating unsized descriptors as bytes.
    pub fn elem_bytes(&self) -> usize {
        self.dtype.size().max(1)
    }

    /// Number of whole elements in the window.
    pub fn elements(&self) -> usize {
        self.length / self.elem_bytes()
    }

    /// Resize the window to `elements` elements, bounded by the owning memory.
    pub fn set_elements(&mut self, elements: usize) {
        self.length = (elements * self.elem_bytes()).min(self.capacity());
    }

    /// Address of the first byte, or zero for a null chunk.
    pub fn address(&self) -> usize {
        match &self.storage {
            Some(s) => s.buffer.address() - s.buffer.offset() + self.offset,
            None => 0,
        }
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.address() + self.length
    }

    /// Address of the same bytes through the second mapping of a circular ring.
    pub fn alias(&self) -> Option<usize> {
        let storage = self.storage.as_ref()?;
        storage
            .buffer
            .is_circular()
            .then(|| self.address() + storage.buffer.capacity())
    }

    /// The owning buffer: the slot region for pooled memory.
    pub fn buffer(&self) -> Option<&SharedBuffer> {
        self.storage.as_ref().map(|s| &s.buffer)
    }

    /// Pool slot handle, when the memory came from a pool.
    pub fn managed(&self) -> Option<&PooledBuffer> {
        self.storage.as_ref()?.managed.as_ref()
    }

    /// True when the window lives in circular memory.
    pub fn is_circular(&self) -> bool {
        self.buffer().is_some_and(SharedBuffer::is_circular)
    }

    /// Number of holders of the underlying memory.
    pub fn use_count(&self) -> usize {
        match &self.storage {
            Some(Storage {
                managed: Some(slot),
                ..
            }) => slot.use_count(),
            Some(s) => s.buffer.use_count(),
            None => 0,
        }
    }

    /// Number of extra pool slots this window runs across.
    pub fn span_count(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.spans.len())
    }

    /// Bytes of the owning buffer in front of the window.
    pub(crate) fn headroom(&self) -> usize {
        self.storage
            .as_ref()
            .map_or(0, |s| self.offset.saturating_sub(s.lower()))
    }

    /// Bytes available from the window start to the end of the owning extent.
    pub fn capacity(&self) -> usize {
        self.storage
            .as_ref()
            .map_or(0, |s| s.extent_end().saturating_sub(self.offset))
    }

    /// Contents of the window.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            // SAFETY: every constructor and mutator keeps the window inside the mapping.
            Some(s) => unsafe { s.buffer.bytes_at(self.offset, self.length) },
            None => &[],
        }
    }

    /// Mutable contents of the window when no other view can reach its bytes.
    ///
    /// Returns `None` for pooled memory and for chunks with live clones or
    /// slices. Production buffers are written through
    /// [`OutputPort::as_bytes_mut`](crate::port::OutputPort::as_bytes_mut).
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        match &self.storage {
            Some(s) if s.spans.is_empty() && s.managed.is_none() && s.buffer.unique() => {
                // SAFETY: this chunk holds the only reference to the allocation.
                Some(unsafe { s.buffer.bytes_at_mut(self.offset, self.length) })
            }
            Some(_) => None,
            None => Some(&mut []),
        }
    }

    /// Mutable contents of the window, without an exclusivity check.
    ///
    /// # Safety
    /// No clone, slice or other window over these bytes may be read or
    /// written while the returned borrow is live, on this thread or another.
    pub unsafe fn as_bytes_mut(&mut self) -> &mut [u8] {
        match &self.storage {
            Some(s) => s.buffer.bytes_at_mut(self.offset, self.length),
            None => &mut [],
        }
    }

    /// Window as a slice of `T`, or `None` when misaligned or not a whole number of `T`.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        bytemuck::try_cast_slice(self.as_bytes()).ok()
    }

    /// Mutable form of [`as_slice`](Self::as_slice).
    ///
    /// # Safety
    /// Same contract as [`as_bytes_mut`](Self::as_bytes_mut).
    pub unsafe fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.as_bytes_mut()).ok()
    }

    /// Copy of the window as `T` values, whatever the alignment.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        let size = std::mem::size_of::<T>();
        self.as_bytes()
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    /// Element `index` read as `T`.
    pub fn read<T: Element>(&self, index: usize) -> Option<T> {
        let size = std::mem::size_of::<T>();
        let start = index.checked_mul(size)?;
        let bytes = self.as_bytes().get(start..start.checked_add(size)?)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    /// Window of `length` bytes starting `offset` bytes into this one.
    ///
    /// The result may extend past this window but not past the owning memory.
    pub fn slice(&self, offset: usize, length: usize) -> Result<Self, BufferError> {
        let storage = self.storage.as_ref().ok_or(BufferError::Uninitialized)?;
        let start = self.offset.checked_add(offset);
        let end = start.and_then(|s| s.checked_add(length));
        match (start, end) {
            (Some(start), Some(end)) if storage.contains(start, end) => {
                assert_invariant(
                    BUFFER_BOUNDS,
                    end <= storage.buffer.mapped_len(),
                    "chunk window stays in the mapping",
                    Some("slice"),
                );
                Ok(Self {
                    dtype: self.dtype,
                    storage: Some(storage.clone()),
                    offset: start,
                    length,
                })
            }
            _ => Err(BufferError::OutOfBounds {
                offset: self.offset.saturating_add(offset),
                length,
                start: storage.lower(),
                end: storage.extent_end(),
            }),
        }
    }

    /// Shorten the window to at most `length` bytes.
    pub fn truncate(&mut self, length: usize) {
        self.length = self.length.min(length);
    }

    /// Skip `num_bytes` from the front of the window.
    ///
    /// Pool slots the window no longer reaches are released.
    pub fn advance(&mut self, num_bytes: usize) {
        self.consume_front(num_bytes);
    }

    /// Move the window start forward by `num_bytes`, releasing slots left behind.
    pub(crate) fn consume_front(&mut self, num_bytes: usize) {
        let num_bytes = num_bytes.min(self.length);
        self.offset += num_bytes;
        self.length -= num_bytes;
        let Some(storage) = self.storage.as_mut() else {
            return;
        };
        while !storage.spans.is_empty() && self.offset >= storage.main_end() {
            let start = storage.main_end();
            let span = storage.spans.remove(0);
            storage.buffer = storage.buffer.rebased(start, span.end - start);
            storage.managed = Some(span.slot);
        }
        let ring = storage.buffer.capacity();
        if storage.buffer.is_circular() && self.offset >= ring && storage.lower() >= ring {
            self.offset -= ring;
            let lower = storage.lower() - ring;
            storage.buffer = storage.buffer.rebased(lower, storage.buffer.len());
            for span in &mut storage.spans {
                span.end -= ring;
            }
        }
        assert_invariant(
            CHUNK_SPAN_RELEASE,
            self.offset >= storage.lower() && self.offset <= storage.extent_end(),
            "read position stays inside the retained slots",
            Some("consume_front"),
        );
    }

    /// Move the window start back into bytes still held by the owning buffer.
    pub(crate) fn unconsume(&mut self, num_bytes: usize) {
        let num_bytes = num_bytes.min(self.headroom());
        self.offset -= num_bytes;
        self.length += num_bytes;
    }

    /// Shift to apply to `next` so it continues this window, if it does.
    pub(crate) fn contiguous_shift(&self, next: &TypedChunk) -> Option<usize> {
        let (mine, theirs) = (self.storage.as_ref()?, next.storage.as_ref()?);
        if !mine.buffer.same_allocation(&theirs.buffer) {
            return None;
        }
        let end = self.offset + self.length;
        if next.offset == end {
            return Some(0);
        }
        let ring = mine.buffer.capacity();
        (mine.buffer.is_circular() && next.offset + ring == end).then_some(ring)
    }

    /// Extend this window over `next`, which starts `shift` bytes before this window's end.
    pub(crate) fn absorb(&mut self, next: TypedChunk, shift: usize) {
        let Some(theirs) = next.storage else {
            return;
        };
        let Some(mine) = self.storage.as_mut() else {
            return;
        };
        self.length += next.length;
        let mut tail = Vec::new();
        if let Some(slot) = theirs.managed.clone() {
            tail.push(Span {
                slot,
                end: theirs.main_end() + shift,
            });
        }
        tail.extend(theirs.spans.into_iter().map(|s| Span {
            slot: s.slot,
            end: s.end + shift,
        }));
        for span in tail {
            if mine.holds(&span.slot) {
                continue;
            }
            mine.spans.push(span);
        }
        let needed = next.offset + shift + next.length;
        if needed > mine.extent_end() {
            match mine.spans.last_mut() {
                Some(last) => last.end = needed,
                None => {
                    let lower = mine.lower();
                    mine.buffer = mine.buffer.rebased(lower, needed - lower);
                }
            }
        }
    }

    /// Append `other`'s bytes.
    ///
    /// A null chunk adopts `other` when its window lies inside its owning
    /// buffer; otherwise the bytes are copied into fresh memory.
    pub fn append(&mut self, other: &TypedChunk) -> Result<(), BufferError> {
        if other.is_null() {
            return Ok(());
        }
        if self.is_null() {
            let inside = other.storage.as_ref().is_some_and(|s| {
                s.spans.is_empty() && other.offset >= s.lower() && other.offset + other.length <= s.main_end()
            });
            if inside {
                *self = other.clone();
            } else {
                let mut copy = Self::with_bytes(other.length)?;
                copy.get_mut().ok_or(BufferError::Shared)?.copy_from_slice(other.as_bytes());
                copy.dtype = other.dtype;
                *self = copy;
            }
            return Ok(());
        }
        let mut joined = Self::with_bytes(self.length + other.length)?;
        let split = self.length;
        let bytes = joined.get_mut().ok_or(BufferError::Shared)?;
        bytes[..split].copy_from_slice(self.as_bytes());
        bytes[split..].copy_from_slice(other.as_bytes());
        joined.dtype = self.dtype;
        *self = joined;
        Ok(())
    }

    /// Release the memory and become null.
    pub fn clear(&mut self) {
        *self = Self::null();
    }
}

impl fmt::Debug for TypedChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedChunk")
            .field("dtype", &self.dtype.to_markup())
            .field("address", &format_args!("{:#x}", self.address()))
            .field("length", &self.length)
            .field("spans", &self.span_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, PoolArgs};

    #[test]
    fn null_chunk_is_inert() {
        let chunk = TypedChunk::null();
        assert!(chunk.is_null());
        assert_eq!(chunk.elements(), 0);
        assert!(chunk.as_bytes().is_empty());
        assert!(chunk.slice(0, 0).is_err());
    }

    #[test]
    fn elements_follow_dtype() {
        let chunk = TypedChunk::from_elements(&[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(chunk.len(), 12);
        assert_eq!(chunk.elements(), 3);
        assert_eq!(chunk.read::<f32>(2), Some(3.0));
        assert_eq!(chunk.read::<f32>(3), None);
        assert_eq!(chunk.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn slice_is_bounds_checked_against_owner() {
        let chunk = TypedChunk::with_bytes(32).unwrap();
        let head = chunk.slice(0, 8).unwrap();
        let grown = head.slice(4, 20).unwrap();
        assert_eq!(grown.address(), chunk.address() + 4);
        assert!(matches!(
            head.slice(30, 4),
            Err(BufferError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn append_to_null_adopts_and_otherwise_copies() {
        let a = TypedChunk::from_elements(&[1u8, 2, 3]).unwrap();
        let mut joined = TypedChunk::null();
        joined.append(&a).unwrap();
        assert_eq!(joined.address(), a.address());
        joined.append(&a).unwrap();
        assert_ne!(joined.address(), a.address());
        assert_eq!(joined.as_bytes(), &[1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn writes_need_exclusive_bytes() {
        let mut a = TypedChunk::from_elements(&[1u8, 2, 3, 4]).unwrap();
        a.get_mut().unwrap()[0] = 7;
        let b = a.clone();
        assert!(a.get_mut().is_none());
        assert_eq!(b.as_bytes(), &[7, 2, 3, 4]);
        drop(b);
        let tail = a.slice(2, 2).unwrap();
        assert!(a.get_mut().is_none());
        drop(tail);
        assert!(a.get_mut().is_some());
        assert!(TypedChunk::null().get_mut().unwrap().is_empty());
    }

    #[test]
    fn pooled_chunks_are_not_writable_through_the_chunk() {
        let mut pool = BufferPool::make_with(
            "generic",
            PoolArgs {
                num_buffers: 1,
                buffer_size: 16,
                node_affinity: -1,
            },
        )
        .unwrap();
        let mut front = pool.front();
        assert!(front.get_mut().is_none());
    }

    #[test]
    fn advance_skips_leading_bytes() {
        let mut chunk = TypedChunk::from_elements(&[1u16, 2, 3]).unwrap();
        let start = chunk.address();
        chunk.advance(2);
        assert_eq!(chunk.address(), start + 2);
        assert_eq!(chunk.to_vec::<u16>(), vec![2, 3]);
        chunk.advance(100);
        assert!(chunk.is_empty());
    }

    #[test]
    fn oversized_new_is_an_allocation_error() {
        let huge = TypedChunk::new(DType::of::<u64>(), usize::MAX / 4);
        assert!(matches!(huge, Err(BufferError::Allocation { bytes: usize::MAX, .. })));
    }

    #[test]
    fn chunks_keep_their_slot_alive() {
        let mut pool = BufferPool::make_with(
            "generic",
            PoolArgs {
                num_buffers: 1,
                buffer_size: 16,
                node_affinity: -1,
            },
        )
        .unwrap();
        let chunk = pool.front();
        assert_eq!(chunk.use_count(), 2);
        pool.pop(16).unwrap();
        assert_eq!(chunk.use_count(), 1);
        let copies = vec![chunk.clone(), chunk.clone(), chunk.slice(4, 4).unwrap()];
        drop(chunk);
        assert!(pool.is_empty());
        drop(copies);
        assert!(!pool.is_empty());
    }

    #[test]
    fn absorb_tracks_spans_and_releases_them() {
        let mut pool = BufferPool::make_with(
            "generic",
            PoolArgs {
                num_buffers: 2,
                buffer_size: 16,
                node_affinity: -1,
            },
        )
        .unwrap();
        let mut first = pool.front();
        pool.pop(16).unwrap();
        let second = pool.front();
        pool.pop(16).unwrap();
        let Some(shift) = first.contiguous_shift(&second) else {
            // slots are carved from one slab, so they are adjacent
            panic!("adjacent slots should merge");
        };
        first.absorb(second, shift);
        assert_eq!(first.len(), 32);
        assert_eq!(first.span_count(), 1);

        first.consume_front(16);
        assert_eq!(first.span_count(), 0);
        assert!(!pool.is_empty(), "first slot returns once consumed");
        first.consume_front(16);
        drop(first);
        assert!(!pool.is_empty());
    }
}
