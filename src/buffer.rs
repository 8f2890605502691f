//! Raw memory: reference-counted allocations and bounds-checked views.
//!
//! A [`SharedBuffer`] is an address and length over a [`MemoryContainer`].
//! Views share the container through an `Arc`; the allocation is released
//! when the last view is dropped.
//!
//! Circular containers map the same pages twice, back to back, so that the
//! bytes at `base + i` and `base + len + i` are the same memory. A window may
//! then run past the end of the ring without copying.

use crate::invariant_ppt::{assert_invariant, BUFFER_ALIAS_IDENTITY, BUFFER_BOUNDS};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;

/// Alignment of generic heap allocations.
pub const BUFFER_ALIGNMENT: usize = 64;

/// Errors raised by buffers and pools.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The platform allocator or mapper rejected the request.
    #[error("allocation of {bytes} bytes failed: {reason}")]
    Allocation {
        /// Requested size.
        bytes: usize,
        /// Platform detail.
        reason: String,
    },
    /// A view request falls outside its parent.
    #[error("range [{offset}, {offset}+{length}) outside parent [{start}, {end})")]
    OutOfBounds {
        /// Requested start.
        offset: usize,
        /// Requested length.
        length: usize,
        /// Parent start.
        start: usize,
        /// Parent end.
        end: usize,
    },
    /// A buffer was returned to a pool that does not own it.
    #[error("buffer from pool {buffer_pool} returned to pool {pool}")]
    ForeignBuffer {
        /// Pool receiving the buffer.
        pool: u64,
        /// Pool owning the buffer.
        buffer_pool: u64,
    },
    /// No pool strategy has this name.
    #[error("unknown buffer pool strategy {0:?}")]
    UnknownStrategy(String),
    /// The pool has not been initialized.
    #[error("buffer pool used before init")]
    Uninitialized,
    /// The pool was initialized twice.
    #[error("buffer pool already initialized")]
    AlreadyInitialized,
    /// Pop or front on a pool with no ready buffers.
    #[error("buffer pool is empty")]
    Empty,
    /// Write access to bytes another view can still read.
    #[error("chunk bytes are shared with another view")]
    Shared,
    /// A device driver hook failed.
    #[error("device driver: {0}")]
    Device(String),
}

/// Page size of the running system.
#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf is safe to call and _SC_PAGESIZE always succeeds on Unix systems.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Page size of the running system.
#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

/// Owner of a block of memory.
///
/// Implementations release their memory in `Drop`. Device drivers implement
/// this for memory they map themselves.
pub trait MemoryContainer: Send + Sync {
    /// First byte of the mapping.
    fn base(&self) -> NonNull<u8>;

    /// Length of the logical allocation in bytes.
    fn len(&self) -> usize;

    /// True when `len() == 0`.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the memory is also mapped at `base + len`.
    fn is_circular(&self) -> bool {
        false
    }
}

/// 64-byte aligned heap memory.
struct HeapContainer {
    ptr: NonNull<u8>,
    layout: Option<Layout>,
}

// SAFETY: the container exclusively owns its allocation; access is coordinated by the views.
unsafe impl Send for HeapContainer {}
// SAFETY: see above.
unsafe impl Sync for HeapContainer {}

impl HeapContainer {
    fn new(num_bytes: usize) -> Result<Self, BufferError> {
        if num_bytes == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                layout: None,
            });
        }
        let layout = Layout::from_size_align(num_bytes, BUFFER_ALIGNMENT).map_err(|e| {
            BufferError::Allocation {
                bytes: num_bytes,
                reason: e.to_string(),
            }
        })?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| BufferError::Allocation {
            bytes: num_bytes,
            reason: "allocator returned null".to_string(),
        })?;
        Ok(Self {
            ptr,
            layout: Some(layout),
        })
    }
}

impl MemoryContainer for HeapContainer {
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.layout.map(|l| l.size()).unwrap_or(0)
    }
}

impl Drop for HeapContainer {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: ptr was allocated with this layout.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// Ring memory mapped twice in a row.
#[cfg(unix)]
struct CircularContainer {
    ptr: NonNull<u8>,
    len: usize,
}

#[cfg(unix)]
// SAFETY: the container exclusively owns its mapping.
unsafe impl Send for CircularContainer {}
#[cfg(unix)]
// SAFETY: see above.
unsafe impl Sync for CircularContainer {}

#[cfg(unix)]
impl CircularContainer {
    fn new(num_bytes: usize) -> Result<Self, BufferError> {
        let page = page_size();
        let len = num_bytes.max(1).div_ceil(page) * page;
        let fail = |what: &str| BufferError::Allocation {
            bytes: len,
            reason: format!("{}: {}", what, std::io::Error::last_os_error()),
        };

        let fd = open_backing_fd().map_err(|e| BufferError::Allocation {
            bytes: len,
            reason: format!("backing file: {}", e),
        })?;

        // SAFETY: fd is an owned descriptor; every mapping below is checked and the
        // descriptor is closed on all paths.
        unsafe {
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                let err = fail("ftruncate");
                libc::close(fd);
                return Err(err);
            }

            // reserve 2x the virtual space, then map the file into both halves
            let reserved = libc::mmap(
                std::ptr::null_mut(),
                2 * len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if reserved == libc::MAP_FAILED {
                let err = fail("reserve");
                libc::close(fd);
                return Err(err);
            }

            for half in 0..2 {
                let addr = (reserved as *mut u8).add(half * len) as *mut libc::c_void;
                let mapped = libc::mmap(
                    addr,
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                );
                if mapped != addr {
                    let err = fail("map");
                    libc::munmap(reserved, 2 * len);
                    libc::close(fd);
                    return Err(err);
                }
            }
            libc::close(fd);

            let ptr = NonNull::new(reserved as *mut u8).ok_or_else(|| fail("null mapping"))?;
            Ok(Self { ptr, len })
        }
    }
}

#[cfg(target_os = "linux")]
fn open_backing_fd() -> std::io::Result<libc::c_int> {
    // SAFETY: the name is a valid NUL-terminated string.
    let fd = unsafe { libc::memfd_create(c"flowkernel-circular".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn open_backing_fd() -> std::io::Result<libc::c_int> {
    let mut template = std::env::temp_dir()
        .join("flowkernel-circular-XXXXXX")
        .into_os_string()
        .into_encoded_bytes();
    template.push(0);
    // SAFETY: template is a writable NUL-terminated buffer ending in XXXXXX.
    let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: template now names the created file.
    unsafe { libc::unlink(template.as_ptr() as *const libc::c_char) };
    Ok(fd)
}

#[cfg(unix)]
impl MemoryContainer for CircularContainer {
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_circular(&self) -> bool {
        true
    }
}

#[cfg(unix)]
impl Drop for CircularContainer {
    fn drop(&mut self) {
        // SAFETY: the reservation covers both halves and is owned by this container.
        unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, 2 * self.len) };
    }
}

/// An address and length over a shared allocation.
///
/// Offsets are measured from the container base. For circular containers a
/// view may start anywhere in `[0, len)` and extend up to `2 * len`.
#[derive(Clone)]
pub struct SharedBuffer {
    container: Arc<dyn MemoryContainer>,
    offset: usize,
    length: usize,
}

impl SharedBuffer {
    /// Allocate `num_bytes` of zeroed, 64-byte aligned memory.
    ///
    /// `node_affinity` is advisory; memory always comes from the global allocator.
    pub fn allocate(num_bytes: usize, node_affinity: i64) -> Result<Self, BufferError> {
        if node_affinity >= 0 {
            tracing::debug!(node_affinity, "NUMA placement unavailable, using heap memory");
        }
        let container = HeapContainer::new(num_bytes)?;
        Ok(Self::from_container(Arc::new(container)))
    }

    /// Allocate a double-mapped ring of at least `num_bytes`, rounded up to the page size.
    #[cfg(unix)]
    pub fn allocate_circular(num_bytes: usize, node_affinity: i64) -> Result<Self, BufferError> {
        if node_affinity >= 0 {
            tracing::debug!(node_affinity, "NUMA placement unavailable for circular memory");
        }
        let container = CircularContainer::new(num_bytes)?;
        let buffer = Self::from_container(Arc::new(container));
        assert_invariant(
            BUFFER_ALIAS_IDENTITY,
            buffer.alias().map(|a| a - buffer.address()) == Some(buffer.len()),
            "alias sits one ring length past the base",
            Some("allocate_circular"),
        );
        Ok(buffer)
    }

    /// Allocate a double-mapped ring of at least `num_bytes`, rounded up to the page size.
    #[cfg(not(unix))]
    pub fn allocate_circular(num_bytes: usize, _node_affinity: i64) -> Result<Self, BufferError> {
        Err(BufferError::Allocation {
            bytes: num_bytes,
            reason: "circular mappings need a unix target".to_string(),
        })
    }

    /// Full view over a container.
    pub fn from_container(container: Arc<dyn MemoryContainer>) -> Self {
        let length = container.len();
        Self {
            container,
            offset: 0,
            length,
        }
    }

    /// Bounds-checked view sharing this buffer's allocation.
    ///
    /// `offset` is relative to this view's start. For circular memory the
    /// requested range may also lie in the aliased copy of this view.
    pub fn sub_range(&self, offset: usize, length: usize) -> Result<Self, BufferError> {
        let start = self.offset.checked_add(offset);
        let end = start.and_then(|s| s.checked_add(length));
        let out_of_bounds = BufferError::OutOfBounds {
            offset: offset.saturating_add(self.offset),
            length,
            start: self.offset,
            end: self.offset + self.length,
        };
        let (start, end) = match (start, end) {
            (Some(s), Some(e)) => (s, e),
            _ => return Err(out_of_bounds),
        };
        if !self.range_within(start, end) {
            return Err(out_of_bounds);
        }
        assert_invariant(
            BUFFER_BOUNDS,
            end <= self.mapped_len(),
            "view stays inside the mapping",
            Some("sub_range"),
        );
        Ok(Self {
            container: self.container.clone(),
            offset: start,
            length,
        })
    }

    /// True when `[start, end)` (container offsets) lies in this view or its alias.
    pub(crate) fn range_within(&self, start: usize, end: usize) -> bool {
        let lo = self.offset;
        let hi = self.offset + self.length;
        if start >= lo && end <= hi {
            return true;
        }
        if !self.is_circular() {
            return false;
        }
        let ring = self.capacity();
        let mapped = self.mapped_len();
        let wraps = start >= lo && start <= hi && end - start <= ring && end <= hi + ring;
        if wraps && end <= mapped {
            return true;
        }
        let shifted_up = start >= lo + ring && end <= hi + ring && end <= mapped;
        let shifted_down = lo >= ring && start + ring >= lo && end + ring <= hi;
        shifted_up || shifted_down
    }

    /// Address of the first byte.
    pub fn address(&self) -> usize {
        self.container.base().as_ptr() as usize + self.offset
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.address() + self.length
    }

    /// Aliased address of the first byte, for circular memory.
    pub fn alias(&self) -> Option<usize> {
        self.is_circular().then(|| self.address() + self.capacity())
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True for zero-length views.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Length of the underlying allocation (the ring length when circular).
    pub fn capacity(&self) -> usize {
        self.container.len()
    }

    /// True when backed by a double mapping.
    pub fn is_circular(&self) -> bool {
        self.container.is_circular()
    }

    /// Number of views sharing the allocation.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.container)
    }

    /// True when this is the only view.
    pub fn unique(&self) -> bool {
        self.use_count() == 1
    }

    /// True when both views are over the same allocation.
    pub fn same_allocation(&self, other: &Self) -> bool {
        self.container.base() == other.container.base()
    }

    /// Raw pointer to the first byte.
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: offset never exceeds the mapped length.
        unsafe { self.container.base().as_ptr().add(self.offset) }
    }

    /// Start of the view measured from the container base.
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes of address space valid from the container base.
    pub(crate) fn mapped_len(&self) -> usize {
        if self.is_circular() {
            2 * self.capacity()
        } else {
            self.capacity()
        }
    }

    /// View over the same allocation at container offset `offset`, unchecked.
    pub(crate) fn rebased(&self, offset: usize, length: usize) -> Self {
        Self {
            container: self.container.clone(),
            offset,
            length,
        }
    }

    /// Borrow `length` bytes starting at container offset `offset`.
    ///
    /// # Safety
    /// `offset + length` must not exceed [`Self::mapped_len`], and no mutable
    /// borrow of the same bytes may be live.
    pub(crate) unsafe fn bytes_at(&self, offset: usize, length: usize) -> &[u8] {
        if length == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.container.base().as_ptr().add(offset), length)
    }

    /// Mutably borrow `length` bytes starting at container offset `offset`.
    ///
    /// # Safety
    /// `offset + length` must not exceed [`Self::mapped_len`], and no other
    /// borrow of the same bytes may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_at_mut(&self, offset: usize, length: usize) -> &mut [u8] {
        if length == 0 {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.container.base().as_ptr().add(offset), length)
    }

    /// Contents of the view.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the view is within the mapping by construction.
        unsafe { self.bytes_at(self.offset, self.length) }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("length", &self.length)
            .field("circular", &self.is_circular())
            .field("use_count", &self.use_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocation_is_aligned_and_zeroed() {
        let buf = SharedBuffer::allocate(1000, -1).unwrap();
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.address() % BUFFER_ALIGNMENT, 0);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
        assert!(buf.alias().is_none());
    }

    #[test]
    fn zero_length_allocation() {
        let buf = SharedBuffer::allocate(0, -1).unwrap();
        assert!(buf.is_empty());
        assert!(buf.as_bytes().is_empty());
    }

    #[test]
    fn sub_range_shares_ownership() {
        let buf = SharedBuffer::allocate(256, -1).unwrap();
        let sub = buf.sub_range(16, 32).unwrap();
        assert_eq!(sub.address(), buf.address() + 16);
        assert_eq!(buf.use_count(), 2);
        drop(buf);
        assert!(sub.unique());
        assert_eq!(sub.len(), 32);
    }

    #[test]
    fn sub_range_rejects_overflow() {
        let buf = SharedBuffer::allocate(64, -1).unwrap();
        assert!(matches!(
            buf.sub_range(60, 8),
            Err(BufferError::OutOfBounds { .. })
        ));
        assert!(matches!(
            buf.sub_range(usize::MAX, 2),
            Err(BufferError::OutOfBounds { .. })
        ));
        let inner = buf.sub_range(8, 8).unwrap();
        assert!(inner.sub_range(0, 9).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn circular_alias_reads_the_same_bytes() {
        let buf = SharedBuffer::allocate_circular(100, -1).unwrap();
        let len = buf.len();
        assert_eq!(len % page_size(), 0);
        assert_eq!(buf.alias().unwrap() - buf.address(), len);

        // SAFETY: test owns the only view.
        let ring = unsafe { buf.bytes_at_mut(0, len) };
        for (i, b) in ring.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let window = buf.sub_range(len - 10, 20).unwrap();
        let bytes = window.as_bytes();
        assert_eq!(&bytes[..10], &buf.as_bytes()[len - 10..]);
        assert_eq!(&bytes[10..], &buf.as_bytes()[..10]);
    }
}
