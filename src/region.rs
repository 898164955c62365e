//! Where the heap's memory comes from.

use super::*;
use crate::block::ALIGNMENT;

/// An append-only source of memory for a heap, in the style of `sbrk`.
///
/// # Safety
///
/// Implementations must uphold the following for every successful call to
/// `grow_heap`:
///
/// * The returned region is `bytes` long, zero-initialized, and valid for
///   reads and writes.
///
/// * The first region returned is aligned to 16 bytes, and every later
///   region starts exactly where the previous one ended, so that all regions
///   together form one contiguous range.
///
/// * Regions are never moved, shrunk, reused, or otherwise accessed by the
///   implementation for as long as it is alive.
pub unsafe trait GrowHeap {
    /// Append `bytes` to the end of the heap and return the start of the new
    /// region, or fail if the backing resource is exhausted.
    fn grow_heap(&mut self, bytes: usize) -> Result<NonNull<u8>, AllocError>;
}

/// A fixed-capacity memory region, reserved up front from an inner allocator
/// and handed out to a heap in ever-growing prefixes.
///
/// ```
/// use seglist::{GrowHeap, MemoryRegion};
/// use std::alloc::System;
///
/// let mut region = MemoryRegion::new(System, 64).unwrap();
/// let a = region.grow_heap(48).unwrap();
/// let b = region.grow_heap(16).unwrap();
/// assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 48);
/// assert!(region.grow_heap(16).is_err());
/// assert_eq!(region.len(), 64);
/// ```
pub struct MemoryRegion<A>
where
    A: Allocator,
{
    /// The allocator the backing buffer came from.
    inner: A,

    /// Start of the backing buffer.
    start: NonNull<u8>,

    /// Total size of the backing buffer.
    capacity: usize,

    /// Number of bytes handed out so far; the "program break".
    brk: usize,
}

// Safety: the region exclusively owns its backing buffer.
unsafe impl<A> Send for MemoryRegion<A> where A: Allocator + Send {}

impl<A> MemoryRegion<A>
where
    A: Allocator,
{
    /// Reserve a zeroed region of `capacity` bytes from `inner`.
    pub fn new(inner: A, capacity: usize) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(capacity, ALIGNMENT).map_err(|_| AllocError)?;
        let start = inner.allocate_zeroed(layout)?.cast::<u8>();
        log::debug!("reserved a {capacity:#x}-byte heap region at {start:p}");
        Ok(MemoryRegion {
            inner,
            start,
            capacity,
            brk: 0,
        })
    }

    /// Number of bytes handed out so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.brk
    }

    /// Whether no bytes have been handed out yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.brk == 0
    }

    /// Total number of bytes this region can hand out.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

unsafe impl<A> GrowHeap for MemoryRegion<A>
where
    A: Allocator,
{
    fn grow_heap(&mut self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        if bytes > self.capacity - self.brk {
            log::debug!(
                "heap region exhausted: {bytes:#x} bytes requested, {:#x} of {:#x} left",
                self.capacity - self.brk,
                self.capacity
            );
            return Err(AllocError);
        }
        // Safety: `brk + bytes <= capacity`, so this stays inside the buffer.
        let region = unsafe { self.start.add(self.brk) };
        self.brk += bytes;
        Ok(region)
    }
}

impl<A> Drop for MemoryRegion<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        // The layout was validated in `new`.
        if let Ok(layout) = Layout::from_size_align(self.capacity, ALIGNMENT) {
            // Safety: `start` was allocated by `inner` with this layout and
            // nothing else may use it once the region is gone.
            unsafe { self.inner.deallocate(self.start, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::System;

    #[test]
    fn grows_contiguously_until_exhausted() {
        let mut region = MemoryRegion::new(System, 256).unwrap();
        assert!(region.is_empty());

        let first = region.grow_heap(16).unwrap();
        assert_eq!(first.as_ptr() as usize % ALIGNMENT, 0);
        let second = region.grow_heap(224).unwrap();
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 16);
        assert_eq!(region.len(), 240);

        assert!(region.grow_heap(32).is_err());
        assert_eq!(region.len(), 240);
        let last = region.grow_heap(16).unwrap();
        assert_eq!(last.as_ptr() as usize, first.as_ptr() as usize + 240);
        assert!(region.grow_heap(1).is_err());
    }

    #[test]
    fn memory_is_zeroed() {
        let mut region = MemoryRegion::new(System, 128).unwrap();
        let ptr = region.grow_heap(128).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 128) };
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
