//! An [`Allocator`] front end for a [`SegregatedHeap`].
//!
//! The heap itself is a single-threaded data structure with a `&mut self`
//! API. `LockedHeap` puts it behind a mutex so that it can be used through
//! `&self` by the collections that accept a custom allocator.

use core::ptr;

use super::*;
use crate::block::ALIGNMENT;

mod mutex;
use mutex::Mutex;
pub use mutex::{Lock, SingleThreadedLock};

/// A [`SegregatedHeap`] behind a lock, implementing [`Allocator`].
///
/// Only layouts aligned to at most 16 bytes can be served; more strictly
/// aligned requests fail with [`AllocError`].
///
/// Because this crate is `no_std` and does not assume the presence of an
/// operating system, you must provide your own lock via the `L` type
/// parameter. See the [`Lock`] trait for details.
///
/// ```
/// # #[cfg(feature = "allocator_api2")]
/// # {
/// use allocator_api2::vec::Vec;
/// use seglist::{Config, LockedHeap, MemoryRegion, SingleThreadedLock};
/// use std::alloc::System;
///
/// let region = MemoryRegion::new(System, 1 << 20).unwrap();
/// let heap = LockedHeap::new(region, Config::default(), SingleThreadedLock::new());
///
/// let mut v = Vec::new_in(&heap);
/// v.extend(0..1000u32);
/// assert_eq!(v.iter().sum::<u32>(), 499_500);
/// drop(v);
///
/// heap.check_heap().unwrap();
/// # }
/// ```
pub struct LockedHeap<G, L>
where
    G: GrowHeap,
    L: Lock,
{
    heap: Mutex<SegregatedHeap<G>, L>,
}

impl<G, L> LockedHeap<G, L>
where
    G: GrowHeap,
    L: Lock,
{
    /// Create a new heap over `growth`, guarded by `lock`.
    #[inline]
    pub const fn new(growth: G, config: Config, lock: L) -> Self {
        LockedHeap {
            heap: Mutex::new(SegregatedHeap::new(growth, config), lock),
        }
    }

    /// Run the heap's consistency checker.
    pub fn check_heap(&self) -> Result<(), HeapCheckError> {
        self.heap.lock().check_heap()
    }

    /// Total bytes obtained from the growth provider so far.
    pub fn heap_size(&self) -> usize {
        self.heap.lock().heap_size()
    }

    /// Get an exclusive reference to the underlying heap.
    #[inline]
    pub fn heap_mut(&mut self) -> &mut SegregatedHeap<G> {
        self.heap.get_mut()
    }

    /// Unwrap the underlying heap.
    #[inline]
    pub fn into_inner(self) -> SegregatedHeap<G> {
        self.heap.into_inner()
    }
}

/// A well-aligned, non-null pointer for zero-sized allocations.
#[inline]
fn dangling(layout: Layout) -> NonNull<u8> {
    // Safety: alignments are never zero.
    unsafe { NonNull::new_unchecked(ptr::without_provenance_mut(layout.align())) }
}

/// The payload of `ptr`, with its full usable size.
///
/// # Safety
///
/// `ptr` must be a live allocation from `heap`.
#[inline]
unsafe fn payload_slice<G: GrowHeap>(heap: &SegregatedHeap<G>, ptr: NonNull<u8>) -> NonNull<[u8]> {
    NonNull::slice_from_raw_parts(ptr, heap.payload_size(ptr))
}

unsafe impl<G, L> Allocator for LockedHeap<G, L>
where
    G: GrowHeap,
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > ALIGNMENT {
            log::trace!("cannot satisfy {layout:?}: alignment above {ALIGNMENT}");
            return Err(AllocError);
        }
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(dangling(layout), 0));
        }

        let mut heap = self.heap.lock();
        let ptr = heap.allocate(layout.size()).ok_or(AllocError)?;
        // Safety: just allocated.
        Ok(unsafe { payload_slice(&*heap, ptr) })
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let block = self.allocate(layout)?;
        // Safety: the whole slice is ours to write.
        unsafe { block.cast::<u8>().write_bytes(0, block.len()) };
        Ok(block)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        self.heap.lock().release(Some(ptr));
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }
        if new_layout.align() > ALIGNMENT {
            return Err(AllocError);
        }

        let mut heap = self.heap.lock();
        let new = heap
            .reallocate(Some(ptr), new_layout.size())
            .ok_or(AllocError)?;
        Ok(payload_slice(&*heap, new))
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        if new_layout.align() > ALIGNMENT {
            return Err(AllocError);
        }
        if new_layout.size() == 0 {
            self.deallocate(ptr, old_layout);
            return Ok(NonNull::slice_from_raw_parts(dangling(new_layout), 0));
        }

        let mut heap = self.heap.lock();
        let new = heap
            .reallocate(Some(ptr), new_layout.size())
            .ok_or(AllocError)?;
        Ok(payload_slice(&*heap, new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::System;

    type Heap = LockedHeap<MemoryRegion<System>, SingleThreadedLock>;

    fn heap() -> Heap {
        let _ = env_logger::try_init();
        LockedHeap::new(
            MemoryRegion::new(System, 1 << 20).unwrap(),
            Config::default(),
            SingleThreadedLock::new(),
        )
    }

    #[test]
    fn rejects_over_aligned_layouts() {
        let heap = heap();
        let layout = Layout::from_size_align(64, 32).unwrap();
        assert!(heap.allocate(layout).is_err());
        assert_eq!(heap.heap_size(), 0);
    }

    #[test]
    fn zero_sized_layouts_do_not_touch_the_heap() {
        let heap = heap();
        let layout = Layout::from_size_align(0, 8).unwrap();
        let block = heap.allocate(layout).unwrap();
        assert_eq!(block.len(), 0);
        assert_eq!(block.cast::<u8>().as_ptr() as usize % 8, 0);
        unsafe { heap.deallocate(block.cast(), layout) };
        assert_eq!(heap.heap_size(), 0);
    }

    #[test]
    fn slices_report_usable_size() {
        let heap = heap();
        let layout = Layout::from_size_align(50, 16).unwrap();
        let block = heap.allocate(layout).unwrap();
        assert_eq!(block.len(), 72);
        assert_eq!(block.cast::<u8>().as_ptr() as usize % 16, 0);
        unsafe { heap.deallocate(block.cast(), layout) };
        heap.check_heap().unwrap();
    }

    #[test]
    fn allocate_zeroed_clears_the_whole_slice() {
        let heap = heap();
        let layout = Layout::from_size_align(100, 8).unwrap();
        let block = heap.allocate(layout).unwrap();
        unsafe {
            block.cast::<u8>().write_bytes(0xAA, block.len());
            heap.deallocate(block.cast(), layout);
        }

        let block = heap.allocate_zeroed(layout).unwrap();
        let bytes = unsafe { block.as_ref() };
        assert!(bytes.iter().all(|b| *b == 0));
        unsafe { heap.deallocate(block.cast(), layout) };
    }

    #[test]
    fn grow_and_shrink_preserve_contents() {
        let heap = heap();
        let small = Layout::from_size_align(16, 8).unwrap();
        let big = Layout::from_size_align(300, 8).unwrap();
        unsafe {
            let block = heap.allocate(small).unwrap().cast::<u8>();
            for i in 0..16 {
                *block.as_ptr().add(i) = i as u8;
            }

            let grown = heap.grow(block, small, big).unwrap();
            assert!(grown.len() >= 300);
            for i in 0..16 {
                assert_eq!(*grown.cast::<u8>().as_ptr().add(i), i as u8);
            }

            let tiny = Layout::from_size_align(4, 4).unwrap();
            let shrunk = heap.shrink(grown.cast(), big, tiny).unwrap();
            for i in 0..4 {
                assert_eq!(*shrunk.cast::<u8>().as_ptr().add(i), i as u8);
            }

            let empty = Layout::from_size_align(0, 4).unwrap();
            let gone = heap.shrink(shrunk.cast(), tiny, empty).unwrap();
            assert_eq!(gone.len(), 0);
        }
        heap.check_heap().unwrap();
        let heap = heap.into_inner();
        assert_eq!(heap.heap_size(), 16 + Config::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn grow_from_zero_size() {
        let heap = heap();
        let empty = Layout::from_size_align(0, 8).unwrap();
        let layout = Layout::from_size_align(40, 8).unwrap();
        unsafe {
            let block = heap.allocate(empty).unwrap();
            let grown = heap.grow(block.cast(), empty, layout).unwrap();
            assert!(grown.len() >= 40);
            heap.deallocate(grown.cast(), layout);
        }
        heap.check_heap().unwrap();
    }

    #[cfg(feature = "allocator_api2")]
    #[test]
    fn backs_collections() {
        let heap = heap();
        {
            let mut v = allocator_api2::vec::Vec::new_in(&heap);
            for i in 0..10_000u64 {
                v.push(i);
            }
            assert_eq!(v.iter().sum::<u64>(), 49_995_000);

            let mut boxes = allocator_api2::vec::Vec::new();
            for i in 0..100u8 {
                boxes.push(allocator_api2::boxed::Box::new_in([i; 24], &heap));
            }
            boxes.retain(|b| b[0] % 3 == 0);
            assert!(boxes.iter().all(|b| b.iter().all(|x| *x % 3 == 0)));
        }
        heap.check_heap().unwrap();
    }
}
