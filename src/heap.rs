//! The allocator context and its public operations.
//!
//! ```text
//!   offset 0   8                                                  len-8  len
//!   +---------+--------+--------+--------+-- ... --+--------------+------+
//!   | prologue| block  | block  | block  |         | block        | epi- |
//!   |  word   |        |        |        |         |              |logue |
//!   +---------+--------+--------+--------+-- ... --+--------------+------+
//! ```
//!
//! The arena starts with a zero-size, allocated prologue word and ends with a
//! zero-size, allocated epilogue header. Growing the heap turns the old
//! epilogue into the header of a new free block and writes a fresh epilogue
//! at the new end.

use core::{cmp, ptr};

use super::*;
use crate::{
    arena::Arena,
    block::{Block, Header, ALIGNMENT, MIN_BLOCK_SIZE, WORD},
    config::round_up,
    free_list::FreeLists,
    size_class::SizeClass,
};

/// Bytes taken by the prologue word and the epilogue header.
pub(crate) const SENTINEL_BYTES: usize = 2 * WORD;

/// A segregated-fit heap allocator over memory obtained from a [`GrowHeap`]
/// provider.
///
/// This is a single-threaded, synchronous data structure. Wrap it in a
/// [`LockedHeap`](crate::LockedHeap) to use it through the `Allocator` trait.
///
/// ```
/// use seglist::{Config, MemoryRegion, SegregatedHeap};
/// use std::alloc::System;
///
/// let region = MemoryRegion::new(System, 1 << 20).unwrap();
/// let mut heap = SegregatedHeap::new(region, Config::default());
///
/// let p = heap.allocate(100).unwrap();
/// assert_eq!(p.as_ptr() as usize % 16, 0);
/// unsafe {
///     p.as_ptr().write_bytes(0xAA, 100);
///     let q = heap.reallocate(Some(p), 1000).unwrap();
///     assert_eq!(*q.as_ptr().add(99), 0xAA);
///     heap.release(Some(q));
/// }
/// heap.check_heap().unwrap();
/// ```
pub struct SegregatedHeap<G> {
    /// Where new memory comes from.
    growth: G,

    config: Config,

    /// The arena and its free lists, created on the first non-zero
    /// allocation.
    state: Option<HeapState>,
}

/// The arena together with the free lists indexing it.
pub(crate) struct HeapState {
    pub(crate) arena: Arena,
    pub(crate) lists: FreeLists,
}

// Safety: the heap exclusively owns its arena memory through `G`.
unsafe impl<G> Send for SegregatedHeap<G> where G: Send {}

impl<G> SegregatedHeap<G>
where
    G: GrowHeap,
{
    /// Create a new heap that obtains its memory from `growth`.
    ///
    /// No memory is requested until the first allocation.
    #[inline]
    pub const fn new(growth: G, config: Config) -> Self {
        SegregatedHeap {
            growth,
            config,
            state: None,
        }
    }

    /// Get a shared reference to the growth provider.
    #[inline]
    pub fn growth(&self) -> &G {
        &self.growth
    }

    /// This heap's configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Total bytes obtained from the growth provider so far.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.arena.len())
    }

    /// Allocate a block with room for at least `size` bytes, returning a
    /// 16-aligned pointer to its payload.
    ///
    /// Returns `None` for zero-sized requests, without touching the heap, and
    /// when the growth provider is exhausted, leaving the heap unchanged.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let asize = self.config.adjusted_size(size)?;

        if self.state.is_none() {
            self.state = Some(HeapState::initialize(&mut self.growth, &self.config).ok()?);
        }
        let Self {
            growth,
            state: Some(state),
            ..
        } = self
        else {
            return None;
        };
        state.checkpoint();

        let block = match state.find_fit(SizeClass::for_size(asize), asize) {
            Some(block) => block,
            None => match state.extend(growth, asize) {
                Ok(block) => block,
                Err(_) => {
                    log::trace!("allocate({size}) -> out of memory");
                    state.checkpoint();
                    return None;
                }
            },
        };
        state.place(block, asize);
        state.checkpoint();

        let ptr = state.arena.ptr_at(block.payload());
        log::trace!("allocate({size}) -> {ptr:p} ({asize}-byte block)");
        Some(ptr)
    }

    /// Release the block whose payload `ptr` points to. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap's `allocate`,
    /// `allocate_zeroed`, or `reallocate` and not released since.
    pub unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        let Some(state) = self.state.as_mut() else {
            debug_assert!(false, "released {ptr:p} into a heap that never allocated");
            return;
        };
        state.checkpoint();

        let block = state.block_of(ptr);
        let header = state.arena.header(block);
        debug_assert!(header.allocated, "double release of {ptr:p}");
        state
            .arena
            .write_free(block, header.size, header.prev_minimum, header.prev_allocated);
        state.coalesce(block);
        state.checkpoint();

        log::trace!("release({ptr:p}) ({}-byte block)", header.size);
    }

    /// Resize the allocation at `ptr` to `size` bytes.
    ///
    /// A `None` pointer behaves like [`allocate`](Self::allocate) and a zero
    /// `size` like [`release`](Self::release), returning `None`. Otherwise a
    /// new block is allocated, the first `min(size, old payload size)` bytes
    /// are copied over, and the old block is released. If the new allocation
    /// fails, `None` is returned and the old block is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`release`](Self::release).
    pub unsafe fn reallocate(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            self.release(ptr);
            return None;
        }
        let Some(old) = ptr else {
            return self.allocate(size);
        };

        let old_payload = self.payload_size(old);
        let new = self.allocate(size)?;
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), cmp::min(size, old_payload));
        self.release(Some(old));

        log::trace!("reallocate({old:p}, {size}) -> {new:p}");
        Some(new)
    }

    /// Allocate a zero-filled array of `count` elements of `size` bytes each.
    ///
    /// Returns `None` if `count * size` overflows or is zero, or if the
    /// allocation fails.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let Some(bytes) = count.checked_mul(size) else {
            log::debug!("allocate_zeroed({count}, {size}) overflows");
            return None;
        };
        let ptr = self.allocate(bytes)?;
        // Safety: the block has at least `bytes` bytes of payload.
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Some(ptr)
    }

    /// The usable payload size of the allocation at `ptr`, which is at least
    /// the size it was requested with.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this heap.
    pub unsafe fn payload_size(&self, ptr: NonNull<u8>) -> usize {
        match self.state.as_ref() {
            Some(state) => state.arena.header(state.block_of(ptr)).size - WORD,
            None => 0,
        }
    }

    /// Walk the whole heap and its free lists, validating every structural
    /// invariant.
    ///
    /// This is a diagnostic: it is slow, and an error means the heap is
    /// corrupt, not that the caller did something recoverable.
    pub fn check_heap(&self) -> Result<(), HeapCheckError> {
        match self.state.as_ref() {
            Some(state) => state.check(),
            None => Ok(()),
        }
    }
}

impl HeapState {
    /// Lay down the sentinels and the initial free chunk.
    ///
    /// Failing to obtain the initial chunk still leaves a valid, empty heap.
    fn initialize<G: GrowHeap>(growth: &mut G, config: &Config) -> Result<HeapState, AllocError> {
        let base = growth.grow_heap(SENTINEL_BYTES)?;
        if base.as_ptr() as usize % ALIGNMENT != 0 {
            log::debug!("heap growth provider returned misaligned base {base:p}");
            return Err(AllocError);
        }

        let mut arena = Arena::new(base);
        arena.extend(SENTINEL_BYTES);
        arena.set_word(0, Header::SENTINEL.encode());
        arena.set_header(Block::FIRST, Header::SENTINEL);
        log::debug!("initialized heap at {base:p}");

        let mut state = HeapState {
            arena,
            lists: FreeLists::new(),
        };
        if config.chunk_size() > 0 {
            if let Err(e) = state.extend(growth, config.chunk_size()) {
                log::debug!("failed to obtain the initial {:#x}-byte chunk: {e:?}", config.chunk_size());
            }
        }
        state.checkpoint();
        Ok(state)
    }

    /// Grow the arena by (at least) `size` bytes, turning the new space into a
    /// free block that is coalesced with a free predecessor and filed in its
    /// free list.
    pub(crate) fn extend<G: GrowHeap>(&mut self, growth: &mut G, size: usize) -> Result<Block, AllocError> {
        let size = round_up(size, ALIGNMENT).ok_or(AllocError)?;
        let region = growth.grow_heap(size)?;
        if region != self.arena.end() {
            log::debug!(
                "heap growth provider returned {region:p}, expected {:p}",
                self.arena.end()
            );
            return Err(AllocError);
        }
        log::trace!("grew heap by {size:#x} bytes at {region:p}");

        // The new block's header replaces the old epilogue, inheriting its
        // cached predecessor state.
        let block = Block::at(self.arena.len() - WORD);
        let epilogue = self.arena.header(block);
        self.arena.extend(size);
        self.arena
            .write_free(block, size, epilogue.prev_minimum, epilogue.prev_allocated);
        self.arena.set_header(
            Block::at(block.offset() + size),
            Header {
                size: 0,
                prev_minimum: size == MIN_BLOCK_SIZE,
                prev_allocated: false,
                allocated: true,
            },
        );

        Ok(self.coalesce(block))
    }

    #[inline]
    pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> Block {
        Block::from_payload(self.arena.offset_of(ptr))
    }

    /// Run the heap checker, panicking on corruption.
    #[cfg(feature = "check_heap")]
    #[track_caller]
    pub(crate) fn checkpoint(&self) {
        if let Err(e) = self.check() {
            panic!("heap corruption detected: {e}");
        }
    }

    #[cfg(not(feature = "check_heap"))]
    #[inline(always)]
    pub(crate) fn checkpoint(&self) {}
}
