//! Word-granular access to the heap's backing memory.
//!
//! Every piece of allocator metadata (headers, footers, and the free-list
//! links stored inside free payloads) lives in the arena as a 64-bit word,
//! addressed by its byte offset from the arena base. The two accessors in
//! this module are the only places that reinterpret raw memory; everything
//! above them deals in offsets and decoded values.

use core::ptr::NonNull;

use crate::block::WORD;

/// The contiguous, append-only byte range the heap is carved out of.
pub(crate) struct Arena {
    /// Start of the first region the growth provider handed us.
    base: NonNull<u8>,

    /// Number of bytes obtained from the growth provider so far.
    len: usize,
}

impl Arena {
    /// Create an empty arena rooted at `base`.
    ///
    /// No bytes are accessible until they are added with [`Arena::extend`].
    pub(crate) const fn new(base: NonNull<u8>) -> Self {
        Arena { base, len: 0 }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// The address one past the last byte of the arena, which is where the
    /// next region from the growth provider must begin.
    #[inline]
    pub(crate) fn end(&self) -> NonNull<u8> {
        self.ptr_at(self.len)
    }

    /// Account for `bytes` that were just appended by the growth provider.
    #[inline]
    pub(crate) fn extend(&mut self, bytes: usize) {
        self.len += bytes;
    }

    #[inline]
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len);
        // Safety: `offset` is within (or one past the end of) the memory the
        // growth provider gave us, all of which derives from `base`.
        unsafe { self.base.add(offset) }
    }

    /// The arena offset of the given pointer into the arena.
    #[inline]
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        debug_assert!(
            offset < self.len,
            "{ptr:p} does not point into the heap arena at {:p}",
            self.base
        );
        offset
    }

    /// Read the metadata word at `offset`.
    #[inline]
    pub(crate) fn word(&self, offset: usize) -> u64 {
        debug_assert_eq!(offset % WORD, 0, "misaligned word offset {offset:#x}");
        debug_assert!(
            offset + WORD <= self.len,
            "word offset {offset:#x} out of bounds for arena of {:#x} bytes",
            self.len
        );
        // Safety: the offset is word-aligned (the base is 16-aligned) and the
        // whole word is inside memory owned by this arena.
        unsafe { self.base.as_ptr().add(offset).cast::<u64>().read() }
    }

    /// Write the metadata word at `offset`.
    #[inline]
    pub(crate) fn set_word(&mut self, offset: usize, value: u64) {
        debug_assert_eq!(offset % WORD, 0, "misaligned word offset {offset:#x}");
        debug_assert!(
            offset + WORD <= self.len,
            "word offset {offset:#x} out of bounds for arena of {:#x} bytes",
            self.len
        );
        // Safety: same as `word`, and we hold `&mut self`.
        unsafe { self.base.as_ptr().add(offset).cast::<u64>().write(value) }
    }
}
