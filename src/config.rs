//! Tunables for a [`SegregatedHeap`](crate::SegregatedHeap).

use crate::block::{ALIGNMENT, GENERAL_MIN_BLOCK_SIZE, MIN_BLOCK_PAYLOAD, MIN_BLOCK_SIZE, WORD};

/// Heap configuration.
///
/// ```
/// use seglist::Config;
///
/// let config = Config::new().with_chunk_size(1 << 16).with_minimum_block_request(0);
/// assert_eq!(config.chunk_size(), 1 << 16);
/// assert_eq!(config.minimum_block_request(), 0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    chunk_size: usize,
    minimum_block_request: usize,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// The default size of the free chunk the heap starts out with.
    pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;

    /// Create the default configuration.
    #[inline]
    pub const fn new() -> Self {
        Config {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            minimum_block_request: MIN_BLOCK_PAYLOAD,
        }
    }

    /// Set how many bytes to request from the growth provider for the initial
    /// free chunk, on top of the sentinel words. Rounded up to the alignment;
    /// zero means the heap starts out empty.
    #[inline]
    pub const fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the largest request that is satisfied with a minimum-size block.
    ///
    /// Minimum-size blocks only have room for eight bytes of payload, so
    /// larger values are clamped to eight. Zero disables handing out
    /// minimum-size blocks for requests, though they can still be produced by
    /// splitting.
    #[inline]
    pub const fn with_minimum_block_request(mut self, bytes: usize) -> Self {
        self.minimum_block_request = if bytes < MIN_BLOCK_PAYLOAD {
            bytes
        } else {
            MIN_BLOCK_PAYLOAD
        };
        self
    }

    /// Bytes requested for the initial free chunk.
    #[inline]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The largest request satisfied with a minimum-size block.
    #[inline]
    pub const fn minimum_block_request(&self) -> usize {
        self.minimum_block_request
    }

    /// The block size used to satisfy a request for `size` bytes of payload,
    /// or `None` if it is not representable.
    pub(crate) fn adjusted_size(&self, size: usize) -> Option<usize> {
        if size <= self.minimum_block_request {
            Some(MIN_BLOCK_SIZE)
        } else if size <= GENERAL_MIN_BLOCK_SIZE - WORD {
            Some(GENERAL_MIN_BLOCK_SIZE)
        } else {
            round_up(size.checked_add(2 * WORD)?, ALIGNMENT)
        }
    }
}

/// Round `size` up to a multiple of `align`, which must be a power of two.
#[inline]
pub(crate) fn round_up(size: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(size.checked_add(align - 1)? & !(align - 1))
}
