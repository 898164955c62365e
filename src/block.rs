//! Block layout: header encoding, footers, and physical neighbors.
//!
//! ```text
//!   allocated block            free block (>= 32 bytes)     free block (16 bytes)
//!   +------------------+       +------------------+         +------------------+
//!   | header           |       | header           |         | header           |
//!   +------------------+ <-p   +------------------+         +------------------+
//!   | payload          |       | next link        |         | next link        |
//!   | ...              |       | prev link        |         +------------------+
//!   |                  |       | ...              |
//!   +------------------+       | footer (=header) |
//!                              +------------------+
//! ```
//!
//! Block headers sit at offsets that are 8 modulo 16, so that payloads are
//! 16-aligned. Allocated blocks never carry a footer; instead, each header
//! caches whether its physical predecessor is allocated and whether it is a
//! minimum-size block, which is everything needed to find the predecessor
//! when it is free.

use crate::arena::Arena;

/// Alignment, in bytes, of every payload and every block size.
pub const ALIGNMENT: usize = 16;

/// Size of a header, footer, or free-list link.
pub(crate) const WORD: usize = 8;

/// Size of the special minimum-size block: a header plus a single word of
/// payload, which holds the next link while the block is free. These blocks
/// never have a footer.
pub const MIN_BLOCK_SIZE: usize = 16;

/// The smallest block that can hold a header, both free-list links, and a
/// footer.
pub const GENERAL_MIN_BLOCK_SIZE: usize = 32;

/// Payload capacity of a minimum-size block.
pub(crate) const MIN_BLOCK_PAYLOAD: usize = MIN_BLOCK_SIZE - WORD;

const ALLOCATED: u64 = 0x1;
const PREV_ALLOCATED: u64 = 0x2;
const PREV_MINIMUM: u64 = 0x4;
const SIZE_MASK: u64 = !0xF;

/// The decoded form of a block header word.
///
/// The word layout is a stable contract:
///
/// | bits  | meaning                                      |
/// |-------|----------------------------------------------|
/// | 0     | this block is allocated                      |
/// | 1     | the previous block is allocated              |
/// | 2     | the previous block is a minimum-size block   |
/// | 3     | reserved, always zero                        |
/// | 4..64 | block size (a multiple of [`ALIGNMENT`])     |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Total block size in bytes, including the header (and footer, if any).
    pub size: usize,
    /// Whether the physically preceding block is a minimum-size block.
    pub prev_minimum: bool,
    /// Whether the physically preceding block is allocated.
    pub prev_allocated: bool,
    /// Whether this block is allocated.
    pub allocated: bool,
}

impl Header {
    /// The header of the zero-size, always-allocated prologue and of the
    /// epilogue of an empty heap.
    pub const SENTINEL: Header = Header {
        size: 0,
        prev_minimum: false,
        prev_allocated: true,
        allocated: true,
    };

    /// Pack this header into a single word.
    ///
    /// The low four bits of `size` are discarded.
    #[inline]
    pub const fn encode(self) -> u64 {
        let mut word = self.size as u64 & SIZE_MASK;
        if self.allocated {
            word |= ALLOCATED;
        }
        if self.prev_allocated {
            word |= PREV_ALLOCATED;
        }
        if self.prev_minimum {
            word |= PREV_MINIMUM;
        }
        word
    }

    /// Unpack a header word.
    #[inline]
    pub const fn decode(word: u64) -> Self {
        Header {
            size: (word & SIZE_MASK) as usize,
            prev_minimum: word & PREV_MINIMUM != 0,
            prev_allocated: word & PREV_ALLOCATED != 0,
            allocated: word & ALLOCATED != 0,
        }
    }

    #[inline]
    pub(crate) const fn is_minimum(&self) -> bool {
        self.size == MIN_BLOCK_SIZE
    }
}

/// A handle to a block: the arena offset of its header word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block(usize);

impl Block {
    /// The first real block sits right after the prologue word.
    pub(crate) const FIRST: Block = Block(WORD);

    #[inline]
    pub(crate) const fn at(offset: usize) -> Self {
        Block(offset)
    }

    #[inline]
    pub(crate) const fn from_payload(offset: usize) -> Self {
        Block(offset - WORD)
    }

    #[inline]
    pub(crate) const fn offset(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) const fn payload(self) -> usize {
        self.0 + WORD
    }
}

impl Arena {
    #[inline]
    pub(crate) fn header(&self, block: Block) -> Header {
        Header::decode(self.word(block.offset()))
    }

    #[inline]
    pub(crate) fn set_header(&mut self, block: Block, header: Header) {
        self.set_word(block.offset(), header.encode());
    }

    /// Mark `block` free with the given size and cached predecessor state,
    /// writing a footer unless it is a minimum-size block.
    pub(crate) fn write_free(
        &mut self,
        block: Block,
        size: usize,
        prev_minimum: bool,
        prev_allocated: bool,
    ) {
        let header = Header {
            size,
            prev_minimum,
            prev_allocated,
            allocated: false,
        };
        self.set_header(block, header);
        if !header.is_minimum() {
            self.set_word(block.offset() + size - WORD, header.encode());
        }
    }

    /// Mark `block` allocated. Allocated blocks have no footer.
    pub(crate) fn write_allocated(
        &mut self,
        block: Block,
        size: usize,
        prev_minimum: bool,
        prev_allocated: bool,
    ) {
        self.set_header(
            block,
            Header {
                size,
                prev_minimum,
                prev_allocated,
                allocated: true,
            },
        );
    }

    /// Update the predecessor state cached in `block`'s header.
    ///
    /// If `block` is free its footer is kept identical to the header.
    pub(crate) fn set_prev_state(&mut self, block: Block, prev_minimum: bool, prev_allocated: bool) {
        let mut header = self.header(block);
        header.prev_minimum = prev_minimum;
        header.prev_allocated = prev_allocated;
        self.set_header(block, header);
        if !header.allocated && !header.is_minimum() {
            self.set_word(block.offset() + header.size - WORD, header.encode());
        }
    }

    /// Read the footer of a free, non-minimum block.
    #[inline]
    pub(crate) fn footer(&self, block: Block, size: usize) -> Header {
        Header::decode(self.word(block.offset() + size - WORD))
    }

    #[inline]
    pub(crate) fn next_block(&self, block: Block) -> Block {
        Block(block.offset() + self.header(block).size)
    }

    /// The physically preceding block.
    ///
    /// Only meaningful when the predecessor is free, or is a minimum-size
    /// block: allocated blocks otherwise leave no footer to read.
    pub(crate) fn prev_block(&self, block: Block) -> Block {
        let header = self.header(block);
        if header.prev_minimum {
            return Block(block.offset() - MIN_BLOCK_SIZE);
        }
        debug_assert!(
            !header.prev_allocated,
            "block at {:#x} has an allocated, footerless predecessor",
            block.offset()
        );
        let footer = Header::decode(self.word(block.offset() - WORD));
        Block(block.offset() - footer.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::tests::vec_arena;

    #[test]
    fn header_bit_layout() {
        let header = Header {
            size: 48,
            prev_minimum: true,
            prev_allocated: false,
            allocated: true,
        };
        assert_eq!(header.encode(), 0x35);
        assert_eq!(Header::decode(0x35), header);

        assert_eq!(Header::SENTINEL.encode(), 0x3);
        assert_eq!(
            Header::decode(0x1002),
            Header {
                size: 0x1000,
                prev_minimum: false,
                prev_allocated: true,
                allocated: false,
            }
        );
    }

    #[test]
    fn encode_masks_low_size_bits() {
        let header = Header {
            size: 0x4f,
            ..Header::default()
        };
        assert_eq!(header.encode(), 0x40);
    }

    #[test]
    fn free_blocks_mirror_header_in_footer() {
        let (_buf, mut arena) = vec_arena(16);
        let block = Block::at(8);
        arena.write_free(block, 48, false, true);
        assert_eq!(arena.footer(block, 48), arena.header(block));

        arena.set_prev_state(block, true, false);
        assert!(arena.header(block).prev_minimum);
        assert_eq!(arena.footer(block, 48), arena.header(block));
    }

    #[test]
    fn neighbors() {
        let (_buf, mut arena) = vec_arena(16);
        let a = Block::at(8);
        arena.write_free(a, 32, false, true);
        let b = arena.next_block(a);
        assert_eq!(b, Block::at(40));
        arena.write_allocated(b, 16, false, false);
        assert_eq!(arena.prev_block(b), a);

        let c = arena.next_block(b);
        assert_eq!(c, Block::at(56));
        arena.write_allocated(c, 32, true, true);
        assert_eq!(arena.prev_block(c), b);
    }

    #[test]
    fn payload_offsets() {
        let block = Block::at(24);
        assert_eq!(block.payload(), 32);
        assert_eq!(Block::from_payload(32), block);
        assert_eq!(Block::FIRST.payload() % ALIGNMENT, 0);
    }
}
