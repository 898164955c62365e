//! Carving an allocation out of a free block.

use crate::{
    block::{Block, MIN_BLOCK_SIZE},
    heap::HeapState,
    size_class::SizeClass,
};

impl HeapState {
    /// Allocate `asize` bytes at the start of the free block `block`, which
    /// must be filed in its free list and at least `asize` bytes long.
    ///
    /// Whatever is left over, if it is large enough to be a block of its own,
    /// is split off and filed as a new free block. Otherwise the whole block is
    /// handed out.
    pub(crate) fn place(&mut self, block: Block, asize: usize) {
        let header = self.arena.header(block);
        debug_assert!(!header.allocated, "placing into allocated block at {:#x}", block.offset());
        debug_assert!(header.size >= asize);

        let class = SizeClass::for_size(header.size);
        let links = self.lists.links(&self.arena, class, block);
        self.lists.remove(&mut self.arena, class, block, links);

        let remainder = header.size - asize;
        if remainder >= MIN_BLOCK_SIZE {
            self.arena
                .write_allocated(block, asize, header.prev_minimum, header.prev_allocated);

            let rest = Block::at(block.offset() + asize);
            self.arena.write_free(rest, remainder, asize == MIN_BLOCK_SIZE, true);
            self.lists.insert(&mut self.arena, rest, remainder, None);

            let next = self.arena.next_block(rest);
            self.arena.set_prev_state(next, remainder == MIN_BLOCK_SIZE, false);
        } else {
            self.arena.write_allocated(
                block,
                header.size,
                header.prev_minimum,
                header.prev_allocated,
            );
            let next = self.arena.next_block(block);
            self.arena.set_prev_state(next, header.is_minimum(), true);
        }
    }
}
