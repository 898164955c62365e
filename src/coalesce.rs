//! Merging a newly freed block with its free physical neighbors.

use crate::{
    block::{Block, MIN_BLOCK_SIZE},
    heap::HeapState,
    size_class::SizeClass,
};

impl HeapState {
    /// Merge the free, unfiled `block` with whichever of its physical
    /// neighbors are free, file the result, and return it.
    ///
    /// A block absorbed from a free list leaves a hint behind: the merged
    /// block is filed right before the absorbed block's list successor, if
    /// that successor lands in the same class, and at the head otherwise.
    pub(crate) fn coalesce(&mut self, block: Block) -> Block {
        let header = self.arena.header(block);
        debug_assert!(!header.allocated);

        let next = self.arena.next_block(block);
        let next_header = self.arena.header(next);
        let next_free = !next_header.allocated;
        let prev_free = !header.prev_allocated;

        let (merged, size, hint) = match (prev_free, next_free) {
            (false, false) => {
                self.lists.insert(&mut self.arena, block, header.size, None);
                self.arena.set_prev_state(next, header.is_minimum(), false);
                return block;
            }

            (false, true) => {
                let class = SizeClass::for_size(next_header.size);
                let links = self.lists.links(&self.arena, class, next);
                self.lists.remove(&mut self.arena, class, next, links);
                (block, header.size + next_header.size, links.next)
            }

            (true, false) => {
                let prev = self.arena.prev_block(block);
                let prev_size = self.arena.header(prev).size;
                let class = SizeClass::for_size(prev_size);
                let links = self.lists.links(&self.arena, class, prev);
                self.lists.remove(&mut self.arena, class, prev, links);
                (prev, prev_size + header.size, links.next)
            }

            (true, true) => {
                let prev = self.arena.prev_block(block);
                let prev_size = self.arena.header(prev).size;
                let prev_class = SizeClass::for_size(prev_size);
                let next_class = SizeClass::for_size(next_header.size);

                // Both snapshots are taken before either node is unlinked.
                let mut prev_links = self.lists.links(&self.arena, prev_class, prev);
                let mut next_links = self.lists.links(&self.arena, next_class, next);

                self.lists.remove(&mut self.arena, prev_class, prev, prev_links);
                next_links.bypass(prev, prev_links);
                self.lists.remove(&mut self.arena, next_class, next, next_links);
                prev_links.bypass(next, next_links);

                (prev, prev_size + header.size + next_header.size, prev_links.next)
            }
        };

        let anchor = self.arena.header(merged);
        self.arena
            .write_free(merged, size, anchor.prev_minimum, anchor.prev_allocated);
        self.lists.insert(&mut self.arena, merged, size, hint);

        let successor = self.arena.next_block(merged);
        self.arena.set_prev_state(successor, size == MIN_BLOCK_SIZE, false);

        log::trace!(
            "coalesced block at {:#x} into {size}-byte block at {:#x}",
            block.offset(),
            merged.offset()
        );
        merged
    }
}
