//! Searching the free lists for a block to allocate from.

use crate::{block::Block, free_list::prev_link, heap::HeapState, size_class::SizeClass};

impl HeapState {
    /// Find a free block of at least `asize` bytes, starting from `class`
    /// (the class of `asize`) and moving to ever larger classes.
    pub(crate) fn find_fit(&self, class: SizeClass, asize: usize) -> Option<Block> {
        if class == SizeClass::MINIMUM {
            // Every minimum-size block is an exact fit, and every block in a
            // larger class is big enough.
            return self
                .lists
                .head(class)
                .or_else(|| class.larger().find_map(|c| self.lists.tail(c)));
        }
        class.and_larger().find_map(|c| self.better_of_first_two(c, asize))
    }

    /// Scan `class` from its tail towards its head and return the smaller of
    /// the first two blocks that fit, or the only one.
    ///
    /// When both candidates are the same size the one found first (nearer the
    /// tail) wins.
    fn better_of_first_two(&self, class: SizeClass, asize: usize) -> Option<Block> {
        let mut first: Option<(Block, usize)> = None;
        let mut cursor = self.lists.tail(class);
        while let Some(block) = cursor {
            let size = self.arena.header(block).size;
            if size >= asize {
                match first {
                    None => first = Some((block, size)),
                    Some((_, first_size)) if first_size <= size => return first.map(|(b, _)| b),
                    Some(_) => return Some(block),
                }
            }
            cursor = prev_link(&self.arena, block);
        }
        first.map(|(block, _)| block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arena::tests::vec_arena, free_list::FreeLists};
    use std::vec::Vec;

    /// A heap state whose class lists hold free blocks of the given sizes,
    /// laid out back to back and pushed in order (so the first size ends up
    /// at the tail).
    fn state_with(sizes: &[usize]) -> (Vec<u64>, HeapState, Vec<Block>) {
        let total: usize = sizes.iter().sum();
        let (buf, arena) = vec_arena(total / 8 + 2);
        let mut state = HeapState {
            arena,
            lists: FreeLists::new(),
        };
        let mut blocks = Vec::new();
        let mut offset = 8;
        for &size in sizes {
            let block = Block::at(offset);
            state.arena.write_free(block, size, false, true);
            state.lists.insert(&mut state.arena, block, size, None);
            blocks.push(block);
            offset += size;
        }
        (buf, state, blocks)
    }

    #[test]
    fn picks_smaller_of_first_two_candidates() {
        // All in the 257..=512 class; scanned tail first: 480, 304, 400, 272.
        let (_buf, state, blocks) = state_with(&[480, 304, 400, 272]);
        let class = SizeClass::for_size(300);
        assert_eq!(state.find_fit(class, 300), Some(blocks[1]));
        // 480 is the only block that fits before 400; 400 is smaller.
        assert_eq!(state.find_fit(class, 400), Some(blocks[2]));
        assert_eq!(state.find_fit(class, 480), Some(blocks[0]));
    }

    #[test]
    fn equal_candidates_prefer_the_first_found() {
        let (_buf, state, blocks) = state_with(&[320, 320, 288]);
        let class = SizeClass::for_size(300);
        assert_eq!(state.find_fit(class, 300), Some(blocks[0]));
    }

    #[test]
    fn moves_to_larger_classes_only() {
        let (_buf, state, blocks) = state_with(&[64, 2000]);
        // Nothing in the 97..=128 class; the 64-byte block is never
        // considered.
        assert_eq!(state.find_fit(SizeClass::for_size(112), 112), Some(blocks[1]));
        assert_eq!(state.find_fit(SizeClass::for_size(4000), 4000), None);
    }

    #[test]
    fn minimum_class_prefers_exact_then_falls_back() {
        let (_buf, state, blocks) = state_with(&[16, 16, 48]);
        assert_eq!(state.find_fit(SizeClass::MINIMUM, 16), Some(blocks[1]));

        let (_buf, state, blocks) = state_with(&[96, 48]);
        assert_eq!(state.find_fit(SizeClass::MINIMUM, 16), Some(blocks[1]));
    }
}
