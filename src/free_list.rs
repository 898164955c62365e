//! The segregated free lists.
//!
//! Links are stored intrusively in the payload of each free block as arena
//! offsets, with zero meaning "none" (offset zero is the prologue word, which
//! is never a block header).
//!
//! Class 0 holds minimum-size blocks, whose single payload word only has room
//! for a next link. It is a singly-linked LIFO stack: pushing and popping the
//! head are O(1), but removing an arbitrary node needs a scan for its
//! predecessor. The remaining classes are doubly linked with both a head and a
//! tail, so any node can be unlinked in O(1).

use crate::{
    arena::Arena,
    block::{Block, WORD},
    size_class::{SizeClass, NUM_SIZE_CLASSES},
};

/// Offset of the next link from the block's header.
const NEXT: usize = WORD;

/// Offset of the prev link from the block's header. Absent in class 0.
const PREV: usize = 2 * WORD;

#[inline]
fn read_link(arena: &Arena, offset: usize) -> Option<Block> {
    match arena.word(offset) {
        0 => None,
        link => Some(Block::at(link as usize)),
    }
}

#[inline]
fn write_link(arena: &mut Arena, offset: usize, link: Option<Block>) {
    arena.set_word(offset, link.map_or(0, |block| block.offset() as u64));
}

/// The free block after `block` in its list.
#[inline]
pub(crate) fn next_link(arena: &Arena, block: Block) -> Option<Block> {
    read_link(arena, block.offset() + NEXT)
}

/// The free block before `block` in its list. Must not be called on
/// minimum-size blocks.
#[inline]
pub(crate) fn prev_link(arena: &Arena, block: Block) -> Option<Block> {
    read_link(arena, block.offset() + PREV)
}

#[inline]
fn set_next(arena: &mut Arena, block: Block, next: Option<Block>) {
    write_link(arena, block.offset() + NEXT, next);
}

#[inline]
fn set_prev(arena: &mut Arena, block: Block, prev: Option<Block>) {
    write_link(arena, block.offset() + PREV, prev);
}

/// A snapshot of a node's list neighbors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Links {
    pub(crate) prev: Option<Block>,
    pub(crate) next: Option<Block>,
}

impl Links {
    /// Account for `removed`, whose links were `removed_links`, having been
    /// unlinked after this snapshot was taken.
    ///
    /// Without this, unlinking two adjacent nodes from the same list using
    /// snapshots taken up front would splice the first one back in.
    pub(crate) fn bypass(&mut self, removed: Block, removed_links: Links) {
        if self.prev == Some(removed) {
            self.prev = removed_links.prev;
        }
        if self.next == Some(removed) {
            self.next = removed_links.next;
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    head: Option<Block>,
    tail: Option<Block>,
}

/// Head (and tail) slots of every size class.
#[derive(Debug, Default)]
pub(crate) struct FreeLists {
    /// Head of the singly-linked class 0 list.
    minimum: Option<Block>,

    /// Classes `1..NUM_SIZE_CLASSES`, indexed by class minus one.
    buckets: [Bucket; NUM_SIZE_CLASSES - 1],
}

impl FreeLists {
    pub(crate) const fn new() -> Self {
        FreeLists {
            minimum: None,
            buckets: [Bucket {
                head: None,
                tail: None,
            }; NUM_SIZE_CLASSES - 1],
        }
    }

    #[inline]
    fn bucket(&self, class: SizeClass) -> &Bucket {
        debug_assert_ne!(class, SizeClass::MINIMUM);
        &self.buckets[class.index() - 1]
    }

    #[inline]
    fn bucket_mut(&mut self, class: SizeClass) -> &mut Bucket {
        debug_assert_ne!(class, SizeClass::MINIMUM);
        &mut self.buckets[class.index() - 1]
    }

    pub(crate) fn head(&self, class: SizeClass) -> Option<Block> {
        if class == SizeClass::MINIMUM {
            self.minimum
        } else {
            self.bucket(class).head
        }
    }

    /// The tail of a doubly-linked class. Class 0 does not track its tail.
    pub(crate) fn tail(&self, class: SizeClass) -> Option<Block> {
        if class == SizeClass::MINIMUM {
            None
        } else {
            self.bucket(class).tail
        }
    }

    /// Snapshot `block`'s neighbors in the list for `class`.
    pub(crate) fn links(&self, arena: &Arena, class: SizeClass, block: Block) -> Links {
        Links {
            prev: if class == SizeClass::MINIMUM {
                None
            } else {
                prev_link(arena, block)
            },
            next: next_link(arena, block),
        }
    }

    /// Push a minimum-size block onto the class 0 stack.
    pub(crate) fn push_minimum(&mut self, arena: &mut Arena, block: Block) {
        set_next(arena, block, self.minimum);
        self.minimum = Some(block);
    }

    /// Remove a minimum-size block from the class 0 stack.
    ///
    /// O(1) at the head, otherwise a linear scan for the node's predecessor.
    pub(crate) fn remove_minimum(&mut self, arena: &mut Arena, block: Block) {
        let next = next_link(arena, block);
        if self.minimum == Some(block) {
            self.minimum = next;
            return;
        }

        let mut cursor = self.minimum;
        while let Some(node) = cursor {
            let node_next = next_link(arena, node);
            if node_next == Some(block) {
                set_next(arena, node, next);
                return;
            }
            cursor = node_next;
        }

        debug_assert!(
            false,
            "minimum-size block at {:#x} is not in its free list",
            block.offset()
        );
    }

    /// Insert `block` at the head of a doubly-linked class.
    pub(crate) fn push(&mut self, arena: &mut Arena, class: SizeClass, block: Block) {
        let bucket = self.bucket_mut(class);
        match bucket.head {
            None => {
                bucket.head = Some(block);
                bucket.tail = Some(block);
                set_next(arena, block, None);
                set_prev(arena, block, None);
            }
            Some(head) => {
                set_prev(arena, head, Some(block));
                set_next(arena, block, Some(head));
                set_prev(arena, block, None);
                bucket.head = Some(block);
            }
        }
    }

    /// Insert `block` immediately before `successor`, which must already be in
    /// the list for `class`.
    pub(crate) fn insert_before(
        &mut self,
        arena: &mut Arena,
        class: SizeClass,
        block: Block,
        successor: Block,
    ) {
        let prev = prev_link(arena, successor);
        set_prev(arena, block, prev);
        set_next(arena, block, Some(successor));
        set_prev(arena, successor, Some(block));
        match prev {
            Some(prev) => set_next(arena, prev, Some(block)),
            None => {
                debug_assert_eq!(self.bucket(class).head, Some(successor));
                self.bucket_mut(class).head = Some(block);
            }
        }
    }

    /// Unlink `block` from a doubly-linked class given a snapshot of its
    /// neighbors.
    pub(crate) fn unlink(&mut self, arena: &mut Arena, class: SizeClass, block: Block, links: Links) {
        let bucket = self.bucket_mut(class);
        match (links.prev, links.next) {
            // Only node: the list becomes empty.
            (None, None) => {
                debug_assert_eq!(bucket.head, Some(block));
                debug_assert_eq!(bucket.tail, Some(block));
                bucket.head = None;
                bucket.tail = None;
            }
            (None, Some(next)) => {
                debug_assert_eq!(bucket.head, Some(block));
                bucket.head = Some(next);
                set_prev(arena, next, None);
            }
            (Some(prev), None) => {
                debug_assert_eq!(bucket.tail, Some(block));
                bucket.tail = Some(prev);
                set_next(arena, prev, None);
            }
            (Some(prev), Some(next)) => {
                set_next(arena, prev, Some(next));
                set_prev(arena, next, Some(prev));
            }
        }
    }

    /// Remove `block`, filed under `class`, from its list given a snapshot of
    /// its neighbors.
    pub(crate) fn remove(&mut self, arena: &mut Arena, class: SizeClass, block: Block, links: Links) {
        if class == SizeClass::MINIMUM {
            self.remove_minimum(arena, block);
        } else {
            self.unlink(arena, class, block, links);
        }
    }

    /// File a free block of `size` bytes under its class.
    ///
    /// If `hint` is a node of the same class, the block goes right before it,
    /// keeping the hint's position in the list; otherwise it goes to the head.
    pub(crate) fn insert(&mut self, arena: &mut Arena, block: Block, size: usize, hint: Option<Block>) {
        let class = SizeClass::for_size(size);
        if class == SizeClass::MINIMUM {
            self.push_minimum(arena, block);
            return;
        }

        match hint {
            Some(successor) if SizeClass::for_size(arena.header(successor).size) == class => {
                debug_assert!(!arena.header(successor).allocated);
                self.insert_before(arena, class, block, successor);
            }
            _ => self.push(arena, class, block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::tests::vec_arena;
    use std::vec::Vec;

    fn collect(lists: &FreeLists, arena: &Arena, class: SizeClass) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = lists.head(class);
        while let Some(block) = cursor {
            out.push(block.offset());
            cursor = next_link(arena, block);
        }
        out
    }

    fn collect_backwards(lists: &FreeLists, arena: &Arena, class: SizeClass) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = lists.tail(class);
        while let Some(block) = cursor {
            out.push(block.offset());
            cursor = prev_link(arena, block);
        }
        out
    }

    #[test]
    fn doubly_linked_removal_positions() {
        let (_buf, mut arena) = vec_arena(64);
        let mut lists = FreeLists::new();
        let class = SizeClass::for_size(64);
        let blocks = [Block::at(8), Block::at(72), Block::at(136), Block::at(200)];
        for block in blocks {
            arena.write_free(block, 64, false, true);
            lists.push(&mut arena, class, block);
        }
        assert_eq!(collect(&lists, &arena, class), [200, 136, 72, 8]);
        assert_eq!(collect_backwards(&lists, &arena, class), [8, 72, 136, 200]);

        // Interior.
        let links = lists.links(&arena, class, blocks[1]);
        lists.unlink(&mut arena, class, blocks[1], links);
        assert_eq!(collect(&lists, &arena, class), [200, 136, 8]);

        // Head.
        let links = lists.links(&arena, class, blocks[3]);
        lists.unlink(&mut arena, class, blocks[3], links);
        assert_eq!(collect(&lists, &arena, class), [136, 8]);

        // Tail.
        let links = lists.links(&arena, class, blocks[0]);
        lists.unlink(&mut arena, class, blocks[0], links);
        assert_eq!(collect(&lists, &arena, class), [136]);
        assert_eq!(lists.tail(class), Some(blocks[2]));

        // Only node.
        let links = lists.links(&arena, class, blocks[2]);
        lists.unlink(&mut arena, class, blocks[2], links);
        assert_eq!(lists.head(class), None);
        assert_eq!(lists.tail(class), None);
    }

    #[test]
    fn snapshots_of_adjacent_nodes_stay_consistent() {
        let (_buf, mut arena) = vec_arena(64);
        let mut lists = FreeLists::new();
        let class = SizeClass::for_size(64);
        let blocks = [Block::at(8), Block::at(72), Block::at(136)];
        for block in blocks {
            arena.write_free(block, 64, false, true);
            lists.push(&mut arena, class, block);
        }
        // List order: 136, 72, 8. Remove the two adjacent nodes 72 and 8
        // using snapshots taken before either removal.
        let first = lists.links(&arena, class, blocks[1]);
        let mut second = lists.links(&arena, class, blocks[0]);
        lists.unlink(&mut arena, class, blocks[1], first);
        second.bypass(blocks[1], first);
        lists.unlink(&mut arena, class, blocks[0], second);

        assert_eq!(collect(&lists, &arena, class), [136]);
        assert_eq!(collect_backwards(&lists, &arena, class), [136]);
    }

    #[test]
    fn insert_before_hint() {
        let (_buf, mut arena) = vec_arena(64);
        let mut lists = FreeLists::new();
        let class = SizeClass::for_size(64);
        let a = Block::at(8);
        let b = Block::at(72);
        let c = Block::at(136);
        for block in [a, b, c] {
            arena.write_free(block, 64, false, true);
        }
        lists.push(&mut arena, class, a);
        lists.push(&mut arena, class, b);

        lists.insert(&mut arena, c, 64, Some(a));
        assert_eq!(collect(&lists, &arena, class), [72, 136, 8]);
        assert_eq!(collect_backwards(&lists, &arena, class), [8, 136, 72]);

        let links = lists.links(&arena, class, c);
        lists.unlink(&mut arena, class, c, links);
        lists.insert(&mut arena, c, 64, Some(b));
        assert_eq!(collect(&lists, &arena, class), [136, 72, 8]);
    }

    #[test]
    fn hint_from_another_class_falls_back_to_head() {
        let (_buf, mut arena) = vec_arena(64);
        let mut lists = FreeLists::new();
        let small = Block::at(8);
        let big = Block::at(72);
        arena.write_free(small, 32, false, true);
        arena.write_free(big, 128, false, true);
        lists.insert(&mut arena, small, 32, None);
        lists.insert(&mut arena, big, 128, Some(small));

        let class = SizeClass::for_size(128);
        assert_eq!(collect(&lists, &arena, class), [72]);
        assert_eq!(collect(&lists, &arena, SizeClass::for_size(32)), [8]);
    }

    #[test]
    fn minimum_stack_is_lifo_and_scans_on_removal() {
        let (_buf, mut arena) = vec_arena(16);
        let mut lists = FreeLists::new();
        let blocks = [Block::at(8), Block::at(24), Block::at(40), Block::at(56)];
        for block in blocks {
            arena.write_free(block, 16, false, true);
            lists.insert(&mut arena, block, 16, None);
        }
        let class = SizeClass::MINIMUM;
        assert_eq!(collect(&lists, &arena, class), [56, 40, 24, 8]);

        lists.remove_minimum(&mut arena, blocks[1]);
        assert_eq!(collect(&lists, &arena, class), [56, 40, 8]);
        lists.remove_minimum(&mut arena, blocks[3]);
        assert_eq!(collect(&lists, &arena, class), [40, 8]);
        lists.remove_minimum(&mut arena, blocks[0]);
        assert_eq!(collect(&lists, &arena, class), [40]);
        lists.remove_minimum(&mut arena, blocks[2]);
        assert_eq!(lists.head(class), None);
    }
}
