//! Consistency checking for the heap and its free lists.

use core::fmt;

use crate::{
    block::{Block, Header, ALIGNMENT, MIN_BLOCK_SIZE, WORD},
    free_list::{next_link, prev_link},
    heap::{HeapState, SENTINEL_BYTES},
    size_class::SizeClass,
};

/// A violated heap invariant, as found by
/// [`SegregatedHeap::check_heap`](crate::SegregatedHeap::check_heap).
///
/// Offsets are in bytes from the start of the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeapCheckError {
    /// The word at offset zero is not a zero-size, allocated prologue.
    BadPrologue {
        /// The raw prologue word.
        word: u64,
    },

    /// The heap does not end with a zero-size, allocated epilogue header
    /// exactly one word before its end.
    BadEpilogue {
        /// Where the block walk ended.
        offset: usize,
    },

    /// A block header sits at an offset that would misalign its payload.
    Misaligned {
        /// The block's offset.
        offset: usize,
    },

    /// A block's size is too small, not a multiple of the alignment, or runs
    /// past the epilogue.
    BadSize {
        /// The block's offset.
        offset: usize,
        /// The size recorded in its header.
        size: usize,
    },

    /// A header's cached predecessor state disagrees with the actual
    /// predecessor.
    StalePredecessorState {
        /// The offset of the block with the stale header.
        offset: usize,
    },

    /// A free block's footer differs from its header.
    FooterMismatch {
        /// The block's offset.
        offset: usize,
    },

    /// Two physically adjacent blocks are both free.
    UncoalescedNeighbors {
        /// The offset of the second of the two blocks.
        offset: usize,
    },

    /// The block sizes plus the sentinels do not add up to the heap size.
    SizeMismatch {
        /// Sum of all block sizes plus the sentinel words.
        accounted: usize,
        /// Bytes obtained from the growth provider.
        heap_size: usize,
    },

    /// A free-list link points at something that is not a free block.
    BadLink {
        /// The size class whose list contains the link.
        class: usize,
        /// The linked offset.
        offset: usize,
    },

    /// A free block is filed under the wrong size class.
    WrongClass {
        /// The class whose list contains the block.
        class: usize,
        /// The block's offset.
        offset: usize,
    },

    /// A node's prev link does not point back at its list predecessor.
    BrokenBackLink {
        /// The size class of the list.
        class: usize,
        /// The node's offset.
        offset: usize,
    },

    /// A list's recorded head or tail is not its actual first or last node.
    BadListEnds {
        /// The size class of the list.
        class: usize,
    },

    /// A list has more nodes than there are free blocks, so it must loop.
    ListCycle {
        /// The size class of the list.
        class: usize,
    },

    /// The free lists do not index exactly the free blocks in the heap.
    FreeCountMismatch {
        /// Free blocks found by walking the heap.
        in_heap: usize,
        /// Nodes found by walking the free lists.
        in_lists: usize,
    },
}

impl fmt::Display for HeapCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapCheckError::BadPrologue { word } => write!(f, "bad prologue word {word:#x}"),
            HeapCheckError::BadEpilogue { offset } => {
                write!(f, "bad epilogue at {offset:#x}")
            }
            HeapCheckError::Misaligned { offset } => {
                write!(f, "block at {offset:#x} has a misaligned payload")
            }
            HeapCheckError::BadSize { offset, size } => {
                write!(f, "block at {offset:#x} has bad size {size:#x}")
            }
            HeapCheckError::StalePredecessorState { offset } => {
                write!(f, "block at {offset:#x} caches stale predecessor state")
            }
            HeapCheckError::FooterMismatch { offset } => {
                write!(f, "free block at {offset:#x} has a footer that differs from its header")
            }
            HeapCheckError::UncoalescedNeighbors { offset } => {
                write!(f, "free block at {offset:#x} follows another free block")
            }
            HeapCheckError::SizeMismatch {
                accounted,
                heap_size,
            } => write!(
                f,
                "blocks and sentinels account for {accounted:#x} bytes of a {heap_size:#x}-byte heap"
            ),
            HeapCheckError::BadLink { class, offset } => {
                write!(f, "class {class} links to {offset:#x}, which is not a free block")
            }
            HeapCheckError::WrongClass { class, offset } => {
                write!(f, "free block at {offset:#x} is filed under class {class}")
            }
            HeapCheckError::BrokenBackLink { class, offset } => {
                write!(f, "class {class} node at {offset:#x} has a broken prev link")
            }
            HeapCheckError::BadListEnds { class } => {
                write!(f, "class {class} has a bad head or tail")
            }
            HeapCheckError::ListCycle { class } => write!(f, "class {class} contains a cycle"),
            HeapCheckError::FreeCountMismatch { in_heap, in_lists } => write!(
                f,
                "{in_heap} free blocks in the heap but {in_lists} in the free lists"
            ),
        }
    }
}

impl core::error::Error for HeapCheckError {}

impl HeapState {
    /// Validate every structural invariant of the heap and its free lists.
    pub(crate) fn check(&self) -> Result<(), HeapCheckError> {
        let free_blocks = self.check_blocks()?;
        let mut in_lists = 0;
        for class in SizeClass::all() {
            in_lists += self.check_list(class, free_blocks)?;
        }
        if in_lists != free_blocks {
            return Err(HeapCheckError::FreeCountMismatch {
                in_heap: free_blocks,
                in_lists,
            });
        }
        Ok(())
    }

    /// Walk every block in address order, returning the number of free ones.
    fn check_blocks(&self) -> Result<usize, HeapCheckError> {
        let len = self.arena.len();
        if len < SENTINEL_BYTES {
            return Err(HeapCheckError::BadEpilogue { offset: len });
        }
        let prologue = self.arena.word(0);
        if prologue != Header::SENTINEL.encode() {
            return Err(HeapCheckError::BadPrologue { word: prologue });
        }

        let epilogue = len - WORD;
        let mut block = Block::FIRST;
        let mut accounted = SENTINEL_BYTES;
        let mut free_blocks = 0;
        let (mut prev_minimum, mut prev_allocated) = (false, true);

        loop {
            let offset = block.offset();
            let header = self.arena.header(block);
            if header.prev_minimum != prev_minimum || header.prev_allocated != prev_allocated {
                return Err(HeapCheckError::StalePredecessorState { offset });
            }

            if header.size == 0 {
                if offset != epilogue || !header.allocated {
                    return Err(HeapCheckError::BadEpilogue { offset });
                }
                break;
            }

            if (offset + WORD) % ALIGNMENT != 0 {
                return Err(HeapCheckError::Misaligned { offset });
            }
            if header.size < MIN_BLOCK_SIZE || header.size > epilogue - offset {
                return Err(HeapCheckError::BadSize {
                    offset,
                    size: header.size,
                });
            }

            if !header.allocated {
                if !prev_allocated {
                    return Err(HeapCheckError::UncoalescedNeighbors { offset });
                }
                if !header.is_minimum() && self.arena.footer(block, header.size) != header {
                    return Err(HeapCheckError::FooterMismatch { offset });
                }
                free_blocks += 1;
            }

            accounted += header.size;
            prev_minimum = header.is_minimum();
            prev_allocated = header.allocated;
            block = Block::at(offset + header.size);
        }

        if accounted != len {
            return Err(HeapCheckError::SizeMismatch {
                accounted,
                heap_size: len,
            });
        }
        Ok(free_blocks)
    }

    /// Walk one class's list, returning its length.
    ///
    /// Every node must look like a free block of the right class. Lists longer
    /// than `free_blocks` are reported as cycles.
    fn check_list(&self, class: SizeClass, free_blocks: usize) -> Result<usize, HeapCheckError> {
        let doubly_linked = class != SizeClass::MINIMUM;
        let mut count = 0;
        let mut prev = None;
        let mut cursor = self.lists.head(class);

        while let Some(node) = cursor {
            self.check_node(class, node)?;
            count += 1;
            if count > free_blocks {
                return Err(HeapCheckError::ListCycle {
                    class: class.index(),
                });
            }
            if doubly_linked && prev_link(&self.arena, node) != prev {
                return Err(HeapCheckError::BrokenBackLink {
                    class: class.index(),
                    offset: node.offset(),
                });
            }
            prev = Some(node);
            cursor = next_link(&self.arena, node);
        }

        if doubly_linked && self.lists.tail(class) != prev {
            return Err(HeapCheckError::BadListEnds {
                class: class.index(),
            });
        }
        Ok(count)
    }

    /// Check that `node`, found in the list for `class`, is a free block
    /// belonging there.
    fn check_node(&self, class: SizeClass, node: Block) -> Result<(), HeapCheckError> {
        let offset = node.offset();
        let bad_link = HeapCheckError::BadLink {
            class: class.index(),
            offset,
        };
        if offset < Block::FIRST.offset()
            || offset + WORD > self.arena.len() - WORD
            || (offset + WORD) % ALIGNMENT != 0
        {
            return Err(bad_link);
        }

        let header = self.arena.header(node);
        if header.allocated
            || header.size < MIN_BLOCK_SIZE
            || header.size > self.arena.len() - WORD - offset
        {
            return Err(bad_link);
        }
        if !header.is_minimum() && self.arena.footer(node, header.size) != header {
            return Err(bad_link);
        }
        if SizeClass::for_size(header.size) != class {
            return Err(HeapCheckError::WrongClass {
                class: class.index(),
                offset,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::state_from;

    #[test]
    fn accepts_a_consistent_heap() {
        let (_buf, state) = state_from(&[(16, false), (32, true), (64, false), (48, true)]);
        state.check().unwrap();
    }

    #[test]
    fn accepts_an_empty_heap() {
        let (_buf, state) = state_from(&[]);
        state.check().unwrap();
    }

    #[test]
    fn detects_bad_prologue() {
        let (_buf, mut state) = state_from(&[(32, true)]);
        state.arena.set_word(0, 0);
        assert_eq!(state.check(), Err(HeapCheckError::BadPrologue { word: 0 }));
    }

    #[test]
    fn detects_missing_epilogue() {
        let (_buf, mut state) = state_from(&[(32, true), (32, true)]);
        state.arena.set_header(
            Block::at(72),
            Header {
                size: 0,
                prev_minimum: false,
                prev_allocated: true,
                allocated: false,
            },
        );
        assert_eq!(state.check(), Err(HeapCheckError::BadEpilogue { offset: 72 }));
    }

    #[test]
    fn detects_oversized_block() {
        let (_buf, mut state) = state_from(&[(32, true), (32, true)]);
        state.arena.write_allocated(Block::FIRST, 96, false, true);
        assert_eq!(
            state.check(),
            Err(HeapCheckError::BadSize { offset: 8, size: 96 })
        );
    }

    #[test]
    fn detects_stale_predecessor_bits() {
        let (_buf, mut state) = state_from(&[(32, true), (16, true), (32, true)]);
        state.arena.set_prev_state(Block::at(56), false, true);
        assert_eq!(
            state.check(),
            Err(HeapCheckError::StalePredecessorState { offset: 56 })
        );
    }

    #[test]
    fn detects_footer_mismatch() {
        let (_buf, mut state) = state_from(&[(32, true), (64, false), (32, true)]);
        state.arena.set_word(96, 0);
        assert_eq!(state.check(), Err(HeapCheckError::FooterMismatch { offset: 40 }));
    }

    #[test]
    fn detects_uncoalesced_neighbors() {
        let (_buf, state) = state_from(&[(32, false), (64, false)]);
        assert_eq!(
            state.check(),
            Err(HeapCheckError::UncoalescedNeighbors { offset: 40 })
        );
    }

    #[test]
    fn detects_unfiled_free_block() {
        let (_buf, mut state) = state_from(&[(32, true), (64, true), (32, true)]);
        state.arena.write_free(Block::at(40), 64, false, true);
        state.arena.set_prev_state(Block::at(104), false, false);
        assert_eq!(
            state.check(),
            Err(HeapCheckError::FreeCountMismatch {
                in_heap: 1,
                in_lists: 0
            })
        );
    }

    #[test]
    fn detects_allocated_list_node() {
        let (_buf, mut state) = state_from(&[(32, true), (64, false), (32, true)]);
        state.arena.write_allocated(Block::at(40), 64, false, true);
        state.arena.set_prev_state(Block::at(104), false, true);
        assert_eq!(
            state.check(),
            Err(HeapCheckError::BadLink {
                class: SizeClass::for_size(64).index(),
                offset: 40
            })
        );
    }

    #[test]
    fn detects_wrong_class() {
        let (_buf, mut state) = state_from(&[(32, true), (64, false), (32, true)]);
        // Grow the free block into the allocated one after it, without
        // refiling it.
        state.arena.write_free(Block::at(40), 96, false, true);
        state.arena.set_prev_state(Block::at(136), false, false);
        assert_eq!(
            state.check(),
            Err(HeapCheckError::WrongClass {
                class: SizeClass::for_size(64).index(),
                offset: 40
            })
        );
    }

    #[test]
    fn detects_minimum_list_cycle() {
        let (_buf, mut state) = state_from(&[(16, false), (32, true), (16, false), (32, true)]);
        // Point the tail of the stack back at its head.
        state.arena.set_word(16, 56);
        assert_eq!(
            state.check(),
            Err(HeapCheckError::ListCycle {
                class: SizeClass::MINIMUM.index()
            })
        );
    }

    #[test]
    fn detects_broken_back_link() {
        let (_buf, mut state) = state_from(&[(64, false), (32, true), (64, false), (32, true)]);
        // List order is 104 then 8; clear 8's prev link.
        state.arena.set_word(24, 0);
        assert_eq!(
            state.check(),
            Err(HeapCheckError::BrokenBackLink {
                class: SizeClass::for_size(64).index(),
                offset: 8
            })
        );
    }
}
