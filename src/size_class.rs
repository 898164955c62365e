//! Mapping between block sizes and segregated free-list buckets.

/// Number of segregated free lists.
pub const NUM_SIZE_CLASSES: usize = 12;

/// Inclusive upper bound of every class but the last, which is unbounded.
const UPPER_BOUNDS: [usize; NUM_SIZE_CLASSES - 1] =
    [16, 32, 48, 64, 96, 128, 256, 512, 1024, 2048, 4096];

/// A size class, i.e. the index of one segregated free list.
///
/// Class 0 holds only minimum-size blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    /// The class of minimum-size blocks.
    pub const MINIMUM: SizeClass = SizeClass(0);

    /// The unbounded class of the largest blocks.
    pub const LARGEST: SizeClass = SizeClass(NUM_SIZE_CLASSES as u8 - 1);

    /// The class a free block of `size` bytes is filed under, which is also
    /// the class a search for a `size`-byte block starts from: the class with
    /// the smallest upper bound that is at least `size`.
    #[inline]
    pub fn for_size(size: usize) -> SizeClass {
        SizeClass(UPPER_BOUNDS.partition_point(|&bound| bound < size) as u8)
    }

    /// This class's index, in `0..NUM_SIZE_CLASSES`.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The largest block size filed under this class, or `None` for the
    /// unbounded last class.
    pub fn upper_bound(self) -> Option<usize> {
        UPPER_BOUNDS.get(self.index()).copied()
    }

    /// This class followed by every larger one, in ascending order.
    pub fn and_larger(self) -> impl Iterator<Item = SizeClass> {
        (self.0..NUM_SIZE_CLASSES as u8).map(SizeClass)
    }

    /// Every class strictly larger than this one, in ascending order.
    pub fn larger(self) -> impl Iterator<Item = SizeClass> {
        (self.0 + 1..NUM_SIZE_CLASSES as u8).map(SizeClass)
    }

    /// All classes, in ascending order.
    pub fn all() -> impl Iterator<Item = SizeClass> {
        SizeClass::MINIMUM.and_larger()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn bucket_boundaries() {
        let cases = [
            (16, 0),
            (32, 1),
            (48, 2),
            (64, 3),
            (80, 4),
            (96, 4),
            (112, 5),
            (128, 5),
            (144, 6),
            (256, 6),
            (272, 7),
            (1024, 8),
            (2048, 9),
            (4096, 10),
            (4112, 11),
            (usize::MAX, 11),
        ];
        for (size, class) in cases {
            assert_eq!(SizeClass::for_size(size).index(), class, "size {size}");
        }
    }

    #[test]
    fn sizes_fit_under_their_upper_bound() {
        for size in (16..8192).step_by(16) {
            let class = SizeClass::for_size(size);
            if let Some(bound) = class.upper_bound() {
                assert!(size <= bound);
            }
            if class != SizeClass::MINIMUM {
                let below = SizeClass(class.0 - 1);
                assert!(size > below.upper_bound().unwrap());
            }
        }
    }

    #[test]
    fn iteration_order() {
        let larger: Vec<_> = SizeClass(9).larger().map(SizeClass::index).collect();
        assert_eq!(larger, [10, 11]);
        let from: Vec<_> = SizeClass(10).and_larger().map(SizeClass::index).collect();
        assert_eq!(from, [10, 11]);
        assert_eq!(SizeClass::all().count(), NUM_SIZE_CLASSES);
        assert_eq!(SizeClass::LARGEST.upper_bound(), None);
        assert_eq!(SizeClass::LARGEST.larger().count(), 0);
    }
}
