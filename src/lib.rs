#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

mod arena;
mod block;
mod check;
mod coalesce;
mod config;
mod fit;
mod free_list;
mod heap;
mod place;
mod region;
mod size_class;

pub use block::{Header, ALIGNMENT, GENERAL_MIN_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use check::HeapCheckError;
pub use config::Config;
pub use heap::SegregatedHeap;
pub use region::{GrowHeap, MemoryRegion};
pub use size_class::{SizeClass, NUM_SIZE_CLASSES};

cfg_if! {
    if #[cfg(feature = "locked_heap")] {
        mod locked_heap;
        pub use locked_heap::{Lock, LockedHeap, SingleThreadedLock};
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
