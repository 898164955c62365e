//! Shared fuzzing and testing infrastructure for `seglist`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use seglist::{Config, MemoryRegion, SegregatedHeap, ALIGNMENT};
use std::{alloc::System, cmp, collections::BTreeMap, ptr::NonNull};

/// A requested size, in bytes.
//
// Note: this is a newtype rather than a bare `usize` so that it can have its
// own default mutator, biased towards the sizes where the allocator changes
// behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// Sizes right at the edges of the block-size rounding and the size classes,
/// plus one that overflows every computation.
const INTERESTING_SIZES: &[usize] = &[
    0,
    1,
    8,
    9,
    24,
    25,
    48,
    112,
    496,
    2032,
    4080,
    4096,
    usize::MAX,
];

#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 8192 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        // Any size in range.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                size.0
            } else {
                self.max_size
            };
            size.0 = ctx.rng().gen_index(max_size.saturating_add(1)).unwrap_or(0);
            Ok(())
        })?;

        // A size at some boundary.
        if !c.shrink() {
            c.mutation(|ctx| {
                size.0 = ctx.rng().choose(INTERESTING_SIZES).copied().unwrap();
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(0..=self.max_size).generate(context)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Free { id: u32 },
    Realloc { id: u32, size: Size },
    AllocZeroed { id: u32, count: Size, size: Size },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::AllocZeroed {
                    id: ctx.rng().gen_u32(),
                    count: Size(m::range(0..=64).generate(ctx)?),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } | Op::AllocZeroed { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::Free { id }
                    | Op::Realloc { id, .. }
                    | Op::AllocZeroed { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Free an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let realloc_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(realloc_index, Op::Realloc { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

type Heap = SegregatedHeap<MemoryRegion<System>>;

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh heap whose memory region
    /// holds `capacity` bytes.
    pub fn run(&self, capacity: usize) -> Result<(), String> {
        self.run_with_config(capacity, Config::default())
    }

    /// Like [`Ops::run`], but the fresh heap is built with `config`.
    pub fn run_with_config(&self, capacity: usize, config: Config) -> Result<(), String> {
        let region = MemoryRegion::new(System, capacity)
            .map_err(|_| format!("failed to reserve a {capacity}-byte heap region"))?;
        self.run_with_heap(SegregatedHeap::new(region, config))
    }

    /// Run these test operations against the given heap.
    pub fn run_with_heap(&self, mut heap: Heap) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::default();

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size } => {
                    free(&mut heap, &mut live, id)?;
                    let heap_size = heap.heap_size();
                    let ptr = heap.allocate(size.0);
                    new_alloc(&heap, &mut live, id, ptr, size.0, false, heap_size)?;
                }

                Op::Free { id } => {
                    if live.map.contains_key(&id) {
                        free(&mut heap, &mut live, id)?;
                    } else {
                        unsafe { heap.release(None) };
                    }
                }

                Op::Realloc { id, size } => {
                    let Some(old) = live.remove(id) else {
                        let heap_size = heap.heap_size();
                        let ptr = unsafe { heap.reallocate(None, size.0) };
                        new_alloc(&heap, &mut live, id, ptr, size.0, false, heap_size)?;
                        continue;
                    };
                    check_contents(&old)?;

                    let heap_size = heap.heap_size();
                    let new = unsafe { heap.reallocate(Some(old.ptr), size.0) };
                    match new {
                        _ if size.0 == 0 => {
                            ensure!(new.is_none(), "reallocating to zero bytes returned {new:?}");
                        }
                        None => {
                            ensure!(
                                heap.heap_size() == heap_size,
                                "failed reallocation changed the heap size"
                            );
                            check_contents(&old)?;
                            live.insert(id, old);
                        }
                        Some(ptr) => {
                            let kept = cmp::min(old.size, size.0);
                            let copied = LiveAlloc {
                                ptr,
                                size: kept,
                                zeroed: old.zeroed,
                            };
                            ensure!(
                                check_contents(&copied).is_ok(),
                                "reallocation did not preserve the first {kept} bytes"
                            );
                            new_alloc(&heap, &mut live, id, new, size.0, false, heap_size)?;
                        }
                    }
                }

                Op::AllocZeroed { id, count, size } => {
                    free(&mut heap, &mut live, id)?;
                    let heap_size = heap.heap_size();
                    let ptr = heap.allocate_zeroed(count.0, size.0);
                    match count.0.checked_mul(size.0) {
                        None => {
                            ensure!(ptr.is_none(), "overflowing zeroed allocation returned {ptr:?}");
                        }
                        Some(bytes) => {
                            new_alloc(&heap, &mut live, id, ptr, bytes, true, heap_size)?;
                        }
                    }
                }
            }

            if let Err(e) = heap.check_heap() {
                return Err(format!("heap check failed after {op:?}: {e}"));
            }
            ensure!(
                heap.heap_size() == heap.growth().len(),
                "heap accounts for {} bytes but obtained {}",
                heap.heap_size(),
                heap.growth().len()
            );
        }

        // Finally, free any remaining live allocations.
        let ids: Vec<u32> = live.map.keys().copied().collect();
        for id in ids {
            free(&mut heap, &mut live, id)?;
        }
        if let Err(e) = heap.check_heap() {
            return Err(format!("heap check failed after freeing everything: {e}"));
        }

        Ok(())
    }
}

/// Free the live allocation with the given id, if any, after checking that
/// its contents were left alone.
fn free(heap: &mut Heap, live: &mut LiveMap, id: u32) -> Result<(), String> {
    let Some(alloc) = live.remove(id) else {
        return Ok(());
    };
    log::debug!("freeing id{id} -> {alloc:?}");
    check_contents(&alloc)?;
    unsafe {
        alloc.ptr.as_ptr().write_bytes(FREE_POISON_PATTERN, alloc.size);
        heap.release(Some(alloc.ptr));
    }
    Ok(())
}

/// Process the outcome of an allocation request for `size` bytes, checking
/// properties and inserting it into the live set.
///
/// `heap_size` is the heap size before the request.
fn new_alloc(
    heap: &Heap,
    live: &mut LiveMap,
    id: u32,
    ptr: Option<NonNull<u8>>,
    size: usize,
    zeroed: bool,
    heap_size: usize,
) -> Result<(), String> {
    let Some(ptr) = ptr else {
        // Requesting zero bytes never touches the heap. Any other failure must
        // leave an initialized heap as it was.
        if size == 0 || heap_size != 0 {
            ensure!(
                heap.heap_size() == heap_size,
                "failed allocation of {size} bytes changed the heap size"
            );
        }
        return Ok(());
    };
    ensure!(size != 0, "zero-size allocation returned {ptr:p}");

    let usable = unsafe { heap.payload_size(ptr) };
    log::debug!("new allocation: id{id} -> {{ address: {ptr:p}, size: {size}, usable: {usable} }}");

    ensure!(
        ptr.as_ptr() as usize % ALIGNMENT == 0,
        "{ptr:p} is not {ALIGNMENT}-byte aligned"
    );
    ensure!(usable >= size, "{ptr:p} has {usable} usable bytes, {size} requested");

    let start = ptr.as_ptr() as usize;
    let end = start + usable;
    for other in live.map.values() {
        let other_start = other.ptr.as_ptr() as usize;
        let other_end = other_start + unsafe { heap.payload_size(other.ptr) };
        ensure!(
            end <= other_start || other_end <= start,
            "two distinct live allocations should never overlap",
        );
    }

    let alloc = LiveAlloc { ptr, size, zeroed };
    if zeroed {
        check_contents(&alloc)?;
    } else {
        unsafe { ptr.as_ptr().write_bytes(LIVE_POISON_PATTERN, size) };
    }
    live.insert(id, alloc);
    Ok(())
}

/// Check that a live allocation still holds what we put there.
fn check_contents(alloc: &LiveAlloc) -> Result<(), String> {
    let slice = unsafe { std::slice::from_raw_parts(alloc.ptr.as_ptr(), alloc.size) };
    let expected = if alloc.zeroed { 0 } else { LIVE_POISON_PATTERN };
    ensure!(
        slice.iter().all(|b| *b == expected),
        "allocation at {:p} does not hold {expected:#x} throughout its {} bytes",
        alloc.ptr,
        alloc.size
    );
    Ok(())
}

// We fill our non-zeroed memory with a poison pattern, so that a heap which
// hands out recycled memory as "zeroed", or corrupts live payloads with its
// own metadata, does not go unnoticed.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live allocation.
#[derive(Debug)]
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// Requested size at allocation time.
    size: usize,
    /// Is this allocation zeroed or not? If not, then it is filled with
    /// `LIVE_POISON_PATTERN`.
    zeroed: bool,
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,
}

impl LiveMap {
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and free old entries before adding new ones"
        );
    }

    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        self.map.remove(&id)
    }
}
