//! A mutex container similar to `std::sync::Mutex<T>` but parameterized over
//! any type `L` that implements the [`Lock`] trait, so that the heap can be
//! shared without assuming an operating system.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

/// A trait for providing mutual exclusion around a heap.
///
/// If you do not need to share the heap, and collections allocating from it,
/// across threads, you may use [`SingleThreadedLock`], which is the moral
/// equivalent of a `RefCell`.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then a [`LockedHeap`] using this
///   lock will be `Sync`, and therefore this lock must provide actual mutual
///   exclusion and prevent unsynchronized accesses.
///
/// * Even in single-threaded contexts, where real synchronization is not
///   required, this type must prevent recursive locking. Allocating from
///   inside an allocation (say, from a logger that allocates out of the same
///   heap) must not be able to observe the heap mid-update. The prevention
///   may be a panic, abort, or infinite loop.
///
/// [`LockedHeap`]: super::LockedHeap
pub unsafe trait Lock {
    /// Acquire the lock.
    ///
    /// If it is already held, this must panic, abort, or loop forever, and
    /// must not succeed.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// This is effectively a `RefCell`: it detects re-entrant use of the heap and
/// panics, but provides no synchronization, so a heap using it is not `Sync`.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "re-entrant use of a single-threaded heap");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new, unlocked `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking the mutex from another
// thread and getting a guard allows getting `&mut T`, which can be used to
// `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    /// Exclusive access without locking; the borrow checker already rules out
    /// any other user.
    #[inline]
    pub(super) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    pub(super) fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: the guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the guard holds the lock, and `&mut self` makes this the
        // only reference handed out through it.
        unsafe { &mut *self.mutex.value.get() }
    }
}
