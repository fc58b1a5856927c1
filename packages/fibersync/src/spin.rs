//! Busy-waiting mutual exclusion for very short critical sections.

use crossbeam_utils::{Backoff, CachePadded};
use std::{
    cell::UnsafeCell,
    fmt::{self, Debug, Formatter},
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicBool,
        Ordering::{Acquire, Relaxed, Release},
    },
};


/// Mutual exclusion lock that spins instead of parking
///
/// Critical sections guarded by a `Spinlock` must be bounded and must never suspend the current
/// context while the lock is held. The only sanctioned way to suspend with the lock held is to
/// hand the guard to [`Context::suspend`](crate::Context::suspend) or
/// [`Context::wait_until`](crate::Context::wait_until), which release it at the suspend
/// boundary.
pub struct Spinlock<T: ?Sized> {
    // the flag gets its own cache line so that spinning readers don't bounce the guarded data.
    locked: CachePadded<AtomicBool>,
    value: UnsafeCell<T>,
}

/// RAII guard for a [`Spinlock`]. Releases the lock when dropped.
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<T> Spinlock<T> {
    /// Construct unlocked.
    pub const fn new(value: T) -> Self {
        Spinlock {
            locked: CachePadded::new(AtomicBool::new(false)),
            value: UnsafeCell::new(value),
        }
    }

    /// Consume the lock and return the guarded value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Acquire the lock, spinning with exponential backoff while it is contended.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // test-and-test-and-set: wait on a plain load so contended waiters share the line
            while self.locked.load(Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Acquire the lock if it is free right now.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Acquire, Relaxed)
            .ok()
            .map(|_| SpinlockGuard { lock: self })
    }

    /// Whether the lock is currently held by someone. Only useful for diagnostics.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }

    /// Access the guarded value through a unique borrow, which needs no locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Spinlock::new(T::default())
    }
}

impl<T: ?Sized + Debug> Debug for Spinlock<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut d = f.debug_struct("Spinlock");
        match self.try_lock() {
            Some(guard) => d.field("value", &&*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}

impl<'a, T: ?Sized> Deref for SpinlockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // safety: the guard exists only while the flag is held
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // safety: the guard exists only while the flag is held, and is not Clone
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

impl<'a, T: ?Sized + Debug> Debug for SpinlockGuard<'a, T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

unsafe impl<'a, T: ?Sized + Sync> Sync for SpinlockGuard<'a, T> {}
