//! Condition variable over an externally supplied lock.

use crate::{
    context::Context,
    spin::{Spinlock, SpinlockGuard},
    wait_queue::{park, WaitQueue, Wakeup},
};
use std::{
    fmt::{self, Debug, Formatter},
    ops::DerefMut,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};


/// A lock a [`ConditionVariable`] can release and re-acquire around a wait
pub trait Lockable {
    /// The protected value.
    type Target: ?Sized;

    /// Proof of holding the lock. Releases it on drop.
    type Guard<'a>: DerefMut<Target = Self::Target>
    where
        Self: 'a;

    /// Acquire the lock, blocking as the lock itself does.
    fn lock(&self) -> Self::Guard<'_>;
}

impl<T: ?Sized> Lockable for Mutex<T> {
    type Target = T;
    type Guard<'a> = MutexGuard<'a, T> where Self: 'a;

    // poisoning is the waiter's business, not the condition variable's
    fn lock(&self) -> MutexGuard<'_, T> {
        Mutex::lock(self).unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ?Sized> Lockable for Spinlock<T> {
    type Target = T;
    type Guard<'a> = SpinlockGuard<'a, T> where Self: 'a;

    fn lock(&self) -> SpinlockGuard<'_, T> {
        Spinlock::lock(self)
    }
}


/// Whether a timed wait ended because of its deadline
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CvStatus {
    /// Woken by a notification, or the awaited condition was met.
    NoTimeout,
    /// The deadline passed first.
    Timeout,
}


/// Condition variable
///
/// Waiters park in a FIFO [`WaitQueue`] and are woken by [`notify_one`](Self::notify_one) or
/// [`notify_all`](Self::notify_all). The external lock is released only once the waiter is
/// queued, so a notification issued by someone holding that lock after the waiter released it is
/// never lost.
///
/// A wait returns only when the waiter was dequeued by a notifier, or its deadline passed, so
/// there are no spurious wakeups. If a notification and the deadline coincide, the notification
/// wins. Notifying does not require holding the external lock.
pub struct ConditionVariable {
    waiters: Spinlock<WaitQueue>,
}

impl ConditionVariable {
    /// Construct with no waiters.
    pub const fn new() -> Self {
        ConditionVariable {
            waiters: Spinlock::new(WaitQueue::new()),
        }
    }

    /// Wake the longest-waiting waiter, if any.
    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().pop();
        if let Some(waiter) = waiter {
            waiter.set_ready();
        }
    }

    /// Wake every current waiter, in the order they started waiting.
    pub fn notify_all(&self) {
        let waiters = self.waiters.lock().drain();
        if !waiters.is_empty() {
            trace!(count = waiters.len(), "notifying all waiters");
        }
        for waiter in waiters {
            waiter.set_ready();
        }
    }

    /// Release `guard`, wait for a notification, and re-acquire `lock`
    ///
    /// `guard` must be a guard of `lock`.
    pub fn wait<'a, L: Lockable>(&self, lock: &'a L, guard: L::Guard<'a>) -> L::Guard<'a> {
        self.wait_inner(lock, guard, None).0
    }

    /// Wait until `condition` returns false
    ///
    /// The condition is checked with the lock held, before the first wait and after every
    /// wakeup.
    pub fn wait_while<'a, L, F>(
        &self,
        lock: &'a L,
        mut guard: L::Guard<'a>,
        mut condition: F,
    ) -> L::Guard<'a>
    where
        L: Lockable,
        F: FnMut(&mut L::Target) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(lock, guard);
        }
        guard
    }

    /// Like [`wait`](Self::wait), but give up once `deadline` passes.
    pub fn wait_until<'a, L: Lockable>(
        &self,
        lock: &'a L,
        guard: L::Guard<'a>,
        deadline: Instant,
    ) -> (L::Guard<'a>, CvStatus) {
        self.wait_inner(lock, guard, Some(deadline))
    }

    /// Like [`wait`](Self::wait), but give up once `timeout` elapses.
    pub fn wait_for<'a, L: Lockable>(
        &self,
        lock: &'a L,
        guard: L::Guard<'a>,
        timeout: Duration,
    ) -> (L::Guard<'a>, CvStatus) {
        self.wait_inner(lock, guard, Instant::now().checked_add(timeout))
    }

    /// Like [`wait_while`](Self::wait_while), but give up once `timeout` elapses
    ///
    /// Returns [`CvStatus::Timeout`] only if the condition still holds when giving up.
    pub fn wait_timeout_while<'a, L, F>(
        &self,
        lock: &'a L,
        mut guard: L::Guard<'a>,
        timeout: Duration,
        mut condition: F,
    ) -> (L::Guard<'a>, CvStatus)
    where
        L: Lockable,
        F: FnMut(&mut L::Target) -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        while condition(&mut *guard) {
            let (next, status) = self.wait_inner(lock, guard, deadline);
            guard = next;
            if status == CvStatus::Timeout {
                // last look, the condition may have cleared just as the deadline passed
                let status = if condition(&mut *guard) {
                    CvStatus::Timeout
                } else {
                    CvStatus::NoTimeout
                };
                return (guard, status);
            }
        }
        (guard, CvStatus::NoTimeout)
    }

    fn wait_inner<'a, L: Lockable>(
        &self,
        lock: &'a L,
        guard: L::Guard<'a>,
        deadline: Option<Instant>,
    ) -> (L::Guard<'a>, CvStatus) {
        let ctx = Context::active();
        // take the queue lock before releasing the external lock. a notifier that acquires the
        // external lock after us then has to get through the queue lock, and by then we are queued.
        let waiters = self.waiters.lock();
        drop(guard);
        let wakeup = park(&self.waiters, waiters, |q| q, &ctx, deadline);
        let status = match wakeup {
            Wakeup::Notified => CvStatus::NoTimeout,
            Wakeup::TimedOut => CvStatus::Timeout,
        };
        (lock.lock(), status)
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        ConditionVariable::new()
    }
}

impl Debug for ConditionVariable {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiters)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    // block until `n` contexts are parked in the condition variable
    fn await_waiters(cv: &ConditionVariable, n: usize) {
        while cv.waiters.lock().len() < n {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn notify_without_waiters_is_noop() {
        let cv = ConditionVariable::new();
        cv.notify_one();
        cv.notify_all();
        assert!(cv.waiters.lock().is_empty());
    }

    #[test]
    fn notify_one_wakes_in_fifo_order() {
        let cv = ConditionVariable::new();
        let woken = Mutex::new(Vec::new());
        thread::scope(|s| {
            for i in 0..3 {
                let (cv, woken) = (&cv, &woken);
                s.spawn(move || {
                    let guard = woken.lock().unwrap();
                    let mut guard = cv.wait(woken, guard);
                    guard.push(i);
                });
                await_waiters(&cv, i + 1);
            }

            for i in 0..3 {
                cv.notify_one();
                while woken.lock().unwrap().len() < i + 1 {
                    thread::sleep(Duration::from_millis(1));
                }
                // exactly one more woke
                thread::sleep(Duration::from_millis(20));
                assert_eq!(woken.lock().unwrap().len(), i + 1);
            }
        });
        assert_eq!(woken.into_inner().unwrap(), [0, 1, 2]);
    }

    #[test]
    fn notify_all_wakes_every_waiter() {
        let cv = Arc::new(ConditionVariable::new());
        let lock = Arc::new(Mutex::new(()));
        let joins = (0..4)
            .map(|_| {
                let (cv, lock) = (Arc::clone(&cv), Arc::clone(&lock));
                thread::spawn(move || {
                    let guard = lock.lock().unwrap();
                    let (_guard, status) = cv.wait_for(&*lock, guard, Duration::from_secs(10));
                    status
                })
            })
            .collect::<Vec<_>>();
        await_waiters(&cv, 4);
        cv.notify_all();
        for join in joins {
            assert_eq!(join.join().unwrap(), CvStatus::NoTimeout);
        }
        assert!(cv.waiters.lock().is_empty());
    }

    #[test]
    fn wait_for_times_out_and_withdraws() {
        let cv = ConditionVariable::new();
        let lock = Mutex::new(5);
        let start = Instant::now();
        let (guard, status) = cv.wait_for(&lock, lock.lock().unwrap(), Duration::from_millis(20));
        assert_eq!(status, CvStatus::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(20));
        // the lock is held again on return
        assert_eq!(*guard, 5);
        assert!(lock.try_lock().is_err());
        drop(guard);
        assert!(cv.waiters.lock().is_empty());
    }

    #[test]
    fn wait_while_with_mutex() {
        let cv = ConditionVariable::new();
        let ready = Mutex::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                *ready.lock().unwrap() = true;
                cv.notify_one();
            });
            let guard = cv.wait_while(&ready, ready.lock().unwrap(), |ready| !*ready);
            assert!(*guard);
        });
    }

    #[test]
    fn wait_timeout_while_reports_outcome() {
        let cv = ConditionVariable::new();
        let count = Mutex::new(0u32);

        // nobody changes the condition
        let (guard, status) =
            cv.wait_timeout_while(&count, count.lock().unwrap(), Duration::from_millis(10), |c| *c < 3);
        assert_eq!(status, CvStatus::Timeout);
        drop(guard);

        // the condition clears before the deadline
        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..3 {
                    thread::sleep(Duration::from_millis(5));
                    *count.lock().unwrap() += 1;
                    cv.notify_all();
                }
            });
            let (guard, status) = cv.wait_timeout_while(
                &count,
                count.lock().unwrap(),
                Duration::from_secs(10),
                |c| *c < 3,
            );
            assert_eq!(status, CvStatus::NoTimeout);
            assert_eq!(*guard, 3);
        });
    }

    #[test]
    fn spinlock_as_external_lock() {
        let cv = ConditionVariable::new();
        let value = Spinlock::new(None);
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let guard = cv.wait_while(&value, value.lock(), |value| value.is_none());
                guard.unwrap()
            });
            await_waiters(&cv, 1);
            *value.lock() = Some("done");
            cv.notify_all();
            assert_eq!(waiter.join().unwrap(), "done");
        });
    }

    #[test]
    fn elapsed_deadline_still_reacquires() {
        let cv = ConditionVariable::new();
        let lock = Spinlock::new(1);
        let (guard, status) = cv.wait_until(&lock, lock.lock(), Instant::now());
        assert_eq!(status, CvStatus::Timeout);
        assert_eq!(*guard, 1);
        assert!(lock.is_locked());
    }
}
