//! Execution contexts.
//!
//! A [`Context`] is a handle to a suspendable unit of execution. The primitives in this crate only
//! need four things from it: the currently running context ([`Context::active`]), a way to make a
//! suspended context runnable again ([`Context::set_ready`]), and two ways to give up the CPU
//! while atomically releasing a lock ([`Context::suspend`] and [`Context::wait_until`]).
//!
//! Every OS thread lazily owns one context, which is what [`Context::active`] returns. Further
//! contexts can be created with [`Context::new`] by code that drives its own scheduling.
//!
//! Wakeups are permits: a `set_ready` that arrives before the target suspends is remembered, and
//! the next suspend returns immediately. Consequently a suspend can return because of a permit
//! left over from an earlier, already-satisfied wait. Code built on contexts must re-check the
//! condition it waited for after every resume.

mod arena;
mod signal;

use self::signal::Signal;
use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    num::NonZeroU64,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering::{Acquire, Relaxed, Release},
        },
        Arc,
    },
    time::Instant,
};

pub(crate) use self::arena::{lookup, resolve};


thread_local! {
    // context of the current thread. dropped, and thereby unregistered, on thread exit.
    static ACTIVE: Context = Context::new();
}

// source of context ids. ids are never reused.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);


/// Stable identity of a [`Context`]
///
/// Ids are never reused within a process, so a stale id can at worst fail to resolve.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(NonZeroU64);

impl ContextId {
    fn next() -> Self {
        let n = NEXT_ID.fetch_add(1, Relaxed);
        ContextId(NonZeroU64::new(n).expect("context id space exhausted"))
    }

    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "context#{}", self.0)
    }
}


/// Handle to an execution context
///
/// Cloning the handle does not create a new context. Handles compare equal if they refer to the
/// same context.
#[derive(Clone)]
pub struct Context(Arc<Record>);

// the shared state behind context handles.
pub(crate) struct Record {
    id: ContextId,
    // intrusive wait queue link.
    link: Link,
    // what the context blocks on while suspended.
    signal: Signal,
}

// intrusive link of a context into at most one wait queue.
//
// both fields are only written by whoever holds the lock guarding the queue the context is linked
// into (or is about to be linked into). `linked` may additionally be read without that lock by the
// context itself, to find out whether it has been dequeued.
pub(crate) struct Link {
    // id of the next context towards the back of the queue, or 0.
    next: AtomicU64,
    // whether the context is currently in a queue.
    linked: AtomicBool,
}

impl Link {
    fn new() -> Self {
        Link {
            next: AtomicU64::new(0),
            linked: AtomicBool::new(false),
        }
    }

    pub(crate) fn next(&self) -> Option<ContextId> {
        NonZeroU64::new(self.next.load(Relaxed)).map(ContextId)
    }

    pub(crate) fn set_next(&self, next: Option<ContextId>) {
        self.next.store(next.map(ContextId::get).unwrap_or(0), Relaxed);
    }

    // mark as linked, returning whether it already was.
    pub(crate) fn mark_linked(&self) -> bool {
        self.linked.swap(true, Relaxed)
    }

    // mark as no longer linked. release pairs with the acquire in `is_linked` so that a context
    // which observes itself unlinked also observes whatever its notifier did before dequeuing it.
    pub(crate) fn clear(&self) {
        self.next.store(0, Relaxed);
        self.linked.store(false, Release);
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.linked.load(Acquire)
    }
}

impl Context {
    /// Create a new context that is not bound to any thread.
    ///
    /// Whichever thread calls [`suspend`](Self::suspend) or [`wait_until`](Self::wait_until) on
    /// it blocks until it is made ready.
    pub fn new() -> Self {
        let record = Arc::new(Record {
            id: ContextId::next(),
            link: Link::new(),
            signal: Signal::new(),
        });
        arena::insert(&record);
        debug!(id = %record.id, "context created");
        Context(record)
    }

    /// The context of the calling thread.
    pub fn active() -> Self {
        ACTIVE.with(Context::clone)
    }

    /// Identity of this context.
    pub fn id(&self) -> ContextId {
        self.0.id
    }

    /// Mark this context as runnable
    ///
    /// If the context is suspended, it resumes. Otherwise its next suspend returns immediately.
    /// Calling this on a context that is already runnable is harmless: permits do not accumulate.
    pub fn set_ready(&self) {
        self.0.signal.notify();
    }

    /// Give up the CPU until this context is made ready
    ///
    /// `guard` is released at the suspend boundary: after this context has committed to
    /// suspending, but before any `set_ready` that could have been caused by releasing it can be
    /// missed. Pass `()` if there is nothing to release.
    pub fn suspend<G>(&self, guard: G) {
        self.0.signal.wait(guard, None);
    }

    /// Like [`suspend`](Self::suspend), but also resume once `deadline` has passed
    ///
    /// Returns true if resumed by `set_ready`, false if the deadline elapsed first. A permit that
    /// arrives together with the deadline counts as a notification.
    pub fn wait_until<G>(&self, deadline: Instant, guard: G) -> bool {
        self.0.signal.wait(guard, Some(deadline))
    }

    // suspend, with or without a deadline.
    pub(crate) fn block<G>(&self, guard: G, deadline: Option<Instant>) -> bool {
        self.0.signal.wait(guard, deadline)
    }

    pub(crate) fn link(&self) -> &Link {
        &self.0.link
    }

    /// Whether this context is currently parked in a [`WaitQueue`](crate::WaitQueue).
    pub fn is_linked(&self) -> bool {
        self.0.link.is_linked()
    }

    // whether some thread is currently blocked in this context's suspend.
    #[cfg(test)]
    pub(crate) fn is_suspended(&self) -> bool {
        self.0.signal.is_waiting()
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.0.id)
            .field("linked", &self.0.link.is_linked())
            .finish()
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        // a linked id left behind would make the owning queue unresolvable
        assert!(
            !self.link.linked.load(Relaxed),
            "{} dropped while linked into a wait queue",
            self.id,
        );
        arena::remove(self.id);
        debug!(id = %self.id, "context destroyed");
    }
}
