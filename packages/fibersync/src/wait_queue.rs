//! Intrusive FIFO queue of parked contexts.

use crate::{
    context::{self, Context, ContextId},
    spin::{Spinlock, SpinlockGuard},
};
use smallvec::SmallVec;
use std::{
    fmt::{self, Debug, Formatter},
    time::Instant,
};


/// Contexts drained from a queue in one go.
pub type Drained = SmallVec<[Context; 8]>;


/// Intrusive FIFO queue of [`Context`]s
///
/// The queue allocates nothing: each context carries a single link field, which makes it a member
/// of at most one queue at a time. Links are context ids rather than pointers.
///
/// The queue does not keep its members alive. Whoever pushes a context must keep a [`Context`]
/// handle to it until it has been dequeued: dropping the last handle to a linked context panics.
///
/// Following a link resolves an id through a process-wide registry of live contexts. That takes a
/// shard read lock, which contends only with contexts being created or destroyed. Both hold the
/// shard for a single map insert or remove, so a queue operation under a [`Spinlock`] stays
/// bounded, though it may briefly block on such a writer.
///
/// A context's link is shared between all queues, so every queue a given context may be linked
/// into must be guarded by a lock, and the context must only be pushed while that lock is held.
/// The [`Spinlock`] plus [`park`] combination does exactly this.
#[derive(Default)]
pub struct WaitQueue {
    // front and back of queue, unless queue is empty.
    front_back: Option<(ContextId, ContextId)>,
}

impl WaitQueue {
    /// Construct empty.
    pub const fn new() -> Self {
        WaitQueue { front_back: None }
    }

    /// Whether no context is queued.
    pub fn is_empty(&self) -> bool {
        self.front_back.is_none()
    }

    /// Link the context to the back of this queue. O(1).
    ///
    /// Panics if the context is already linked into a queue.
    pub fn push(&mut self, ctx: &Context) {
        assert!(!ctx.link().mark_linked(), "{} is already linked into a wait queue", ctx.id());
        ctx.link().set_next(None);

        if let Some((_, ref mut back)) = self.front_back {
            // node becomes new back, and new next of previous back
            let back_ctx = context::resolve(*back);
            debug_assert!(back_ctx.link().next().is_none());
            back_ctx.link().set_next(Some(ctx.id()));
            *back = ctx.id();
        } else {
            // edge case: node becomes only node in queue
            self.front_back = Some((ctx.id(), ctx.id()));
        }
    }

    /// Unlink and return the context at the front of this queue. O(1).
    pub fn pop(&mut self) -> Option<Context> {
        let (front, back) = self.front_back?;
        let ctx = context::resolve(front);
        let next = ctx.link().next();
        if front == back {
            debug_assert!(next.is_none());
            self.front_back = None;
        } else {
            let next = next.expect("wait queue link broken before its back (internal bug)");
            self.front_back = Some((next, back));
        }
        ctx.link().clear();
        Some(ctx)
    }

    /// Unlink a specific context from anywhere in this queue. O(n).
    ///
    /// Returns false if the context is not in this queue, which happens when a notifier dequeued
    /// it first. Panics if the queue is empty: withdrawing only makes sense for a context that has
    /// evidence it is still queued.
    pub fn unlink(&mut self, ctx: &Context) -> bool {
        let Some((front, back)) = self.front_back else {
            panic!("unlink of {} from an empty wait queue", ctx.id());
        };

        if front == ctx.id() {
            // edge case: node is at the front
            let popped = self.pop();
            debug_assert_eq!(popped.as_ref(), Some(ctx));
            return true;
        }

        let mut prev = context::resolve(front);
        loop {
            match prev.link().next() {
                None => return false,
                Some(next) if next == ctx.id() => {
                    // node's next becomes prev's next
                    prev.link().set_next(ctx.link().next());
                    if back == ctx.id() {
                        // edge case: node was at the back, prev becomes new back
                        self.front_back = Some((front, prev.id()));
                    }
                    ctx.link().clear();
                    return true;
                }
                Some(next) => {
                    prev = context::resolve(next);
                }
            }
        }
    }

    /// Unlink every queued context, front to back.
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained::new();
        while let Some(ctx) = self.pop() {
            drained.push(ctx);
        }
        drained
    }

    /// Number of queued contexts. O(n).
    pub fn len(&self) -> usize {
        let mut len = 0;
        let mut next = self.front_back.map(|(front, _)| front);
        while let Some(id) = next {
            len += 1;
            next = context::resolve(id).link().next();
        }
        len
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // leave no context believing it is still linked
        let drained = self.drain();
        if !drained.is_empty() {
            warn!(count = drained.len(), "wait queue dropped with parked contexts");
        }
    }
}

impl Debug for WaitQueue {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut f = f.debug_list();
        let mut next = self.front_back.map(|(front, _)| front);
        while let Some(id) = next {
            f.entry(&id);
            next = context::lookup(id).and_then(|ctx| ctx.link().next());
        }
        f.finish()
    }
}


/// How a context left [`park`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Wakeup {
    /// A notifier dequeued the context.
    Notified,
    /// The deadline passed and the context withdrew itself from the queue.
    TimedOut,
}

/// Park `ctx` in the queue selected from the state behind `lock`
///
/// The context is pushed while `guard` is held, then suspends, releasing `guard` at the suspend
/// boundary. Notifiers wake it by popping it (under the same lock) and calling
/// [`Context::set_ready`].
///
/// Being dequeued is the only evidence of a notification. A resume that finds the context still
/// queued is either a stale permit, in which case it parks again, or the deadline, in which case
/// it re-locks and unlinks itself. If a notifier dequeues it concurrently with the deadline, the
/// notification wins.
pub fn park<Q: ?Sized>(
    lock: &Spinlock<Q>,
    mut guard: SpinlockGuard<'_, Q>,
    select: impl Fn(&mut Q) -> &mut WaitQueue,
    ctx: &Context,
    deadline: Option<Instant>,
) -> Wakeup {
    select(&mut *guard).push(ctx);
    ctx.block(guard, deadline);

    loop {
        // only a pop clears the link while we are suspended, so no lock is needed to trust this
        if !ctx.is_linked() {
            return Wakeup::Notified;
        }

        let mut guard = lock.lock();
        if !ctx.is_linked() {
            return Wakeup::Notified;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let removed = select(&mut *guard).unlink(ctx);
            debug_assert!(removed, "linked context not found in its queue (internal bug)");
            trace!(id = %ctx.id(), "withdrew from wait queue after deadline");
            return Wakeup::TimedOut;
        }

        // stale permit. still queued, so just suspend again
        ctx.block(guard, deadline);
    }
}
