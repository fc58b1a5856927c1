// minimal safe API for the channel. the exposed API is a convenience wrapper around this.

use super::error::ChannelOpStatus;
use crate::{
    context::Context,
    spin::{Spinlock, SpinlockGuard},
    wait_queue::{park, WaitQueue, Wakeup},
};
use crossbeam_utils::CachePadded;
use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{
        AtomicBool,
        AtomicPtr,
        AtomicU8,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
    time::Instant,
};


// handle to a channel.
pub(crate) struct Channel<T> {
    // null, or the slot of the one producer whose message is in flight.
    slot: CachePadded<AtomicPtr<Slot<T>>>,
    // monotonic false -> true.
    closed: CachePadded<AtomicBool>,
    // the wait queues. only ever locked for bounded, non-suspending critical sections, except
    // for handing the guard to a suspend.
    queues: Spinlock<Queues>,
    // the channel moves T values between threads, but never shares a &T.
    _marker: PhantomData<T>,
}

// channel lockable state.
#[derive(Default)]
struct Queues {
    // producers that found the slot occupied.
    producers: WaitQueue,
    // consumers that found the slot empty.
    consumers: WaitQueue,
}

// a message in flight. lives on the stack of the producer for the duration of one push.
//
// the producer publishes a pointer to it, and then must not return (and thereby free it) until
// it has either withdrawn the pointer again or observed `state` leave PUBLISHED. a consumer that
// claims the pointer may access the slot until it stores to `state`, and not afterwards.
struct Slot<T> {
    // taken by the claiming consumer.
    msg: UnsafeCell<Option<T>>,
    // context to resume once the slot is finished with.
    producer: Context,
    // one of the slot state constants.
    state: AtomicU8,
}

// possible values for Slot.state

// the pointer may still be published, or claimed but not yet finished with.
const PUBLISHED: u8 = 0;
// a consumer moved the message out.
const CONSUMED: u8 = 1;
// the channel was dropped with the slot still published; the message was not taken.
const ABANDONED: u8 = 2;

// how a published slot was finished with.
enum Handoff {
    Consumed,
    Withdrawn,
    Abandoned,
}

impl<T> Slot<T> {
    fn new(msg: T, producer: Context) -> Self {
        Slot {
            msg: UnsafeCell::new(Some(msg)),
            producer,
            state: AtomicU8::new(PUBLISHED),
        }
    }

    fn as_ptr(&self) -> *mut Slot<T> {
        self as *const Slot<T> as *mut Slot<T>
    }

    // take the message back. only valid when no consumer holds the slot.
    fn into_msg(self) -> T {
        self.msg.into_inner().expect("slot message taken twice (internal bug)")
    }

    // move the message out of a claimed slot and resume its producer.
    //
    // safety: the caller must have claimed `slot` by swapping it out of the channel's slot
    //         pointer, and must not touch it again.
    unsafe fn consume(slot: NonNull<Slot<T>>) -> T {
        let slot = slot.as_ref();
        // safety: claiming the pointer gives us exclusive access to msg until we store the state
        let msg = (*slot.msg.get()).take().expect("claimed slot was empty (internal bug)");
        let producer = slot.producer.clone();
        slot.state.store(CONSUMED, Release);
        // the producer may return and free the slot from here on
        producer.set_ready();
        msg
    }

    // resume the producer of a claimed slot without taking its message.
    //
    // safety: same as `consume`.
    unsafe fn abandon(slot: NonNull<Slot<T>>) {
        let slot = slot.as_ref();
        let producer = slot.producer.clone();
        slot.state.store(ABANDONED, Release);
        producer.set_ready();
    }
}

impl<T> Channel<T> {
    // construct open and empty.
    pub(crate) fn new() -> Self {
        Channel {
            slot: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            closed: CachePadded::new(AtomicBool::new(false)),
            queues: Spinlock::new(Queues::default()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }

    fn is_empty(&self) -> bool {
        self.slot.load(Acquire).is_null()
    }

    // publish our slot if the channel slot is empty.
    fn try_publish(&self, slot: *mut Slot<T>) -> bool {
        self.slot
            .compare_exchange(ptr::null_mut(), slot, AcqRel, Acquire)
            .is_ok()
    }

    // claim the published slot, if there is one.
    fn try_claim(&self) -> Option<NonNull<Slot<T>>> {
        let mut current = self.slot.load(Acquire);
        loop {
            let claimed = NonNull::new(current)?;
            match self.slot.compare_exchange_weak(current, ptr::null_mut(), AcqRel, Acquire) {
                Ok(_) => return Some(claimed),
                Err(actual) => current = actual,
            }
        }
    }

    // take our own slot back, unless a consumer claimed it first.
    fn try_withdraw(&self, slot: *mut Slot<T>) -> bool {
        self.slot
            .compare_exchange(slot, ptr::null_mut(), AcqRel, Relaxed)
            .is_ok()
    }

    // close the channel and wake every queued context.
    //
    // a slot that was published before closing stays published and may still be consumed.
    pub(crate) fn close(&self) {
        self.closed.store(true, Release);
        let (producers, consumers) = {
            let mut queues = self.queues.lock();
            (queues.producers.drain(), queues.consumers.drain())
        };
        trace!(
            producers = producers.len(),
            consumers = consumers.len(),
            "closed channel, waking queued contexts",
        );
        for ctx in producers.into_iter().chain(consumers) {
            ctx.set_ready();
        }
    }

    // push a message, waiting for a consumer to take it, or until the deadline.
    //
    // on failure, gives the message back along with Closed or Timeout.
    pub(crate) fn push(
        &self,
        msg: T,
        deadline: Option<Instant>,
    ) -> Result<(), (ChannelOpStatus, T)> {
        let active = Context::active();
        let slot = Slot::new(msg, active.clone());
        loop {
            if self.is_closed() {
                return Err((ChannelOpStatus::Closed, slot.into_msg()));
            }
            if self.try_publish(slot.as_ptr()) {
                // close() may have begun between the check and the publish. no push that starts
                // after closing may succeed, so take it back unless someone already claimed it.
                if self.is_closed() && self.try_withdraw(slot.as_ptr()) {
                    return Err((ChannelOpStatus::Closed, slot.into_msg()));
                }
                let mut queues = self.queues.lock();
                // notify one waiting consumer
                if let Some(consumer) = queues.consumers.pop() {
                    consumer.set_ready();
                }
                // suspend till the message has been consumed
                return match self.await_handoff(&slot, queues, deadline) {
                    Handoff::Consumed => Ok(()),
                    Handoff::Withdrawn => Err((ChannelOpStatus::Timeout, slot.into_msg())),
                    Handoff::Abandoned => Err((ChannelOpStatus::Closed, slot.into_msg())),
                };
            }

            let queues = self.queues.lock();
            if self.is_closed() {
                return Err((ChannelOpStatus::Closed, slot.into_msg()));
            }
            if self.is_empty() {
                // a consumer cleared the slot in the meantime
                continue;
            }
            // suspend this producer until the slot may be free
            let wakeup = park(&self.queues, queues, |q| &mut q.producers, &active, deadline);
            if wakeup == Wakeup::TimedOut {
                trace!(id = %active.id(), "push timed out waiting for the slot");
                return Err((ChannelOpStatus::Timeout, slot.into_msg()));
            }
        }
    }

    // wait for our published slot to be finished with.
    //
    // with a deadline, a producer that is still published when it passes withdraws the slot. if
    // a consumer claimed the slot at the same moment, the consumer wins and we wait for it.
    fn await_handoff(
        &self,
        slot: &Slot<T>,
        queues: SpinlockGuard<'_, Queues>,
        mut deadline: Option<Instant>,
    ) -> Handoff {
        let producer = &slot.producer;
        let mut notified = producer.block(queues, deadline);
        loop {
            match slot.state.load(Acquire) {
                CONSUMED => return Handoff::Consumed,
                ABANDONED => return Handoff::Abandoned,
                _ => {}
            }

            if !notified {
                if self.try_withdraw(slot.as_ptr()) {
                    trace!(id = %producer.id(), "push timed out waiting for a consumer");
                    // the slot became free without a handoff, so a queued producer may have it
                    self.notify_producer();
                    return Handoff::Withdrawn;
                }
                // claimed concurrently. the consumer is moving the message out right now
                deadline = None;
            }

            // either a stale permit, or waiting for a consumer that already claimed the slot
            notified = producer.block((), deadline);
        }
    }

    // pop a message, waiting for a producer to offer one, or until the deadline.
    pub(crate) fn pop(&self, deadline: Option<Instant>) -> Result<T, ChannelOpStatus> {
        let active = Context::active();
        loop {
            if let Some(slot) = self.try_claim() {
                // notify one waiting producer, now that the slot is free
                self.notify_producer();
                // safety: we just claimed it
                return Ok(unsafe { Slot::consume(slot) });
            }

            let queues = self.queues.lock();
            if self.is_closed() {
                return Err(ChannelOpStatus::Closed);
            }
            if !self.is_empty() {
                // a producer published in the meantime
                continue;
            }
            // suspend this consumer until the slot may be set
            let wakeup = park(&self.queues, queues, |q| &mut q.consumers, &active, deadline);
            if wakeup == Wakeup::TimedOut {
                trace!(id = %active.id(), "pop timed out waiting for a producer");
                return Err(ChannelOpStatus::Timeout);
            }
        }
    }

    // wake one queued producer, if any. the wakeup happens after the lock is released.
    fn notify_producer(&self) {
        let producer = self.queues.lock().producers.pop();
        if let Some(producer) = producer {
            producer.set_ready();
        }
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        self.close();
        if let Some(slot) = self.try_claim() {
            warn!("channel dropped with a message in flight, resuming its producer");
            // safety: we just claimed it
            unsafe { Slot::abandon(slot) };
        }
    }
}

// safety: messages are moved from the pushing thread to the popping thread, and never shared.
unsafe impl<T: Send> Sync for Channel<T> {}
