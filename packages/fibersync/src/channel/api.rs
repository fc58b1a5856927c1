// exposed API of channels

use super::{
    core,
    error::*,
};
use std::{
    fmt::{self, Debug, Formatter},
    iter::FusedIterator,
    time::{Duration, Instant},
};


// ==== helper functions for adapting core API to exposed API ====


// deadline for a relative timeout. a timeout too large to represent means no deadline at all.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

// convert a raw failure status into a typed error.
fn channel_error(status: ChannelOpStatus) -> ChannelError {
    match status {
        ChannelOpStatus::Closed => ChannelClosed.into(),
        ChannelOpStatus::Timeout => TimeoutError.into(),
        ChannelOpStatus::Success => unreachable!("success reported as failure (internal bug)"),
    }
}

// convert a raw push result into the exposed result.
fn map_push_result<T>(result: Result<(), (ChannelOpStatus, T)>) -> Result<(), SendError<T>> {
    result.map_err(|(status, msg)| SendError { msg, cause: channel_error(status) })
}

// store a popped message into the caller's place and report the status.
fn store_pop_result<T>(result: Result<T, ChannelOpStatus>, value: &mut T) -> ChannelOpStatus {
    match result {
        Ok(msg) => {
            *value = msg;
            ChannelOpStatus::Success
        }
        Err(status) => status,
    }
}


// ==== the exposed API ====


/// Unbuffered (rendezvous) channel
///
/// A push does not complete until a consumer has taken its message: at most one message is ever
/// in flight, and it lives with its producer rather than in the channel. Any number of producers
/// and consumers, on any number of threads, may use the channel concurrently through a shared
/// reference (for example an `Arc<Channel<T>>`).
///
/// Producers and consumers that cannot hand off immediately park in FIFO wait queues. Closing the
/// channel wakes all of them; each then observes the closed state and fails with
/// [`ChannelOpStatus::Closed`], except that a message already published before closing may still
/// be consumed.
///
/// ```
/// use fibersync::Channel;
/// use std::thread;
///
/// let chan = Channel::new();
/// thread::scope(|s| {
///     s.spawn(|| {
///         for i in 1..=3 {
///             chan.push(i).unwrap();
///         }
///         chan.close();
///     });
///     assert_eq!(chan.iter().collect::<Vec<i32>>(), [1, 2, 3]);
/// });
/// ```
pub struct Channel<T>(core::Channel<T>);

impl<T> Channel<T> {
    /// Create an open channel
    pub fn new() -> Self {
        Channel(core::Channel::new())
    }

    /// Whether the channel has been closed
    ///
    /// Once this returns true it always will.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Close the channel
    ///
    /// Wakes every parked producer and consumer. No push that begins after this may succeed. A
    /// push that had already published its message may still be consumed. Closing an already
    /// closed channel does nothing further.
    pub fn close(&self) {
        self.0.close();
    }

    /// Push a message, blocking until a consumer has taken it
    ///
    /// Fails only if the channel is or becomes closed, in which case the message is given back.
    pub fn push(&self, msg: T) -> Result<(), SendError<T>> {
        map_push_result(self.0.push(msg, None))
    }

    /// Push a message, blocking until a consumer has taken it or the timeout elapses
    pub fn push_wait_for(&self, msg: T, timeout: Duration) -> Result<(), SendError<T>> {
        map_push_result(self.0.push(msg, deadline_after(timeout)))
    }

    /// Push a message, blocking until a consumer has taken it or the deadline is reached
    ///
    /// If a consumer claims the message at the same moment the deadline passes, the handoff wins
    /// and this returns `Ok`.
    pub fn push_wait_until(&self, msg: T, deadline: Instant) -> Result<(), SendError<T>> {
        map_push_result(self.0.push(msg, Some(deadline)))
    }

    /// Pop a message into `value`, blocking until a producer offers one
    ///
    /// Returns [`ChannelOpStatus::Success`] after storing the message, or
    /// [`ChannelOpStatus::Closed`] (leaving `value` untouched) once the channel is closed and no
    /// message is in flight.
    pub fn pop(&self, value: &mut T) -> ChannelOpStatus {
        store_pop_result(self.0.pop(None), value)
    }

    /// Like [`pop`](Self::pop), but gives up with [`ChannelOpStatus::Timeout`] after `timeout`
    pub fn pop_wait_for(&self, value: &mut T, timeout: Duration) -> ChannelOpStatus {
        store_pop_result(self.0.pop(deadline_after(timeout)), value)
    }

    /// Like [`pop`](Self::pop), but gives up with [`ChannelOpStatus::Timeout`] at `deadline`
    pub fn pop_wait_until(&self, value: &mut T, deadline: Instant) -> ChannelOpStatus {
        store_pop_result(self.0.pop(Some(deadline)), value)
    }

    /// Pop a message, blocking until a producer offers one
    ///
    /// Fails with [`ChannelClosed`] once the channel is closed and no message is in flight.
    pub fn value_pop(&self) -> Result<T, ChannelClosed> {
        self.0.pop(None).map_err(|status| match channel_error(status) {
            ChannelError::Closed(closed) => closed,
            ChannelError::Timeout(_) => unreachable!("untimed pop timed out (internal bug)"),
        })
    }

    /// Pop a message, blocking until a producer offers one or the timeout elapses
    pub fn value_pop_wait_for(&self, timeout: Duration) -> Result<T, ChannelError> {
        self.0.pop(deadline_after(timeout)).map_err(channel_error)
    }

    /// Pop a message, blocking until a producer offers one or the deadline is reached
    pub fn value_pop_wait_until(&self, deadline: Instant) -> Result<T, ChannelError> {
        self.0.pop(Some(deadline)).map_err(channel_error)
    }

    /// Iterate over messages as they are popped
    ///
    /// Each call to `next` blocks in [`value_pop`](Self::value_pop). The iterator ends once the
    /// channel is closed and drained, and stays ended.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { chan: Some(self) }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Channel::new()
    }
}

impl<T> Debug for Channel<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}


/// Blocking, single-pass iterator over a [`Channel`]
///
/// See [`Channel::iter`].
pub struct Iter<'a, T> {
    // none once the channel has been observed closed and drained.
    chan: Option<&'a Channel<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let chan = self.chan?;
        match chan.value_pop() {
            Ok(msg) => Some(msg),
            Err(ChannelClosed) => {
                self.chan = None;
                None
            }
        }
    }
}

impl<'a, T> FusedIterator for Iter<'a, T> {}

impl<'a, T> Debug for Iter<'a, T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Iter")
            .field("finished", &self.chan.is_none())
            .finish()
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg32;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
            Arc,
        },
        thread,
    };

    #[test]
    fn push_blocks_until_popped() {
        let chan = Arc::new(Channel::new());
        let pushed = Arc::new(AtomicBool::new(false));

        let join = {
            let (chan, pushed) = (Arc::clone(&chan), Arc::clone(&pushed));
            thread::spawn(move || {
                let result = chan.push(1);
                pushed.store(true, SeqCst);
                result
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!pushed.load(SeqCst), "push completed without a consumer");

        let mut value = 0;
        assert_eq!(chan.pop(&mut value), ChannelOpStatus::Success);
        assert_eq!(value, 1);
        assert!(join.join().unwrap().is_ok());
        assert!(pushed.load(SeqCst));
    }

    #[test]
    fn pop_blocks_until_pushed() {
        let chan = Arc::new(Channel::new());
        let join = {
            let chan = Arc::clone(&chan);
            thread::spawn(move || chan.value_pop())
        };
        thread::sleep(Duration::from_millis(50));
        chan.push("hello").unwrap();
        assert_eq!(join.join().unwrap(), Ok("hello"));
    }

    #[test]
    fn closed_channel_rejects_immediately() {
        let chan = Channel::new();
        chan.close();
        assert!(chan.is_closed());

        let err = chan.push(5).unwrap_err();
        assert_eq!(err.status(), ChannelOpStatus::Closed);
        assert_eq!(err.msg, 5);

        let mut value = 7;
        assert_eq!(chan.pop(&mut value), ChannelOpStatus::Closed);
        assert_eq!(value, 7);
        assert_eq!(chan.value_pop(), Err(ChannelClosed));
        assert_eq!(
            chan.value_pop_wait_for(Duration::from_secs(5)),
            Err(ChannelError::Closed(ChannelClosed)),
        );

        // closing twice is harmless
        chan.close();
        assert!(chan.is_closed());
    }

    #[test]
    fn push_timeout_leaves_channel_usable() {
        let chan = Channel::new();
        let start = Instant::now();
        let err = chan.push_wait_for(3, Duration::from_millis(10)).unwrap_err();
        let elapsed = start.elapsed();
        assert_eq!(err.status(), ChannelOpStatus::Timeout);
        assert_eq!(err.msg, 3);
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_secs(2));

        // slot is not stuck: a normal handoff still works
        thread::scope(|s| {
            s.spawn(|| chan.push(4).unwrap());
            assert_eq!(chan.value_pop(), Ok(4));
        });

        chan.close();
        assert_eq!(chan.push(5).unwrap_err().status(), ChannelOpStatus::Closed);
    }

    #[test]
    fn pop_timeout_on_empty_channel() {
        let chan = Channel::<u32>::new();
        let start = Instant::now();
        let mut value = 0;
        assert_eq!(chan.pop_wait_for(&mut value, Duration::from_millis(20)), ChannelOpStatus::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(
            chan.value_pop_wait_until(Instant::now()),
            Err(ChannelError::Timeout(TimeoutError)),
        );
    }

    #[test]
    fn close_wakes_parked_consumers() {
        let chan = Channel::<u32>::new();
        thread::scope(|s| {
            let joins = (0..3)
                .map(|_| s.spawn(|| chan.value_pop()))
                .collect::<Vec<_>>();
            thread::sleep(Duration::from_millis(50));
            chan.close();
            for join in joins {
                assert_eq!(join.join().unwrap(), Err(ChannelClosed));
            }
        });
    }

    #[test]
    fn close_wakes_parked_producers_but_keeps_published_message() {
        let chan = Channel::new();
        thread::scope(|s| {
            let chan = &chan;
            // this producer publishes first and stays in flight across the close
            let first = s.spawn(move || chan.push(0));
            thread::sleep(Duration::from_millis(30));
            // these find the slot occupied and park in the producer queue
            let queued = (1..=3)
                .map(|i| s.spawn(move || chan_push_status(chan, i)))
                .collect::<Vec<_>>();
            thread::sleep(Duration::from_millis(50));

            chan.close();
            for join in queued {
                assert_eq!(join.join().unwrap(), ChannelOpStatus::Closed);
            }

            // the message published before closing can still be consumed
            assert_eq!(chan.value_pop(), Ok(0));
            assert!(first.join().unwrap().is_ok());
            assert_eq!(chan.value_pop(), Err(ChannelClosed));
        });

        fn chan_push_status(chan: &Channel<i32>, i: i32) -> ChannelOpStatus {
            match chan.push(i) {
                Ok(()) => ChannelOpStatus::Success,
                Err(e) => e.status(),
            }
        }
    }

    #[test]
    fn timed_pop_racing_push_resolves_exactly_once() {
        let mut rng = Pcg32::seed_from_u64(0x5eed);
        for i in 0..200 {
            let chan = Channel::new();
            let pop_timeout = Duration::from_micros(rng.gen_range(0..2000));
            let push_timeout = Duration::from_micros(rng.gen_range(0..2000));
            let (pushed, popped) = thread::scope(|s| {
                let consumer = s.spawn(|| chan.value_pop_wait_for(pop_timeout));
                let pushed = chan.push_wait_for(i, push_timeout);
                (pushed, consumer.join().unwrap())
            });
            match popped {
                Ok(value) => {
                    assert_eq!(value, i);
                    assert!(pushed.is_ok(), "value delivered but push reported failure");
                }
                Err(e) => {
                    assert_eq!(e.status(), ChannelOpStatus::Timeout);
                    let err = pushed.expect_err("push succeeded but no consumer received it");
                    assert_eq!(err.status(), ChannelOpStatus::Timeout);
                    assert_eq!(err.msg, i);
                }
            }
        }
    }

    #[test]
    fn queued_producer_times_out_and_withdraws() {
        let chan = Channel::new();
        thread::scope(|s| {
            // occupies the slot
            let first = s.spawn(|| chan.push(1));
            thread::sleep(Duration::from_millis(20));

            // finds the slot occupied, parks in the producer queue, and times out there
            let queued = s.spawn(|| {
                let result = chan.push_wait_for(2, Duration::from_millis(20));
                (result, Context::active())
            });
            let (result, ctx) = queued.join().unwrap();
            let err = result.unwrap_err();
            assert_eq!(err.status(), ChannelOpStatus::Timeout);
            assert_eq!(err.msg, 2);
            assert!(!ctx.is_linked(), "timed out producer left itself queued");

            // the published message is unaffected
            assert_eq!(chan.value_pop(), Ok(1));
            assert!(first.join().unwrap().is_ok());
        });
    }

    #[test]
    fn timed_producers_do_not_strand_queued_producers() {
        // a timed producer withdraws its published slot while an untimed producer waits in the
        // queue. the untimed one must get its turn once a consumer shows up.
        let chan = Channel::new();
        thread::scope(|s| {
            let timed = s.spawn(|| chan.push_wait_for(1, Duration::from_millis(30)));
            thread::sleep(Duration::from_millis(10));
            let untimed = s.spawn(|| chan.push(2));
            assert_eq!(timed.join().unwrap().unwrap_err().status(), ChannelOpStatus::Timeout);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(chan.value_pop_wait_for(Duration::from_secs(5)), Ok(2));
            assert!(untimed.join().unwrap().is_ok());
        });
    }

    #[test]
    fn iterator_ends_on_close() {
        let chan = Channel::new();
        thread::scope(|s| {
            s.spawn(|| {
                for i in 1..=100 {
                    chan.push(i).unwrap();
                }
                chan.close();
            });
            let mut iter = chan.iter();
            let received = iter.by_ref().collect::<Vec<u32>>();
            assert_eq!(received, (1..=100).collect::<Vec<_>>());
            assert!(iter.next().is_none());
        });
    }

    #[test]
    fn every_message_delivered_exactly_once() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 3;
        const PER_PRODUCER: usize = 250;

        let chan = Channel::new();
        let retries = AtomicUsize::new(0);
        let mut received = thread::scope(|s| {
            let consumers = (0..CONSUMERS)
                .map(|c| {
                    let chan = &chan;
                    s.spawn(move || {
                        let mut rng = Pcg32::seed_from_u64(c as u64);
                        let mut got = Vec::new();
                        loop {
                            // mix blocking and timed pops
                            if rng.gen_bool(0.5) {
                                match chan.value_pop() {
                                    Ok(msg) => got.push(msg),
                                    Err(ChannelClosed) => break,
                                }
                            } else {
                                match chan.value_pop_wait_for(Duration::from_micros(200)) {
                                    Ok(msg) => got.push(msg),
                                    Err(ChannelError::Timeout(_)) => (),
                                    Err(ChannelError::Closed(_)) => break,
                                }
                            }
                        }
                        got
                    })
                })
                .collect::<Vec<_>>();

            let producers = (0..PRODUCERS)
                .map(|p| {
                    let (chan, retries) = (&chan, &retries);
                    s.spawn(move || {
                        let mut rng = Pcg32::seed_from_u64(100 + p as u64);
                        for i in 0..PER_PRODUCER {
                            let mut msg = p * PER_PRODUCER + i;
                            loop {
                                let timeout = Duration::from_micros(rng.gen_range(50..500));
                                match chan.push_wait_for(msg, timeout) {
                                    Ok(()) => break,
                                    Err(e) => {
                                        assert_eq!(e.status(), ChannelOpStatus::Timeout);
                                        retries.fetch_add(1, SeqCst);
                                        msg = e.msg;
                                    }
                                }
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();

            for join in producers {
                join.join().unwrap();
            }
            chan.close();
            consumers
                .into_iter()
                .flat_map(|join| join.join().unwrap())
                .collect::<Vec<_>>()
        });

        received.sort_unstable();
        assert_eq!(received, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
        trace!(retries = retries.load(SeqCst), "delivery test finished");
    }

    #[test]
    fn channel_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Channel<String>>();
        assert_send_sync::<Channel<Vec<u8>>>();
    }
}
