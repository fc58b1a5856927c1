//! Synchronization primitives for cooperatively scheduled execution contexts.
//!
//! - [`Channel`]: an unbuffered (rendezvous) channel. A push completes only once a consumer has
//!   taken the value.
//! - [`ConditionVariable`]: notify-one / notify-all against an externally supplied lock.
//! - [`Spinlock`]: short critical sections that never park.
//!
//! Both the channel and the condition variable park waiters in an intrusive [`WaitQueue`] of
//! [`Context`]s.

#[macro_use]
extern crate tracing;

pub mod context;
pub mod spin;
pub mod wait_queue;
pub mod condvar;

mod channel;

pub use crate::{
    channel::api::*,
    condvar::{ConditionVariable, CvStatus, Lockable},
    context::{Context, ContextId},
    spin::{Spinlock, SpinlockGuard},
    wait_queue::WaitQueue,
};

/// Error and status types
pub mod error {
    pub use crate::channel::error::*;
}
