// channel status and error types.

use std::fmt::{self, Debug, Display, Formatter};
use thiserror::Error;


// ==== status vocabulary ====


/// Outcome of a channel operation
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ChannelOpStatus {
    /// The value was handed off
    Success,
    /// The channel is closed and will never accept or produce another value
    Closed,
    /// The deadline elapsed before a handoff could happen
    Timeout,
}

impl ChannelOpStatus {
    /// Whether this is [`ChannelOpStatus::Success`].
    pub fn is_success(self) -> bool {
        self == ChannelOpStatus::Success
    }
}

impl Display for ChannelOpStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            ChannelOpStatus::Success => "success",
            ChannelOpStatus::Closed => "closed",
            ChannelOpStatus::Timeout => "timeout",
        })
    }
}


// ==== base error types ====


/// Error for trying to use a channel that has been closed, with no value left to receive
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[error("channel is closed")]
pub struct ChannelClosed;

/// Error for an operation whose deadline elapsed before the rendezvous happened
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[error("timed out waiting for rendezvous")]
pub struct TimeoutError;


// ==== compound error types ====


macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Reason a channel operation failed
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ChannelError {
    /// The channel is closed
    #[error(transparent)]
    Closed(ChannelClosed),
    /// The deadline elapsed
    #[error(transparent)]
    Timeout(TimeoutError),
}

compound_from!(ChannelError {
    Closed(ChannelClosed),
    Timeout(TimeoutError),
});

impl ChannelError {
    /// The corresponding status.
    pub fn status(self) -> ChannelOpStatus {
        match self {
            ChannelError::Closed(_) => ChannelOpStatus::Closed,
            ChannelError::Timeout(_) => ChannelOpStatus::Timeout,
        }
    }
}

impl From<ChannelError> for ChannelOpStatus {
    fn from(error: ChannelError) -> Self {
        error.status()
    }
}

/// Error for trying to push into a channel, giving the message back
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SendError<T> {
    /// The message that could not be pushed
    pub msg: T,
    /// The reason the message could not be pushed
    pub cause: ChannelError,
}

impl<T> SendError<T> {
    /// The corresponding status.
    pub fn status(&self) -> ChannelOpStatus {
        self.cause.status()
    }

    /// Take back the message.
    pub fn into_inner(self) -> T {
        self.msg
    }
}

// doesn't require T: Debug
impl<T> Debug for SendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("SendError")
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

impl<T> Display for SendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "failed to push message: {}", self.cause)
    }
}

impl<T> std::error::Error for SendError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}
