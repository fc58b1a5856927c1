// wake signal backing every context.
//
// a context blocks on its signal when it suspends, and set_ready notifies the signal. notifications
// that arrive while the context is still running are remembered as a single permit, so a wakeup
// can never be lost between "decided to suspend" and "actually blocked".

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};


// synchronization signal state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    // no permit, nobody blocked.
    Empty,
    // the owning context is blocked on the condvar.
    Waiting,
    // a permit is available and will be consumed by the next wait.
    Notified,
}

// synchronization signal
pub(super) struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Signal {
    pub(super) fn new() -> Self {
        Signal {
            state: Mutex::new(State::Empty),
            cond: Condvar::new(),
        }
    }

    // the state is a plain enum, a panic elsewhere cannot leave it torn.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(super) fn is_waiting(&self) -> bool {
        *self.lock() == State::Waiting
    }

    // deposit a permit, waking the owner if it is blocked. repeated notifications collapse.
    pub(super) fn notify(&self) {
        let mut lock = self.lock();
        match *lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Notified;
                self.cond.notify_one();
            }
        }
    }

    // block until a permit is available or the deadline passes. returns whether a permit was
    // consumed.
    //
    // `guard` is dropped only once the signal mutex is held. any notifier that could observe the
    // effect of releasing `guard` must then take the signal mutex, which is not released until we
    // are blocked on the condvar, so releasing and blocking happen as one step.
    pub(super) fn wait<G>(&self, guard: G, deadline: Option<Instant>) -> bool {
        let mut lock = self.lock();
        drop(guard);

        if let State::Notified = *lock {
            *lock = State::Empty;
            return true;
        }
        debug_assert_eq!(*lock, State::Empty, "signal waited on concurrently");
        *lock = State::Waiting;

        loop {
            match deadline {
                // block on mutex + condvar indefinitely
                None => {
                    lock = self.cond.wait(lock).unwrap_or_else(PoisonError::into_inner);
                }

                // block on mutex + condvar until deadline
                Some(deadline) => {
                    let remaining = deadline
                        .checked_duration_since(Instant::now())
                        .filter(|duration| !duration.is_zero());
                    let Some(remaining) = remaining else {
                        *lock = State::Empty;
                        return false;
                    };
                    let (lock2, _) = self.cond
                        .wait_timeout(lock, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    lock = lock2;
                }
            }

            // a permit that races with the deadline still counts as a notification
            if let State::Notified = *lock {
                *lock = State::Empty;
                return true;
            }
        }
    }
}
