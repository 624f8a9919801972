use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Termination;
use crate::ring::lock;

/// Latches the first termination cause and lets threads wait for it.
pub(crate) struct Lifecycle {
    cause: Mutex<Option<Termination>>,
    stopped: Condvar,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            cause: Mutex::new(None),
            stopped: Condvar::new(),
        }
    }

    /// Record `cause` unless one is already recorded. Returns `true` for the
    /// call that won.
    pub(crate) fn terminate(&self, cause: Termination) -> bool {
        let mut slot = lock(&self.cause);
        if slot.is_some() {
            return false;
        }
        *slot = Some(cause);
        drop(slot);
        self.stopped.notify_all();
        true
    }

    pub(crate) fn termination(&self) -> Option<Termination> {
        lock(&self.cause).clone()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        lock(&self.cause).is_some()
    }

    /// Block until terminated or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<Termination> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = lock(&self.cause);
        while slot.is_none() {
            match deadline {
                None => {
                    slot = self
                        .stopped
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        break;
                    }
                    slot = self
                        .stopped
                        .wait_timeout(slot, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        slot.clone()
    }
}
