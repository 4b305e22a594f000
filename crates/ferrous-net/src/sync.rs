use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Wake-up channel for threads blocked on a socket.
///
/// The stack calls [`WaitQueue::notify`] on every state transition and data
/// arrival. Waiters remember the generation they last observed and sleep
/// until it moves. `notify` never waits on a waiter: the generation is an
/// atomic and the mutex only guards the condvar handshake.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn notify(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        // A poisoned lock only means a waiter panicked; waking the rest is
        // still correct.
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.cond.notify_all();
    }

    /// Block until the generation differs from `since` or `timeout` passes.
    /// Returns the generation observed on wake-up.
    pub fn wait_for_change(&self, since: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let current = self.generation();
            if current != since {
                return current;
            }
            let now = Instant::now();
            if now >= deadline {
                return current;
            }
            guard = match self.cond.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}
