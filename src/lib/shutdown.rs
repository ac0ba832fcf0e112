use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::lock;

/// Session-wide cancellation token.
///
/// Cloned into every long-running loop. Once triggered it stays triggered,
/// and every pending [`Shutdown::wait_until`] returns immediately.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *lock(&self.inner.triggered) = true;
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *lock(&self.inner.triggered)
    }

    /// Sleeps until `deadline`. Returns `true` if shutdown was triggered
    /// before or during the wait.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut triggered = lock(&self.inner.triggered);
        loop {
            if *triggered {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            triggered = match self.inner.cond.wait_timeout(triggered, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

/// Fixed-cadence wakeups on absolute deadlines, so the time spent in each
/// iteration does not accumulate as drift.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Blocks until the next tick. Returns `false` once shutdown is
    /// triggered.
    pub fn wait(&mut self, shutdown: &Shutdown) -> bool {
        if shutdown.wait_until(self.next) {
            return false;
        }

        self.next += self.period;

        // Missed ticks are dropped rather than replayed in a burst.
        let now = Instant::now();
        if self.next < now {
            self.next = now + self.period;
        }
        true
    }
}
