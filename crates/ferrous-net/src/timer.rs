//! Time source and retry policy.
//!
//! None of the protocol engines own a timer. Waiting (ARP resolution, DHCP
//! offers, DNS answers, echo replies) happens in bounded loops driven by a
//! [`RetryPolicy`] against a [`Clock`]. Swapping the clock for a
//! [`ManualClock`] makes every loop run in virtual time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary, fixed origin. Never decreases.
    fn now_ms(&self) -> u64;

    /// Give up the CPU for roughly `duration` while waiting for traffic.
    fn idle(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn idle(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: time only moves when told to, or when someone idles.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn idle(&self, duration: Duration) {
        // Keep loops progressing even with a zero poll interval.
        self.advance(duration.max(Duration::from_millis(1)));
    }
}

/// A point in time on a [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at_ms: u64,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, duration: Duration) -> Self {
        Self::at(clock.now_ms().saturating_add(duration.as_millis() as u64))
    }

    pub const fn at(at_ms: u64) -> Self {
        Self { at_ms }
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.at_ms
    }

    pub fn as_ms(&self) -> u64 {
        self.at_ms
    }
}

/// How often to (re)send, how long to wait between polls and when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of transmissions, including the first.
    pub attempts: u32,
    /// Time between transmissions.
    pub retry_interval: Duration,
    /// Sleep between checks of the completion flag.
    pub poll_interval: Duration,
    /// Overall budget.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, retry_interval: Duration, timeout: Duration) -> Self {
        Self {
            attempts,
            retry_interval,
            poll_interval: Duration::from_millis(10),
            timeout,
        }
    }

    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn start(&self, clock: &dyn Clock) -> Retry {
        let now = clock.now_ms();
        Retry {
            policy: *self,
            sent: 0,
            next_send_ms: now,
            deadline: Deadline::at(now.saturating_add(self.timeout.as_millis() as u64)),
        }
    }
}

/// What a waiting loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Transmit (again) now.
    Send,
    /// Nothing to send; poll and idle.
    Wait,
    /// Budget exhausted.
    Expired,
}

/// Progress of one [`RetryPolicy`] run.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    policy: RetryPolicy,
    sent: u32,
    next_send_ms: u64,
    deadline: Deadline,
}

impl Retry {
    pub fn step(&mut self, now_ms: u64) -> RetryStep {
        if self.deadline.expired(now_ms) {
            return RetryStep::Expired;
        }
        if self.sent < self.policy.attempts && now_ms >= self.next_send_ms {
            self.sent += 1;
            self.next_send_ms = now_ms.saturating_add(self.policy.retry_interval.as_millis() as u64);
            return RetryStep::Send;
        }
        RetryStep::Wait
    }

    /// Allow an immediate resend without consuming the interval, e.g. once
    /// ARP has resolved and the payload can finally go out.
    pub fn send_now(&mut self) {
        self.next_send_ms = 0;
    }

    /// A transmission that was dropped locally does not count as an attempt.
    pub fn refund(&mut self) {
        self.sent = self.sent.saturating_sub(1);
    }

    pub fn attempts(&self) -> u32 {
        self.sent
    }

    pub fn poll_interval(&self) -> Duration {
        self.policy.poll_interval
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }
}
