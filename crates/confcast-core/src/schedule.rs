//! Timers and clocks for the periodic loops.
//!
//! Loops sleep on `tokio::time`, so tests can run them under a paused
//! runtime. Registry timestamps come from a [`Clock`] instead of being read
//! inline, which lets tests move wall time independently.

use rand::Rng;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{Instant, sleep_until};

/// A fixed period with optional random jitter added to every delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub period: Duration,
    pub jitter: Option<Duration>,
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Self {
            period,
            jitter: None,
        }
    }

    pub fn with_jitter(mut self, jitter: Option<Duration>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Next delay: the period plus a uniform draw from `[0, jitter]`.
    pub fn delay(&self) -> Duration {
        match self.jitter {
            Some(jitter) if !jitter.is_zero() => {
                let extra = rand::rng().random_range(0..=jitter.as_millis() as u64);
                self.period + Duration::from_millis(extra)
            }
            _ => self.period,
        }
    }
}

/// Deadline-based ticker driven by a [`Schedule`].
///
/// `tick` is cancel-safe: dropping the future leaves the deadline in place.
#[derive(Debug)]
pub struct Ticker {
    schedule: Schedule,
    next: Instant,
}

impl Ticker {
    /// First tick fires right away.
    pub fn immediate(schedule: Schedule) -> Self {
        Self {
            schedule,
            next: Instant::now(),
        }
    }

    /// First tick fires after one period.
    pub fn delayed(schedule: Schedule) -> Self {
        Self {
            next: Instant::now() + schedule.delay(),
            schedule,
        }
    }

    pub async fn tick(&mut self) {
        sleep_until(self.next).await;
        self.next = Instant::now() + self.schedule.delay();
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }
}

/// Source of wall-clock timestamps, in ms since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
