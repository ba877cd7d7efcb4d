//! Token-bucket arithmetic.
//!
//! The bucket is a signed accumulator: consumption may drive `available`
//! below zero, and that debt is repaid through the waits returned by
//! [`TokenBucket::settle_at`]. Replenishment never lifts `available` above
//! `capacity`.

use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    available: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Creates a bucket holding `initial_available` tokens that refills to
    /// `capacity` over `interval`.
    pub fn new(
        initial_available: f64,
        capacity: f64,
        interval: Duration,
        now: Instant,
    ) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(Error::InvalidCapacity(capacity));
        }
        if initial_available.is_nan() || initial_available > capacity {
            return Err(Error::InitialExceedsCapacity {
                initial: initial_available,
                capacity,
            });
        }
        if interval.is_zero() {
            return Err(Error::InvalidInterval);
        }

        Ok(Self {
            capacity,
            refill_rate: capacity / interval.as_secs_f64(),
            available: initial_available,
            last_update: now,
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens produced per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Current balance; negative while the bucket is in debt.
    pub fn available(&self) -> f64 {
        self.available
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// Estimates the wait before `planned` tokens could be used, without
    /// consuming them.
    ///
    /// Only real elapsed time since the last update is credited, so repeated
    /// predictions at the same instant return the same wait.
    pub fn predict_at(&mut self, planned: f64, now: Instant) -> Duration {
        let since = seconds_between(self.last_update, now);
        if since > 0.0 {
            self.replenish(since);
        }
        self.last_update = self.last_update.max(now);

        let planned = planned.max(0.0);
        let mut wait = planned / self.refill_rate;
        if self.available < planned {
            wait += (planned - self.available) / self.refill_rate;
        }
        to_duration(wait)
    }

    /// Commits `used` tokens consumed over `period` and returns how long the
    /// caller should wait to stay within the refill rate.
    pub fn settle_at(&mut self, used: f64, period: Duration, now: Instant) -> Duration {
        let used = used.max(0.0);
        let period = period.as_secs_f64();
        let mut window = seconds_between(self.last_update, now);

        // The caller reported a shorter window than actually passed since the
        // last update; the excess produced tokens nobody claimed.
        if window > period {
            self.replenish(window - period);
            window = period;
        }

        self.available -= used;
        if window > 0.0 {
            self.replenish(window);
        }

        let delta = if window <= 0.0 {
            -used
        } else if window < period {
            window * self.refill_rate - used * window / period
        } else {
            window * self.refill_rate - used
        };

        let mut wait = if delta < 0.0 {
            -delta / self.refill_rate
        } else {
            0.0
        };

        if self.available < 0.0 {
            let floor = -self.available / self.refill_rate + used / self.refill_rate - period;
            wait = wait.max(floor);
        }

        self.last_update = self.last_update.max(now);
        to_duration(wait)
    }

    fn replenish(&mut self, seconds: f64) {
        self.available = (self.available + seconds * self.refill_rate).min(self.capacity);
    }
}

/// Signed seconds from `earlier` to `later`; negative if the clock went back.
fn seconds_between(earlier: Instant, later: Instant) -> f64 {
    if later >= earlier {
        (later - earlier).as_secs_f64()
    } else {
        -(earlier - later).as_secs_f64()
    }
}

fn to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}
