//! Shared byte-rate regulator.
//!
//! [`TokenBucketRegulator`] is a cloneable handle to one [`TokenBucket`].
//! Every prediction and settlement runs under a single lock, so all usage
//! events across callers are applied in one total order. The calls are
//! synchronous and cheap, which lets I/O wrappers consult the regulator from
//! inside `poll_*` methods.

mod bucket;

pub use bucket::TokenBucket;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};

#[derive(Debug)]
struct Shared {
    bucket: TokenBucket,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct TokenBucketRegulator {
    shared: Arc<Mutex<Shared>>,
}

impl TokenBucketRegulator {
    /// Creates a regulator that starts with `initial_available` tokens and
    /// refills `capacity` tokens every `replenishment_interval`.
    ///
    /// # Errors
    ///
    /// Fails if `capacity <= 0`, `initial_available > capacity`, or the
    /// interval is zero.
    pub fn new(
        initial_available: f64,
        capacity: f64,
        replenishment_interval: Duration,
    ) -> Result<Self> {
        let bucket = TokenBucket::new(
            initial_available,
            capacity,
            replenishment_interval,
            Instant::now(),
        )?;
        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                bucket,
                closed: false,
            })),
        })
    }

    /// Returns how long a caller should wait before using `planned` tokens.
    /// Nothing is consumed.
    pub fn predict(&self, planned: f64) -> Result<Duration> {
        let mut shared = self.lock();
        if shared.closed {
            return Err(Error::RegulatorClosed);
        }
        let wait = shared.bucket.predict_at(planned, Instant::now());
        trace!(planned, wait_ms = wait.as_millis() as u64, "Predicted wait");
        Ok(wait)
    }

    /// Records `used` tokens consumed over `period` and returns the wait the
    /// caller owes.
    pub fn settle(&self, used: f64, period: Duration) -> Result<Duration> {
        let mut shared = self.lock();
        if shared.closed {
            return Err(Error::RegulatorClosed);
        }
        let wait = shared.bucket.settle_at(used, period, Instant::now());
        if !wait.is_zero() {
            debug!(
                used,
                period_ms = period.as_millis() as u64,
                available = shared.bucket.available(),
                wait_ms = wait.as_millis() as u64,
                "Usage exceeds refill rate"
            );
        }
        Ok(wait)
    }

    /// Stops the regulator; every later call fails with
    /// [`Error::RegulatorClosed`].
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Current token balance, negative while in debt. Does not credit
    /// replenishment.
    pub fn available(&self) -> f64 {
        self.lock().bucket.available()
    }

    pub fn capacity(&self) -> f64 {
        self.lock().bucket.capacity()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Construction parameters for a [`TokenBucketRegulator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatorConfig {
    pub initial_available: f64,
    pub capacity: f64,
    pub interval_secs: f64,
}

impl RegulatorConfig {
    /// Live vehicle-location polling: 100 000 bytes per second, starting full.
    pub fn live_locations() -> Self {
        Self {
            initial_available: 100_000.0,
            capacity: 100_000.0,
            interval_secs: 1.0,
        }
    }

    /// Bulk route/stop configuration: 100 000 bytes per 20 seconds with a
    /// quarter of the budget available up front.
    pub fn bulk_configuration() -> Self {
        Self {
            initial_available: 25_000.0,
            capacity: 100_000.0,
            interval_secs: 20.0,
        }
    }

    pub fn build(&self) -> Result<TokenBucketRegulator> {
        let interval =
            Duration::try_from_secs_f64(self.interval_secs).map_err(|_| Error::InvalidInterval)?;
        TokenBucketRegulator::new(self.initial_available, self.capacity, interval)
    }
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self::live_locations()
    }
}
