//! Error taxonomy for the fetch and regulation core.

/// Errors surfaced by the regulator, the fetch executor and the scheduler.
///
/// A non-2xx HTTP status is never an error here; it travels as response
/// metadata on [`crate::fetch::FetchOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("regulator capacity must be positive, got {0}")]
    InvalidCapacity(f64),

    #[error("initial tokens {initial} exceed capacity {capacity}")]
    InitialExceedsCapacity { initial: f64, capacity: f64 },

    #[error("replenishment interval must be positive")]
    InvalidInterval,

    #[error("invalid auth header: {0}")]
    InvalidHeader(String),

    /// The round trip itself failed (DNS, connect, timeout).
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// A response arrived but its body could not be read.
    #[error("body error: {0}")]
    Body(#[source] reqwest::Error),

    #[error("regulator is closed")]
    RegulatorClosed,

    #[error("fetcher is closed")]
    FetcherClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
