//! Rate-regulated fetching for transit feed APIs.
//!
//! A shared [`TokenBucketRegulator`] keeps all traffic to a provider within
//! its byte-rate quota. [`RegulatedConnection`] paces raw streams,
//! [`RegulatedFetcher`] settles whole HTTP fetches, and
//! [`PriorityFetchScheduler`] lets latency-sensitive requests borrow wait
//! time that background requests repay.

pub mod config;
pub mod connection;
pub mod error;
pub mod fetch;
pub mod output;
pub mod regulator;
pub mod scheduler;
pub mod stats;

pub use connection::RegulatedConnection;
pub use error::{Error, Result};
pub use fetch::{FetchOutcome, RegulatedFetcher, WaitMode};
pub use regulator::TokenBucketRegulator;
pub use scheduler::{Priority, PriorityFetchScheduler};
