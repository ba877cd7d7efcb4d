//! HTTP fetching: the [`HttpClient`] seam, timed execution, and regulated
//! fetching on top of a shared byte budget.

mod basic;
mod client;
mod executor;
mod regulated;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use executor::{FetchExecutor, FetchOutcome, ResponseMeta};
pub use regulated::{RegulatedFetch, RegulatedFetcher, WaitMode};

use anyhow::Result;

/// Builds a GET request for `url`.
pub fn get_request(url: &str) -> Result<reqwest::Request> {
    Ok(reqwest::Request::new(reqwest::Method::GET, url.parse()?))
}
