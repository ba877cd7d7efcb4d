//! Fetching under a shared byte-rate budget.

use async_trait::async_trait;
use reqwest::Request;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::HttpClient;
use super::executor::{FetchExecutor, FetchOutcome};
use crate::error::{Error, Result};
use crate::regulator::TokenBucketRegulator;

/// Who serves the wait a fetch incurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Sleep inline and report zero debt.
    Blocking,
    /// Return the wait as debt for the caller to dispose of.
    NonBlocking,
}

/// A fetch that settles its usage with a regulator.
///
/// Returns the outcome and the wait still owed by the caller.
#[async_trait]
pub trait RegulatedFetch: Send + Sync {
    async fn fetch(&self, request: Request, mode: WaitMode) -> Result<(FetchOutcome, Duration)>;
}

#[derive(Debug, Clone)]
pub struct RegulatedFetcher<C> {
    executor: FetchExecutor<C>,
    regulator: TokenBucketRegulator,
}

impl<C: HttpClient> RegulatedFetcher<C> {
    pub fn new(client: C, regulator: TokenBucketRegulator) -> Self {
        Self {
            executor: FetchExecutor::new(client),
            regulator,
        }
    }

    pub fn regulator(&self) -> &TokenBucketRegulator {
        &self.regulator
    }

    /// Executes `request` and settles its body size against the regulator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegulatorClosed`] without touching the network when
    /// the regulator is closed. Transport and body failures are carried on
    /// the outcome.
    pub async fn fetch_with_regulation(
        &self,
        request: Request,
        mode: WaitMode,
    ) -> Result<(FetchOutcome, Duration)> {
        if self.regulator.is_closed() {
            return Err(Error::RegulatorClosed);
        }

        let outcome = self.executor.execute(request).await;
        let elapsed = outcome.request_start.elapsed();
        let used = outcome.body_len();

        let wait = match self.regulator.settle(used as f64, elapsed) {
            Ok(wait) => wait,
            Err(e) => {
                warn!(error = %e, used, "Settlement failed, treating debt as zero");
                Duration::ZERO
            }
        };

        match mode {
            WaitMode::Blocking => {
                if !wait.is_zero() {
                    debug!(wait_ms = wait.as_millis() as u64, "Sleeping off fetch debt");
                    tokio::time::sleep(wait).await;
                }
                Ok((outcome, Duration::ZERO))
            }
            WaitMode::NonBlocking => Ok((outcome, wait)),
        }
    }
}

#[async_trait]
impl<C: HttpClient> RegulatedFetch for RegulatedFetcher<C> {
    async fn fetch(&self, request: Request, mode: WaitMode) -> Result<(FetchOutcome, Duration)> {
        self.fetch_with_regulation(request, mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{BasicClient, get_request};

    #[tokio::test]
    async fn test_closed_regulator_fails_before_fetching() {
        let regulator = TokenBucketRegulator::new(10.0, 10.0, Duration::from_secs(1)).unwrap();
        let fetcher = RegulatedFetcher::new(BasicClient::new(), regulator.clone());
        regulator.close();

        // Port 9 is discard; nothing is sent because the check comes first.
        let request = get_request("http://127.0.0.1:9/locations").unwrap();
        let result = fetcher.fetch_with_regulation(request, WaitMode::Blocking).await;

        assert!(matches!(result, Err(Error::RegulatorClosed)));
    }
}
