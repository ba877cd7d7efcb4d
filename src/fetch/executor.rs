//! One timed request/response cycle.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Request, StatusCode, Url};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::client::HttpClient;
use crate::error::{Error, Result};

/// Status line and headers of a response. Any status, including non-2xx,
/// is reported here rather than as an error.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Url,
}

/// Everything observed while executing one request.
#[derive(Debug)]
pub struct FetchOutcome {
    pub request_start: Instant,
    /// When headers became available.
    pub response_received: Option<Instant>,
    /// When the body had been read to the end (or failed).
    pub body_closed: Option<Instant>,
    pub transport_error: Option<reqwest::Error>,
    pub body_error: Option<reqwest::Error>,
    pub response: Option<ResponseMeta>,
    pub body: Bytes,
}

impl FetchOutcome {
    /// An outcome for a request that has just started and not yet produced
    /// anything.
    pub fn started(request_start: Instant) -> Self {
        Self {
            request_start,
            response_received: None,
            body_closed: None,
            transport_error: None,
            body_error: None,
            response: None,
            body: Bytes::new(),
        }
    }

    /// True when neither the round trip nor the body read failed. The HTTP
    /// status is not consulted.
    pub fn is_success(&self) -> bool {
        self.transport_error.is_none() && self.body_error.is_none()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|r| r.status)
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Time until headers arrived.
    pub fn latency(&self) -> Option<Duration> {
        self.response_received
            .map(|t| t.saturating_duration_since(self.request_start))
    }

    /// Time from request start to the last observed event.
    pub fn elapsed(&self) -> Duration {
        self.body_closed
            .or(self.response_received)
            .map(|t| t.saturating_duration_since(self.request_start))
            .unwrap_or_default()
    }

    pub fn into_result(self) -> Result<(ResponseMeta, Bytes)> {
        if let Some(e) = self.transport_error {
            return Err(Error::Transport(e));
        }
        if let Some(e) = self.body_error {
            return Err(Error::Body(e));
        }
        match self.response {
            Some(meta) => Ok((meta, self.body)),
            // Only an outcome that never ran has neither a response nor an error.
            None => Err(Error::FetcherClosed),
        }
    }
}

/// Executes requests and records their timing.
#[derive(Debug, Clone)]
pub struct FetchExecutor<C> {
    client: C,
}

impl<C: HttpClient> FetchExecutor<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Runs one round trip and reads the body fully. Failures are recorded
    /// on the outcome, never returned, so the caller decides what to do.
    #[tracing::instrument(skip_all, fields(method = %request.method(), url = %request.url()))]
    pub async fn execute(&self, request: Request) -> FetchOutcome {
        let mut outcome = FetchOutcome::started(Instant::now());

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Round trip failed");
                outcome.transport_error = Some(e);
                return outcome;
            }
        };
        outcome.response_received = Some(Instant::now());
        outcome.response = Some(ResponseMeta {
            status: response.status(),
            headers: response.headers().clone(),
            url: response.url().clone(),
        });

        match response.bytes().await {
            Ok(body) => outcome.body = body,
            Err(e) => {
                debug!(error = %e, "Body read failed");
                outcome.body_error = Some(e);
            }
        }
        outcome.body_closed = Some(Instant::now());

        debug!(
            status = ?outcome.status(),
            bytes = outcome.body_len(),
            elapsed_ms = outcome.elapsed().as_millis() as u64,
            "Fetch complete"
        );
        outcome
    }
}
