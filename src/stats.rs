use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::fetch::FetchOutcome;
use crate::scheduler::Priority;

/// One CSV row describing a single fetch.
#[derive(Debug, Default, Serialize)]
pub struct FetchRecord {
    pub timestamp: DateTime<Utc>,
    pub label: Option<String>,
    pub url: Option<String>,
    pub priority: Option<String>,

    pub status: Option<u16>,
    pub bytes: usize,
    pub latency_ms: Option<u64>,
    pub elapsed_ms: u64,
    pub debt_ms: u64,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl FetchRecord {
    pub fn from_outcome(url: &str, priority: Priority, outcome: &FetchOutcome) -> Self {
        let mut record = FetchRecord {
            timestamp: Utc::now(),
            url: Some(url.to_string()),
            priority: Some(priority.as_str().to_string()),
            status: outcome.status().map(|s| s.as_u16()),
            bytes: outcome.body_len(),
            latency_ms: outcome.latency().map(millis),
            elapsed_ms: millis(outcome.elapsed()),
            ..Default::default()
        };

        if let Some(e) = &outcome.transport_error {
            record.error_type = Some("transport_error".to_string());
            record.error_message = Some(e.to_string());
        } else if let Some(e) = &outcome.body_error {
            record.error_type = Some("body_error".to_string());
            record.error_message = Some(e.to_string());
        }

        record
    }

    /// Create an error record with timestamp and error information
    pub fn from_error(error_type: &str, error_message: &str) -> Self {
        FetchRecord {
            timestamp: Utc::now(),
            error_type: Some(error_type.to_string()),
            error_message: Some(error_message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_debt(mut self, debt: Duration) -> Self {
        self.debt_ms = millis(debt);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error_type.is_some()
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ResponseMeta;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use reqwest::{StatusCode, Url};
    use tokio::time::Instant;

    #[test]
    fn test_from_outcome_with_response() {
        let start = Instant::now();
        let mut outcome = FetchOutcome::started(start);
        outcome.response_received = Some(start + Duration::from_millis(25));
        outcome.body_closed = Some(start + Duration::from_millis(60));
        outcome.response = Some(ResponseMeta {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            url: Url::parse("http://feeds.example/locations").unwrap(),
        });
        outcome.body = Bytes::from_static(b"<body/>");

        let url = "http://feeds.example/locations";
        let record =
            FetchRecord::from_outcome(url, Priority::Low, &outcome).with_label("locations");

        assert_eq!(record.status, Some(404));
        assert_eq!(record.bytes, 7);
        assert_eq!(record.latency_ms, Some(25));
        assert_eq!(record.elapsed_ms, 60);
        assert_eq!(record.priority.as_deref(), Some("low"));
        assert_eq!(record.label.as_deref(), Some("locations"));
        assert!(!record.is_error());
    }

    #[test]
    fn test_from_error() {
        let record = FetchRecord::from_error("closed", "fetcher is closed")
            .with_debt(Duration::from_secs(2));
        assert!(record.is_error());
        assert_eq!(record.debt_ms, 2000);
        assert_eq!(record.bytes, 0);
    }
}
