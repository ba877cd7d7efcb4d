//! Fetch configuration loaded from a JSON file.
//!
//! ```json
//! {
//!   "regulator": { "initial_available": 25000, "capacity": 100000, "interval_secs": 20 },
//!   "timeout_secs": 30,
//!   "api_key": { "kind": "url_param", "name": "api_key", "value_env": "TRANSIT_API_KEY" }
//! }
//! ```
//!
//! Missing fields take their defaults. Key values are read from the named
//! environment variable, never from the file itself.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::fetch::auth::{ApiKey, UrlParam};
use crate::fetch::{BasicClient, HttpClient};
use crate::regulator::RegulatorConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyKind {
    UrlParam,
    Header,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub kind: ApiKeyKind,
    /// Query parameter or header name.
    pub name: String,
    /// Environment variable holding the key.
    pub value_env: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub regulator: RegulatorConfig,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub api_key: Option<ApiKeyConfig>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            regulator: RegulatorConfig::default(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            api_key: None,
        }
    }
}

impl FetchConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config '{path}'"))?;
        Self::from_json(&content).with_context(|| format!("parsing config '{path}'"))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Builds the HTTP client: client-wide timeouts plus the configured key.
    pub fn http_client(&self) -> Result<Arc<dyn HttpClient>> {
        let basic = BasicClient::with_timeouts(
            Duration::from_secs(self.timeout_secs),
            Duration::from_secs(self.connect_timeout_secs),
        )?;

        let Some(api_key) = &self.api_key else {
            return Ok(Arc::new(basic));
        };
        let key = std::env::var(&api_key.value_env)
            .with_context(|| format!("{} must be set", api_key.value_env))?;

        let client: Arc<dyn HttpClient> = match api_key.kind {
            ApiKeyKind::UrlParam => Arc::new(UrlParam::new(basic, &api_key.name, key)),
            ApiKeyKind::Header => Arc::new(ApiKey::new(basic, &api_key.name, &key)?),
        };
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = FetchConfig::from_json("{}").unwrap();
        assert_eq!(config, FetchConfig::default());
        assert_eq!(config.regulator, RegulatorConfig::live_locations());
    }

    #[test]
    fn test_parses_full_config() {
        let config = FetchConfig::from_json(
            r#"{
                "regulator": {
                    "initial_available": 25000,
                    "capacity": 100000,
                    "interval_secs": 20
                },
                "timeout_secs": 5,
                "api_key": { "kind": "url_param", "name": "api_key", "value_env": "TRANSIT_KEY" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.regulator, RegulatorConfig::bulk_configuration());
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.api_key.unwrap().kind, ApiKeyKind::UrlParam);
    }

    #[test]
    fn test_missing_key_env_is_an_error() {
        let config = FetchConfig {
            api_key: Some(ApiKeyConfig {
                kind: ApiKeyKind::Header,
                name: "x-api-key".to_string(),
                value_env: "TRANSIT_FETCH_TEST_UNSET_KEY".to_string(),
            }),
            ..FetchConfig::default()
        };
        assert!(config.http_client().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(FetchConfig::load("/nonexistent/transit_fetch.json").is_err());
    }
}
