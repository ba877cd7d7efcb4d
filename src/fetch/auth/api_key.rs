use crate::error::{Error, Result};
use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that injects an API key as an HTTP header.
///
/// The header name and value are validated once at construction.
#[derive(Debug, Clone)]
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    value: HeaderValue,
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(header_name.as_bytes())
            .map_err(|e| Error::InvalidHeader(format!("{header_name}: {e}")))?;
        let mut value =
            HeaderValue::from_str(key).map_err(|e| Error::InvalidHeader(e.to_string()))?;
        value.set_sensitive(true);
        Ok(Self {
            inner,
            header_name,
            value,
        })
    }

    /// Uses `Authorization: Bearer <key>`.
    pub fn bearer(inner: C, key: &str) -> Result<Self> {
        Self::new(inner, AUTHORIZATION.as_str(), &format!("Bearer {key}"))
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.value.clone());
        self.inner.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;

    #[test]
    fn test_rejects_invalid_header_name() {
        let result = ApiKey::new(BasicClient::new(), "bad header", "secret");
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_bearer_marks_value_sensitive() {
        let client = ApiKey::bearer(BasicClient::new(), "secret").unwrap();
        assert_eq!(client.header_name, AUTHORIZATION);
        assert!(client.value.is_sensitive());
        assert_eq!(client.value.to_str().unwrap(), "Bearer secret");
    }
}
