use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::Url;

/// An [`HttpClient`] wrapper that carries an API key as a URL query
/// parameter, the usual scheme for transit feed providers.
///
/// A parameter of the same name already on the request is replaced, so a
/// URL copied with a stale key still authenticates with the configured one.
#[derive(Clone)]
pub struct UrlParam<C> {
    pub inner: C,
    pub param_name: String,
    pub key: String,
}

impl<C> UrlParam<C> {
    pub fn new(inner: C, param_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            inner,
            param_name: param_name.into(),
            key: key.into(),
        }
    }

    fn apply(&self, url: &mut Url) {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| name.as_ref() != self.param_name.as_str())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(&self.param_name, &self.key);
    }
}

impl<C> std::fmt::Debug for UrlParam<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlParam")
            .field("param_name", &self.param_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for UrlParam<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.apply(req.url_mut());
        self.inner.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;

    fn keyed() -> UrlParam<BasicClient> {
        UrlParam::new(BasicClient::new(), "api_key", "secret")
    }

    #[test]
    fn test_appends_key() {
        let mut url = Url::parse("http://feeds.example/locations?route=7").unwrap();
        keyed().apply(&mut url);
        assert_eq!(url.query(), Some("route=7&api_key=secret"));
    }

    #[test]
    fn test_replaces_existing_key() {
        let mut url = Url::parse("http://feeds.example/locations?api_key=old&route=7").unwrap();
        keyed().apply(&mut url);
        assert_eq!(url.query(), Some("route=7&api_key=secret"));
    }

    #[test]
    fn test_debug_hides_key() {
        let shown = format!("{:?}", keyed());
        assert!(shown.contains("api_key"));
        assert!(!shown.contains("secret"));
    }
}
