//! API-key wrappers for feeds that require credentials.

mod api_key;
mod url_param;

pub use api_key::ApiKey;
pub use url_param::UrlParam;
