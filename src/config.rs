use std::time::Duration;

use http::HeaderMap;

use crate::request::CachePolicy;

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_CLIENT_NAME: &str = "reqflow";

/// Client-wide values every request falls back to when it has no override.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) client_name: String,
    pub(crate) base_url: String,
    pub(crate) default_headers: HeaderMap,
    pub(crate) request_timeout: Duration,
    pub(crate) cache_policy: CachePolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cache_policy: CachePolicy::default(),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }
}
