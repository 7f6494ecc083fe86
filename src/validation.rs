use axum::http::header;
use axum::http::request::Parts;

use crate::config::Config;
use crate::routing::route::normalize;

/// Decides whether a request is addressed to the API at all.
#[derive(Debug, Clone, Default)]
pub struct RequestValidator {
    prefix: Option<String>,
    domain: Option<String>,
}

impl RequestValidator {
    pub fn new(prefix: Option<&str>, domain: Option<&str>) -> Self {
        Self {
            prefix: prefix.map(normalize).filter(|p| p != "/"),
            domain: domain.map(|d| d.to_ascii_lowercase()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.prefix.as_deref(), config.domain.as_deref())
    }

    /// Requests are API requests when they match the configured prefix and
    /// domain. With neither configured every request is an API request.
    pub fn is_api_request(&self, parts: &Parts) -> bool {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| parts.uri.host());

        self.validate_prefix(parts.uri.path()) && self.validate_domain(host)
    }

    /// The path equals the prefix or continues it at a segment boundary.
    pub fn validate_prefix(&self, path: &str) -> bool {
        let Some(prefix) = &self.prefix else {
            return true;
        };
        let path = normalize(path);
        path == *prefix
            || path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn validate_domain(&self, host: Option<&str>) -> bool {
        let Some(domain) = &self.domain else {
            return true;
        };
        host.map(|h| h.split(':').next().unwrap_or(h))
            .is_some_and(|h| h.eq_ignore_ascii_case(domain))
    }
}
