//! Route definitions and path matching.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use regex::Regex;

use crate::auth::AUTH_MIDDLEWARE;
use crate::error::{GatewayError, Result};
use crate::rate_limit::throttle::{Throttle, ThrottleRef};

pub type BoxResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Endpoint invoked once a request has been admitted.
pub trait RouteHandler: Send + Sync {
    fn call(&self, request: Request) -> BoxResponseFuture;
}

impl<F, Fut, R> RouteHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    fn call(&self, request: Request) -> BoxResponseFuture {
        let future = self(request);
        Box::pin(async move { future.await.into_response() })
    }
}

/// Route scoped rate limit. `(0, 0)` means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub expires: u64,
}

impl RateLimit {
    pub fn new(limit: u64, expires: u64) -> Self {
        Self { limit, expires }
    }

    pub fn is_set(&self) -> bool {
        self.limit > 0 || self.expires > 0
    }
}

/// Options shared by every route of a version group.
#[derive(Debug, Clone, Default)]
pub struct GroupOptions {
    pub prefix: Option<String>,
    pub domain: Option<String>,
    pub rate_limit: RateLimit,
    pub throttle: Option<ThrottleRef>,
    pub conditional_request: Option<bool>,
    pub middleware: Vec<String>,
}

impl GroupOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn limit(mut self, limit: u64, expires: u64) -> Self {
        self.rate_limit = RateLimit::new(limit, expires);
        self
    }

    pub fn throttle(mut self, throttle: impl Into<ThrottleRef>) -> Self {
        self.throttle = Some(throttle.into());
        self
    }

    pub fn conditional_request(mut self, enabled: bool) -> Self {
        self.conditional_request = Some(enabled);
        self
    }

    pub fn middleware(mut self, name: &str) -> Self {
        self.middleware.push(name.to_string());
        self
    }
}

/// A route being registered. Finalised into a [`Route`] when the table is built.
pub struct RouteBuilder {
    pub(crate) methods: Vec<Method>,
    pub(crate) path: String,
    pub(crate) handler: Arc<dyn RouteHandler>,
    pub(crate) name: Option<String>,
    pub(crate) rate_limit: RateLimit,
    pub(crate) throttle: Option<ThrottleRef>,
    pub(crate) conditional_request: Option<bool>,
    pub(crate) middleware: Vec<String>,
    pub(crate) wheres: HashMap<String, String>,
}

impl RouteBuilder {
    pub(crate) fn new(methods: Vec<Method>, path: &str, handler: Arc<dyn RouteHandler>) -> Self {
        Self {
            methods,
            path: path.to_string(),
            handler,
            name: None,
            rate_limit: RateLimit::default(),
            throttle: None,
            conditional_request: None,
            middleware: Vec::new(),
            wheres: HashMap::new(),
        }
    }

    pub fn name(&mut self, name: &str) -> &mut Self {
        self.name = Some(name.to_string());
        self
    }

    /// Allow `limit` requests every `expires` minutes on this route.
    pub fn limit(&mut self, limit: u64, expires: u64) -> &mut Self {
        self.rate_limit = RateLimit::new(limit, expires);
        self
    }

    pub fn throttle(&mut self, throttle: impl Into<ThrottleRef>) -> &mut Self {
        self.throttle = Some(throttle.into());
        self
    }

    pub fn conditional_request(&mut self, enabled: bool) -> &mut Self {
        self.conditional_request = Some(enabled);
        self
    }

    pub fn middleware(&mut self, name: &str) -> &mut Self {
        self.middleware.push(name.to_string());
        self
    }

    /// Constrain a path parameter with a regular expression.
    pub fn constraint(&mut self, param: &str, pattern: &str) -> &mut Self {
        self.wheres.insert(param.to_string(), pattern.to_string());
        self
    }
}

/// A finalised route. Immutable once the route table is built.
pub struct Route {
    pub(crate) methods: Vec<Method>,
    pub(crate) uri: String,
    pub(crate) pattern: PathPattern,
    pub(crate) versions: Vec<String>,
    pub(crate) name: Option<String>,
    pub(crate) domain: Option<String>,
    pub(crate) handler: Arc<dyn RouteHandler>,
    pub(crate) rate_limit: RateLimit,
    pub(crate) throttle: Option<Arc<dyn Throttle>>,
    pub(crate) route_throttle: Option<Arc<dyn Throttle>>,
    pub(crate) conditional_request: bool,
    pub(crate) middleware: Vec<String>,
}

impl Route {
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn handler(&self) -> &Arc<dyn RouteHandler> {
        &self.handler
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }

    /// Throttle pinned on the route or its group.
    pub fn throttle(&self) -> Option<&Arc<dyn Throttle>> {
        self.throttle.as_ref()
    }

    /// Throttle derived from the route's own rate limit.
    pub fn route_throttle(&self) -> Option<&Arc<dyn Throttle>> {
        self.route_throttle.as_ref()
    }

    /// Counter namespace of the route's own rate limit, if it has one.
    pub fn rate_limit_policy(&self) -> Option<&str> {
        self.route_throttle.as_ref().map(|throttle| throttle.name())
    }

    pub fn conditional_request(&self) -> bool {
        self.conditional_request
    }

    pub fn middleware(&self) -> &[String] {
        &self.middleware
    }

    pub fn is_protected(&self) -> bool {
        self.middleware.iter().any(|m| m == AUTH_MIDDLEWARE)
    }

    /// `HEAD` is served by `GET` routes.
    pub fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method) || (*method == Method::HEAD && self.methods.contains(&Method::GET))
    }

    pub fn matches_domain(&self, host: Option<&str>) -> bool {
        let Some(domain) = &self.domain else {
            return true;
        };
        host.map(strip_port)
            .is_some_and(|host| host.eq_ignore_ascii_case(domain))
    }

    pub fn match_path(&self, path: &str) -> Option<RouteParams> {
        self.pattern.captures(path)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("methods", &self.methods)
            .field("uri", &self.uri)
            .field("versions", &self.versions)
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("rate_limit", &self.rate_limit)
            .field("throttle", &self.throttle.as_ref().map(|t| t.name().to_string()))
            .field("conditional_request", &self.conditional_request)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port))
            if !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
                && (name.ends_with(']') || !name.contains(':')) =>
        {
            name
        }
        _ => host,
    }
}

/// Path parameters captured by a route match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams(HashMap<String, String>);

impl RouteParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Normalise a request or route path: single leading slash, no trailing slash.
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Compiled route path such as `/users/{id}/posts/{post?}`.
#[derive(Debug, Clone)]
pub struct PathPattern {
    regex: Regex,
    params: Vec<String>,
}

impl PathPattern {
    pub fn compile(path: &str, wheres: &HashMap<String, String>) -> Result<Self> {
        let path = normalize(path);
        let invalid = |reason: String| GatewayError::InvalidRoute {
            path: path.clone(),
            reason,
        };

        let mut pattern = String::from("^");
        let mut params = Vec::new();

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
                if segment.contains('{') || segment.contains('}') {
                    return Err(invalid(format!("Unsupported segment '{}'", segment)));
                }
                pattern.push('/');
                pattern.push_str(&regex::escape(segment));
                continue;
            };

            let (name, optional) = match inner.strip_suffix('?') {
                Some(name) => (name, true),
                None => (inner, false),
            };

            let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(invalid(format!("Invalid parameter name '{}'", name)));
            }
            if params.iter().any(|p| p == name) {
                return Err(invalid(format!("Duplicate parameter '{}'", name)));
            }

            let constraint = wheres.get(name).map_or("[^/]+", String::as_str);
            let group = format!("(?P<{}>(?:{}))", name, constraint);
            if optional {
                pattern.push_str(&format!("(?:/{})?", group));
            } else {
                pattern.push('/');
                pattern.push_str(&group);
            }
            params.push(name.to_string());
        }

        if params.is_empty() && pattern == "^" {
            pattern.push('/');
        }
        pattern.push('$');

        if let Some(unused) = wheres.keys().find(|k| !params.contains(k)) {
            return Err(invalid(format!("Constraint for unknown parameter '{}'", unused)));
        }

        let regex = Regex::new(&pattern).map_err(|e| invalid(e.to_string()))?;
        Ok(Self { regex, params })
    }

    /// Match a request path, normalising it first.
    pub fn captures(&self, path: &str) -> Option<RouteParams> {
        let path = normalize(path);
        let captures = self.regex.captures(&path)?;
        let values = self
            .params
            .iter()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect();
        Some(RouteParams(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(path: &str) -> PathPattern {
        PathPattern::compile(path, &HashMap::new()).unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("users/"), "/users");
        assert_eq!(normalize("//api//users/"), "/api/users");
    }

    #[test]
    fn test_static_path_ignores_trailing_slash() {
        let pattern = compile("/users");
        assert!(pattern.captures("/users").is_some());
        assert!(pattern.captures("/users/").is_some());
        assert!(pattern.captures("/users/1").is_none());
    }

    #[test]
    fn test_root_path() {
        let pattern = compile("/");
        assert!(pattern.captures("/").is_some());
        assert!(pattern.captures("/users").is_none());
    }

    #[test]
    fn test_parameters_are_captured() {
        let params = compile("/users/{id}/posts/{post}")
            .captures("/users/7/posts/hello")
            .unwrap();
        assert_eq!(params.get("id"), Some("7"));
        assert_eq!(params.get("post"), Some("hello"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_optional_parameter() {
        let pattern = compile("/users/{id?}");
        assert_eq!(pattern.captures("/users").unwrap().get("id"), None);
        assert_eq!(pattern.captures("/users/3").unwrap().get("id"), Some("3"));
    }

    #[test]
    fn test_where_constraint() {
        let wheres = HashMap::from([("id".to_string(), "[0-9]+".to_string())]);
        let pattern = PathPattern::compile("/users/{id}", &wheres).unwrap();
        assert!(pattern.captures("/users/42").is_some());
        assert!(pattern.captures("/users/abc").is_none());
    }

    #[test]
    fn test_constraint_alternation_is_anchored() {
        let wheres = HashMap::from([("kind".to_string(), "a|b".to_string())]);
        let pattern = PathPattern::compile("/items/{kind}", &wheres).unwrap();
        assert!(pattern.captures("/items/a").is_some());
        assert!(pattern.captures("/items/ab").is_none());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PathPattern::compile("/users/{1id}", &HashMap::new()).is_err());
        assert!(PathPattern::compile("/users/{id}/{id}", &HashMap::new()).is_err());
        assert!(PathPattern::compile("/users/x{id}", &HashMap::new()).is_err());

        let wheres = HashMap::from([("missing".to_string(), ".+".to_string())]);
        assert!(matches!(
            PathPattern::compile("/users/{id}", &wheres),
            Err(GatewayError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn test_rate_limit_is_set() {
        assert!(!RateLimit::default().is_set());
        assert!(RateLimit::new(5, 0).is_set());
        assert!(RateLimit::new(0, 10).is_set());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("api.example.com:8080"), "api.example.com");
        assert_eq!(strip_port("api.example.com"), "api.example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
    }
}
