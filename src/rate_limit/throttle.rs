//! Throttle policies and their registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::http::request::Parts;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::key_generator::{KeyGenerator, Limiter};
use crate::routing::Route;

/// Request state visible to throttle predicates and limiters.
pub struct ThrottleContext<'a> {
    pub parts: &'a Parts,
    pub route: &'a Route,
    pub client_ip: &'a str,
    pub authenticated: bool,
}

/// A named rate limit rule.
pub trait Throttle: Send + Sync {
    /// Identity used to namespace counters.
    fn name(&self) -> &str;

    fn matches(&self, context: &ThrottleContext<'_>) -> bool;

    /// Maximum requests per window.
    fn limit(&self) -> u64;

    /// Window length in minutes.
    fn expires(&self) -> u64;

    /// Limiter overriding the handler's limiter for this policy.
    fn limiter(&self) -> Option<Limiter> {
        None
    }
}

/// Route scoped throttle built from a route's `limit`/`expires` options.
#[derive(Debug, Clone)]
pub struct RouteThrottle {
    name: String,
    limit: u64,
    expires: u64,
}

impl RouteThrottle {
    /// Counters are namespaced by a hash of the route identity, so two routes
    /// never share a window even when their paths are equal.
    pub fn for_route(identity: &str, limit: u64, expires: u64) -> Self {
        Self {
            name: KeyGenerator::route_policy_id(identity),
            limit,
            expires,
        }
    }
}

impl Throttle for RouteThrottle {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, _context: &ThrottleContext<'_>) -> bool {
        true
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn expires(&self) -> u64 {
        self.expires
    }
}

/// Matches requests that did not authenticate.
#[derive(Debug, Clone)]
pub struct Unauthenticated {
    pub limit: u64,
    pub expires: u64,
}

impl Throttle for Unauthenticated {
    fn name(&self) -> &str {
        "unauthenticated"
    }

    fn matches(&self, context: &ThrottleContext<'_>) -> bool {
        !context.authenticated
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn expires(&self) -> u64 {
        self.expires
    }
}

/// Matches authenticated requests.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub limit: u64,
    pub expires: u64,
}

impl Throttle for Authenticated {
    fn name(&self) -> &str {
        "authenticated"
    }

    fn matches(&self, context: &ThrottleContext<'_>) -> bool {
        context.authenticated
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn expires(&self) -> u64 {
        self.expires
    }
}

type Predicate = dyn Fn(&ThrottleContext<'_>) -> bool + Send + Sync;

/// Throttle defined by an arbitrary predicate.
#[derive(Clone)]
pub struct PredicateThrottle {
    name: String,
    limit: u64,
    expires: u64,
    predicate: Arc<Predicate>,
    limiter: Option<Limiter>,
}

impl PredicateThrottle {
    pub fn new<F>(name: &str, limit: u64, expires: u64, predicate: F) -> Self
    where
        F: Fn(&ThrottleContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            limit,
            expires,
            predicate: Arc::new(predicate),
            limiter: None,
        }
    }

    /// A throttle matching every request.
    pub fn always(name: &str, limit: u64, expires: u64) -> Self {
        Self::new(name, limit, expires, |_| true)
    }

    pub fn with_limiter<F>(mut self, limiter: F) -> Self
    where
        F: Fn(&ThrottleContext<'_>) -> String + Send + Sync + 'static,
    {
        self.limiter = Some(Arc::new(limiter));
        self
    }
}

impl fmt::Debug for PredicateThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateThrottle")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

impl Throttle for PredicateThrottle {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, context: &ThrottleContext<'_>) -> bool {
        (self.predicate)(context)
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn expires(&self) -> u64 {
        self.expires
    }

    fn limiter(&self) -> Option<Limiter> {
        self.limiter.clone()
    }
}

pub type ThrottleFactory = Arc<dyn Fn() -> Arc<dyn Throttle> + Send + Sync>;

/// How a route refers to its throttle. Resolved once when the route table is built.
#[derive(Clone)]
pub enum ThrottleRef {
    ByName(String),
    ByFactory(ThrottleFactory),
    ByInstance(Arc<dyn Throttle>),
}

impl ThrottleRef {
    pub fn instance<T: Throttle + 'static>(throttle: T) -> Self {
        ThrottleRef::ByInstance(Arc::new(throttle))
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Throttle> + Send + Sync + 'static,
    {
        ThrottleRef::ByFactory(Arc::new(factory))
    }
}

impl From<&str> for ThrottleRef {
    fn from(name: &str) -> Self {
        ThrottleRef::ByName(name.to_string())
    }
}

impl From<String> for ThrottleRef {
    fn from(name: String) -> Self {
        ThrottleRef::ByName(name)
    }
}

impl fmt::Debug for ThrottleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleRef::ByName(name) => f.debug_tuple("ByName").field(name).finish(),
            ThrottleRef::ByFactory(_) => f.write_str("ByFactory(..)"),
            ThrottleRef::ByInstance(throttle) => {
                f.debug_tuple("ByInstance").field(&throttle.name()).finish()
            }
        }
    }
}

/// Throttles known to the gateway. Populated at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct ThrottleRegistry {
    named: HashMap<String, ThrottleFactory>,
    policies: Vec<Arc<dyn Throttle>>,
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in throttles configured for this gateway.
    ///
    /// Both built-ins are always available by name; they only take part in
    /// request matching when their configured limit is nonzero.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();

        let unauthenticated = Unauthenticated {
            limit: config.unauthenticated_limit,
            expires: config.unauthenticated_expires,
        };
        let authenticated = Authenticated {
            limit: config.authenticated_limit,
            expires: config.authenticated_expires,
        };

        if unauthenticated.limit > 0 {
            registry.extend(Arc::new(unauthenticated.clone()));
        }
        if authenticated.limit > 0 {
            registry.extend(Arc::new(authenticated.clone()));
        }

        registry.register("unauthenticated", move || Arc::new(unauthenticated.clone()));
        registry.register("authenticated", move || Arc::new(authenticated.clone()));
        registry
    }

    /// Make a throttle constructor available by name.
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Throttle> + Send + Sync + 'static,
    {
        self.named.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// Add a throttle to the set matched against every request.
    pub fn extend(&mut self, throttle: Arc<dyn Throttle>) -> &mut Self {
        self.policies.push(throttle);
        self
    }

    pub fn policies(&self) -> &[Arc<dyn Throttle>] {
        &self.policies
    }

    pub fn resolve(&self, reference: &ThrottleRef) -> Result<Arc<dyn Throttle>> {
        match reference {
            ThrottleRef::ByName(name) => self
                .named
                .get(name)
                .map(|factory| factory())
                .ok_or_else(|| GatewayError::UnknownThrottle(name.clone())),
            ThrottleRef::ByFactory(factory) => Ok(factory()),
            ThrottleRef::ByInstance(throttle) => Ok(Arc::clone(throttle)),
        }
    }

    /// The matching throttle allowing the most requests; the first
    /// registered wins a tie.
    pub fn select_matching(&self, context: &ThrottleContext<'_>) -> Option<Arc<dyn Throttle>> {
        let mut selected: Option<&Arc<dyn Throttle>> = None;

        for throttle in self.policies.iter().filter(|t| t.matches(context)) {
            match selected {
                Some(best) if best.limit() >= throttle.limit() => {}
                _ => selected = Some(throttle),
            }
        }

        selected.cloned()
    }
}

impl fmt::Debug for ThrottleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut named: Vec<&String> = self.named.keys().collect();
        named.sort();
        f.debug_struct("ThrottleRegistry")
            .field("named", &named)
            .field(
                "policies",
                &self.policies.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
