use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::key_generator::{KeyGenerator, Limiter};
use crate::rate_limit::store::{CounterSnapshot, CounterStore, CounterWindow};
use crate::rate_limit::throttle::{Throttle, ThrottleContext, ThrottleRegistry};
use crate::response::RateLimitDecision;

/// Where the throttle applied to a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleSource {
    /// Pinned on the route or its group.
    Pinned,
    /// Built from the route's `limit`/`expires`.
    Route,
    /// Selected from the registered policies.
    Registered,
}

impl fmt::Display for ThrottleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleSource::Pinned => write!(f, "pinned"),
            ThrottleSource::Route => write!(f, "route"),
            ThrottleSource::Registered => write!(f, "registered"),
        }
    }
}

/// Rate limit admission control.
///
/// Selects the throttle for a request, counts the request in the counter
/// store and decides whether it may proceed.
#[derive(Clone)]
pub struct RateLimitHandler {
    store: Arc<dyn CounterStore>,
    registry: Arc<ThrottleRegistry>,
    keys: KeyGenerator,
    limiter: Option<Limiter>,
    clock: Arc<dyn Clock>,
}

impl RateLimitHandler {
    pub fn new(store: Arc<dyn CounterStore>, registry: Arc<ThrottleRegistry>) -> Self {
        Self {
            store,
            registry,
            keys: KeyGenerator::default(),
            limiter: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_generator(mut self, keys: KeyGenerator) -> Self {
        self.keys = keys;
        self
    }

    /// Replace the default limiter identity for every policy without its own.
    pub fn with_limiter<F>(mut self, limiter: F) -> Self
    where
        F: Fn(&ThrottleContext<'_>) -> String + Send + Sync + 'static,
    {
        self.limiter = Some(Arc::new(limiter));
        self
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn registry(&self) -> &ThrottleRegistry {
        &self.registry
    }

    pub fn select_throttle(
        &self,
        context: &ThrottleContext<'_>,
    ) -> Option<(Arc<dyn Throttle>, ThrottleSource)> {
        if let Some(throttle) = context.route.throttle() {
            return Some((Arc::clone(throttle), ThrottleSource::Pinned));
        }

        if let Some(throttle) = context.route.route_throttle() {
            return Some((Arc::clone(throttle), ThrottleSource::Route));
        }

        self.registry
            .select_matching(context)
            .map(|throttle| (throttle, ThrottleSource::Registered))
    }

    fn limiter_identity(&self, throttle: &dyn Throttle, context: &ThrottleContext<'_>) -> String {
        if let Some(limiter) = throttle.limiter() {
            return limiter(context);
        }
        match &self.limiter {
            Some(limiter) => limiter(context),
            None => self.keys.limiter_identity(context),
        }
    }

    /// Count the request against its throttle.
    ///
    /// Returns `None` when no throttle applies to the request.
    pub async fn admit(&self, context: &ThrottleContext<'_>) -> Result<Option<RateLimitDecision>> {
        let Some((throttle, source)) = self.select_throttle(context) else {
            return Ok(None);
        };

        let limiter = self.limiter_identity(throttle.as_ref(), context);
        let keys = self.keys.counter_keys(throttle.name(), &limiter);
        let now = self.clock.now();
        let window = CounterWindow::new(throttle.expires(), now);

        let hit = self.store.hit(&keys, &window).await?;

        let snapshot = CounterSnapshot {
            requests: hit.requests,
            limit: throttle.limit(),
            expires_minutes: throttle.expires(),
            reset_at: hit.reset_at,
        };
        let decision = RateLimitDecision::from_snapshot(throttle.name(), &snapshot, now);

        debug!(
            target: "apigate::rate_limit",
            policy = %throttle.name(),
            source = %source,
            limiter = %limiter,
            requests = snapshot.requests,
            limit = snapshot.limit,
            allowed = decision.allowed,
            "Admission evaluated"
        );

        Ok(Some(decision))
    }
}

impl fmt::Debug for RateLimitHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitHandler")
            .field("store", &self.store.name())
            .field("registry", &self.registry)
            .field("keys", &self.keys)
            .field("custom_limiter", &self.limiter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::MemoryCounterStore;
    use crate::rate_limit::throttle::{PredicateThrottle, ThrottleRef};
    use crate::routing::testing::{context_parts, test_route, RouteFixture};
    use crate::routing::{RateLimit, Route};

    fn handler(registry: ThrottleRegistry, clock: &ManualClock) -> RateLimitHandler {
        let store = Arc::new(MemoryCounterStore::with_clock(Arc::new(clock.clone())));
        RateLimitHandler::new(store, Arc::new(registry)).with_clock(Arc::new(clock.clone()))
    }

    fn context<'a>(parts: &'a axum::http::request::Parts, route: &'a Route) -> ThrottleContext<'a> {
        ThrottleContext {
            parts,
            route,
            client_ip: "10.0.0.1",
            authenticated: false,
        }
    }

    #[tokio::test]
    async fn test_route_limit_counts_requests() {
        let clock = ManualClock::new(1_000);
        let handler = handler(ThrottleRegistry::new(), &clock);
        let route = RouteFixture::new("/users")
            .rate_limit(RateLimit { limit: 5, expires: 10 })
            .build();
        let parts = context_parts();
        let context = context(&parts, &route);

        let first = handler.admit(&context).await.unwrap().unwrap();
        assert!(first.allowed);
        assert_eq!(first.limit, 5);
        assert_eq!(first.remaining, 4);
        assert_eq!(first.reset_time, 1_600);

        for _ in 0..4 {
            assert!(handler.admit(&context).await.unwrap().unwrap().allowed);
        }

        let sixth = handler.admit(&context).await.unwrap().unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.retry_after, Some(600));
    }

    #[tokio::test]
    async fn test_registered_policy_with_highest_limit_is_used() {
        let clock = ManualClock::new(1_000);
        let mut registry = ThrottleRegistry::new();
        registry
            .extend(Arc::new(PredicateThrottle::always("high", 100, 1)))
            .extend(Arc::new(PredicateThrottle::always("low", 99, 1)));
        let handler = handler(registry, &clock);

        let (parts, route) = (context_parts(), test_route());
        let decision = handler.admit(&context(&parts, &route)).await.unwrap().unwrap();
        assert_eq!(decision.policy, "high");
        assert_eq!(decision.limit, 100);
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test]
    async fn test_no_matching_policy_is_not_rate_limited() {
        let clock = ManualClock::new(1_000);
        let mut registry = ThrottleRegistry::new();
        registry.extend(Arc::new(PredicateThrottle::new("never", 1, 1, |_| false)));
        let handler = handler(registry, &clock);

        let (parts, route) = (context_parts(), test_route());
        assert!(handler.admit(&context(&parts, &route)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pinned_throttle_takes_precedence() {
        let clock = ManualClock::new(1_000);
        let mut registry = ThrottleRegistry::new();
        registry.extend(Arc::new(PredicateThrottle::always("global", 1_000, 1)));
        let handler = handler(registry, &clock);

        let route = RouteFixture::new("/users")
            .rate_limit(RateLimit { limit: 5, expires: 10 })
            .throttle(&ThrottleRef::instance(PredicateThrottle::always("pinned", 2, 1)))
            .build();
        let parts = context_parts();
        let context = context(&parts, &route);

        let (throttle, source) = handler.select_throttle(&context).unwrap();
        assert_eq!(throttle.name(), "pinned");
        assert_eq!(source, ThrottleSource::Pinned);

        let decision = handler.admit(&context).await.unwrap().unwrap();
        assert_eq!(decision.limit, 2);
    }

    #[tokio::test]
    async fn test_route_limit_beats_registered_policies() {
        let clock = ManualClock::new(1_000);
        let mut registry = ThrottleRegistry::new();
        registry.extend(Arc::new(PredicateThrottle::always("global", 1_000, 1)));
        let handler = handler(registry, &clock);

        let route = RouteFixture::new("/users")
            .rate_limit(RateLimit { limit: 0, expires: 10 })
            .build();
        let parts = context_parts();
        let (_, source) = handler.select_throttle(&context(&parts, &route)).unwrap();
        assert_eq!(source, ThrottleSource::Route);
    }

    #[tokio::test]
    async fn test_limiters_separate_counters() {
        let clock = ManualClock::new(1_000);
        let mut registry = ThrottleRegistry::new();
        registry.extend(Arc::new(
            PredicateThrottle::always("per-key", 1, 1)
                .with_limiter(|ctx| ctx.parts.uri.path().to_string()),
        ));
        let handler = handler(registry, &clock).with_limiter(|_| "everyone".to_string());

        let (parts, route) = (context_parts(), test_route());
        let mut context = context(&parts, &route);
        assert!(handler.admit(&context).await.unwrap().unwrap().allowed);

        // Policy limiter ignores the client address.
        context.client_ip = "10.0.0.2";
        assert!(!handler.admit(&context).await.unwrap().unwrap().allowed);
    }

    #[tokio::test]
    async fn test_injected_limiter_replaces_client_address() {
        let clock = ManualClock::new(1_000);
        let mut registry = ThrottleRegistry::new();
        registry.extend(Arc::new(PredicateThrottle::always("global", 1, 1)));
        let handler = handler(registry, &clock).with_limiter(|_| "everyone".to_string());

        let (parts, route) = (context_parts(), test_route());
        let mut context = context(&parts, &route);
        assert!(handler.admit(&context).await.unwrap().unwrap().allowed);

        context.client_ip = "10.0.0.2";
        assert!(!handler.admit(&context).await.unwrap().unwrap().allowed);
    }

    #[tokio::test]
    async fn test_window_resets_after_expiry() {
        let clock = ManualClock::new(1_000);
        let mut registry = ThrottleRegistry::new();
        registry.extend(Arc::new(PredicateThrottle::always("global", 1, 1)));
        let handler = handler(registry, &clock);

        let (parts, route) = (context_parts(), test_route());
        let context = context(&parts, &route);
        assert!(handler.admit(&context).await.unwrap().unwrap().allowed);
        assert!(!handler.admit(&context).await.unwrap().unwrap().allowed);

        clock.advance(60);
        let decision = handler.admit(&context).await.unwrap().unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reset_time, 1_120);
    }
}
