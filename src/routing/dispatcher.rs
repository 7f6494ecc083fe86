//! Request dispatch through negotiation, routing, admission and conditional
//! response handling.
//!
//! A request moves through the phases of [`DispatchPhase`] in order. Any phase
//! may end the request with a [`GatewayError`], which is rendered as a JSON
//! error response. When admission control evaluated a throttle, the rate limit
//! headers are attached to the final response whether it succeeded or not.

use std::fmt;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::accept::{AcceptParser, MediaType, Negotiation};
use crate::auth::{Anonymous, Authenticator};
use crate::error::{allow_header, GatewayError, Result};
use crate::format::FormatRegistry;
use crate::metrics::MetricsCollector;
use crate::middleware::get_client_ip;
use crate::rate_limit::{RateLimitHandler, ThrottleContext};
use crate::response::RateLimitDecision;
use crate::routing::conditional;
use crate::routing::table::{RouteMatch, VersionedRouteTable};

/// Stages of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Received,
    VersionResolved,
    RouteMatched,
    Admitted,
    Rejected,
    Executed,
    ConditionalChecked,
    Responded,
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            DispatchPhase::Received => "received",
            DispatchPhase::VersionResolved => "version_resolved",
            DispatchPhase::RouteMatched => "route_matched",
            DispatchPhase::Admitted => "admitted",
            DispatchPhase::Rejected => "rejected",
            DispatchPhase::Executed => "executed",
            DispatchPhase::ConditionalChecked => "conditional_checked",
            DispatchPhase::Responded => "responded",
        };
        f.write_str(phase)
    }
}

/// Request extension marking a request issued from inside the process.
/// Internal requests skip rate limiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InternalRequest;

pub struct Dispatcher {
    parser: AcceptParser,
    strict: bool,
    routes: Arc<VersionedRouteTable>,
    rate_limiter: RateLimitHandler,
    authenticator: Arc<dyn Authenticator>,
    formats: FormatRegistry,
    metrics: MetricsCollector,
    trust_proxy_headers: bool,
}

impl Dispatcher {
    pub fn new(
        parser: AcceptParser,
        routes: Arc<VersionedRouteTable>,
        rate_limiter: RateLimitHandler,
    ) -> Self {
        Self {
            parser,
            strict: false,
            routes,
            rate_limiter,
            authenticator: Arc::new(Anonymous),
            formats: FormatRegistry::with_defaults(),
            metrics: MetricsCollector::new(),
            trust_proxy_headers: false,
        }
    }

    /// Reject Accept headers that do not match the vendor media type.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_authenticator<A: Authenticator + 'static>(mut self, authenticator: A) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    pub fn routes(&self) -> &VersionedRouteTable {
        &self.routes
    }

    pub fn rate_limiter(&self) -> &RateLimitHandler {
        &self.rate_limiter
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let internal = request.extensions().get::<InternalRequest>().is_some();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        debug!(
            target: "apigate::dispatcher",
            phase = %DispatchPhase::Received,
            method = %method,
            path = %path,
            internal,
            "Dispatching request"
        );

        let mut decision: Option<RateLimitDecision> = None;
        let mut response = match self.process(request, internal, &mut decision).await {
            Ok(response) => response,
            Err(err) => {
                if err.status().is_server_error() {
                    warn!(
                        target: "apigate::dispatcher",
                        method = %method,
                        path = %path,
                        error = %err,
                        "Dispatch failed"
                    );
                } else {
                    debug!(
                        target: "apigate::dispatcher",
                        method = %method,
                        path = %path,
                        error = %err,
                        "Request rejected"
                    );
                }
                err.into_response()
            }
        };

        if let Some(decision) = &decision {
            decision.headers().apply(response.headers_mut());
        }

        debug!(
            target: "apigate::dispatcher",
            phase = %DispatchPhase::Responded,
            status = %response.status(),
            "Request dispatched"
        );

        response
    }

    /// Dispatch a request issued by the application itself.
    pub async fn dispatch_internal(&self, mut request: Request) -> Response {
        request.extensions_mut().insert(InternalRequest);
        self.dispatch(request).await
    }

    fn negotiate(&self, method: &Method, request: &Request) -> Result<MediaType> {
        match self.parser.parse_headers(request.headers(), self.strict) {
            // Preflight requests never carry the vendor media type.
            Negotiation::Rejected if *method == Method::OPTIONS => Ok(self.parser.defaults()),
            negotiation => negotiation.into_result(),
        }
    }

    async fn process(
        &self,
        request: Request,
        internal: bool,
        decision: &mut Option<RateLimitDecision>,
    ) -> Result<Response> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let media_type = self.negotiate(&method, &request)?;

        let (version, collection) = self
            .routes
            .resolve(&media_type.version)
            .ok_or_else(|| GatewayError::UnknownVersion(media_type.version.clone()))?;

        debug!(
            target: "apigate::dispatcher",
            phase = %DispatchPhase::VersionResolved,
            media_type = %media_type.essence(),
            version = %version,
            "Version resolved"
        );

        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| request.uri().host())
            .map(str::to_string);

        let (route, params) = match collection.match_request(&method, host.as_deref(), &path)? {
            RouteMatch::Found(route, params) => (route, params),
            RouteMatch::Options(allowed) => return Ok(options_response(&allowed)),
        };

        debug!(
            target: "apigate::dispatcher",
            phase = %DispatchPhase::RouteMatched,
            route = %route.uri(),
            name = ?route.name(),
            "Route matched"
        );

        // An unservable format is rejected before it counts against quota.
        let content_type = self.formats.content_type(&media_type.format)?.clone();

        let (mut parts, body) = request.into_parts();

        let authenticated = self.authenticator.authenticate(&parts);
        if route.is_protected() && !authenticated {
            return Err(GatewayError::Unauthorized);
        }

        if !internal {
            let client_ip = get_client_ip(&parts.headers, &parts.extensions, self.trust_proxy_headers);
            let context = ThrottleContext {
                parts: &parts,
                route: &route,
                client_ip: &client_ip,
                authenticated,
            };

            if let Some(admission) = self.rate_limiter.admit(&context).await? {
                self.metrics
                    .record_request(&admission.policy, admission.allowed)
                    .await;

                let phase = if admission.allowed {
                    DispatchPhase::Admitted
                } else {
                    DispatchPhase::Rejected
                };
                debug!(
                    target: "apigate::dispatcher",
                    phase = %phase,
                    policy = %admission.policy,
                    remaining = admission.remaining,
                    "Admission decided"
                );

                let rejection = (!admission.allowed).then(|| admission.rejection());
                *decision = Some(admission);
                if let Some(rejection) = rejection {
                    return Err(rejection);
                }
            }
        }

        let if_none_match = parts
            .headers
            .get(header::IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        parts.extensions.insert(media_type);
        parts.extensions.insert(params);

        let mut response = route.handler().call(Request::from_parts(parts, body)).await;

        debug!(
            target: "apigate::dispatcher",
            phase = %DispatchPhase::Executed,
            status = %response.status(),
            "Handler executed"
        );

        if route.conditional_request() {
            response = conditional::apply(&method, if_none_match.as_deref(), response).await?;
            debug!(
                target: "apigate::dispatcher",
                phase = %DispatchPhase::ConditionalChecked,
                status = %response.status(),
                "Conditional request checked"
            );
        }

        if response.status() != StatusCode::NOT_MODIFIED
            && !response.headers().contains_key(header::CONTENT_TYPE)
        {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }

        Ok(response)
    }
}

fn options_response(allowed: &[Method]) -> Response {
    let mut response = StatusCode::OK.into_response();
    if let Some(value) = allow_header(allowed) {
        response.headers_mut().insert(header::ALLOW, value);
    }
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("parser", &self.parser)
            .field("strict", &self.strict)
            .field("versions", &self.routes.versions().collect::<Vec<_>>())
            .field("rate_limiter", &self.rate_limiter)
            .field("formats", &self.formats)
            .field("trust_proxy_headers", &self.trust_proxy_headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::{MemoryCounterStore, PredicateThrottle, ThrottleRegistry};
    use crate::routing::route::{GroupOptions, RouteParams};
    use axum::body::{to_bytes, Body};

    async fn users(_request: Request) -> &'static str {
        "users"
    }

    async fn echo_version(request: Request) -> String {
        request
            .extensions()
            .get::<MediaType>()
            .map(|m| m.version.clone())
            .unwrap_or_default()
    }

    async fn show_user(request: Request) -> String {
        request
            .extensions()
            .get::<RouteParams>()
            .and_then(|p| p.get("id"))
            .unwrap_or_default()
            .to_string()
    }

    fn build_dispatcher(registry: ThrottleRegistry) -> Dispatcher {
        let routes = VersionedRouteTable::builder(&registry)
            .version(&["v1"], GroupOptions::new(), |api| {
                api.get("/users", users).limit(2, 1);
                api.get("/users/{id}", show_user);
                api.get("/version", echo_version);
                api.get("/admin", users).middleware("auth");
            })
            .version(&["v2"], GroupOptions::new(), |api| {
                api.get("/version", echo_version);
            })
            .build()
            .unwrap();
        dispatcher_for(routes, registry)
    }

    fn dispatcher_for(routes: VersionedRouteTable, registry: ThrottleRegistry) -> Dispatcher {
        let clock = ManualClock::new(1_000);
        let store = Arc::new(MemoryCounterStore::with_clock(Arc::new(clock.clone())));
        let limiter = RateLimitHandler::new(store, Arc::new(registry)).with_clock(Arc::new(clock));
        let parser = AcceptParser::new("vnd", "api", "v1", "json").unwrap();
        Dispatcher::new(parser, Arc::new(routes), limiter)
    }

    fn get(uri: &str, accept: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(accept) = accept {
            builder = builder.header(header::ACCEPT, accept);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_dispatches_to_negotiated_version() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());

        let response = dispatcher
            .dispatch(get("/version", Some("application/vnd.api.v2+json")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "v2");

        let response = dispatcher.dispatch(get("/version", None)).await;
        assert_eq!(text(response).await, "v1");
    }

    #[tokio::test]
    async fn test_point_release_is_served_by_major_version() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());
        let response = dispatcher
            .dispatch(get("/version", Some("application/vnd.api.v2.0.1+json")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "v2.0.1");
    }

    #[tokio::test]
    async fn test_unknown_version_is_bad_request() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());
        let response = dispatcher
            .dispatch(get("/version", Some("application/vnd.api.v9+json")))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_generic_accept() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new()).strict(true);
        let response = dispatcher
            .dispatch(get("/version", Some("application/json")))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let preflight = axum::http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/version")
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .unwrap();
        let response = dispatcher.dispatch(preflight).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ALLOW], "GET, HEAD, OPTIONS");
    }

    #[tokio::test]
    async fn test_route_parameters_reach_handler() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());
        let response = dispatcher.dispatch(get("/users/42/", None)).await;
        assert_eq!(text(response).await, "42");
    }

    #[tokio::test]
    async fn test_route_limit_headers_and_rejection() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());

        let response = dispatcher.dispatch(get("/users", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
        assert_eq!(response.headers()["x-ratelimit-reset"], "1060");

        dispatcher.dispatch(get("/users", None)).await;
        let response = dispatcher.dispatch(get("/users", None)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

        let metrics = dispatcher.metrics().get_global_metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.throttled_requests, 1);
    }

    #[tokio::test]
    async fn test_internal_requests_bypass_rate_limiting() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());
        for _ in 0..5 {
            let response = dispatcher.dispatch_internal(get("/users", None)).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
        assert_eq!(dispatcher.metrics().get_global_metrics().await.total_requests, 0);
    }

    #[tokio::test]
    async fn test_registered_policy_applies_without_route_limit() {
        let mut registry = ThrottleRegistry::new();
        registry.extend(Arc::new(PredicateThrottle::always("global", 10, 1)));
        let dispatcher = build_dispatcher(registry);

        let response = dispatcher.dispatch(get("/version", None)).await;
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
    }

    #[tokio::test]
    async fn test_protected_route_requires_authentication() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());
        let response = dispatcher.dispatch(get("/admin", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let dispatcher = build_dispatcher(ThrottleRegistry::new())
            .with_authenticator(|parts: &axum::http::request::Parts| {
                parts.headers.contains_key(header::AUTHORIZATION)
            });
        let request = axum::http::Request::builder()
            .uri("/admin")
            .header(header::AUTHORIZATION, "Bearer token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(dispatcher.dispatch(request).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_conditional_request_and_content_type() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());

        let response = dispatcher.dispatch(get("/users/7", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let etag = response.headers()[header::ETAG].clone();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );

        let request = axum::http::Request::builder()
            .uri("/users/7")
            .header(header::IF_NONE_MATCH, etag.clone())
            .body(Body::empty())
            .unwrap();
        let response = dispatcher.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers()[header::ETAG], etag);
        assert!(text(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_format_is_not_acceptable() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());
        let response = dispatcher
            .dispatch(get("/version", Some("application/vnd.api.v1+xml")))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_custom_formats_and_shared_metrics() {
        let metrics = MetricsCollector::new();
        let dispatcher = build_dispatcher(ThrottleRegistry::new())
            .with_formats(
                FormatRegistry::with_defaults()
                    .register("xml", HeaderValue::from_static("application/xml")),
            )
            .with_metrics(metrics.clone());

        let response = dispatcher
            .dispatch(get("/version", Some("application/vnd.api.v1+xml")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/xml");

        for _ in 0..3 {
            dispatcher.dispatch(get("/users", None)).await;
        }
        let policy = dispatcher
            .routes()
            .routes()
            .find(|route| route.uri() == "/users")
            .and_then(|route| route.rate_limit_policy())
            .unwrap();
        let recorded = metrics.get_policy_metrics(policy).await.unwrap();
        assert_eq!(recorded.allowed_requests, 2);
        assert_eq!(recorded.throttled_requests, 1);
    }

    #[tokio::test]
    async fn test_same_path_routes_keep_separate_windows() {
        let registry = ThrottleRegistry::new();
        let routes = VersionedRouteTable::builder(&registry)
            .version(&["v1"], GroupOptions::new(), |api| {
                api.get("/users", users).limit(2, 10);
                api.post("/users", users).limit(2, 1);
            })
            .build()
            .unwrap();
        let dispatcher = dispatcher_for(routes, registry);

        let mut statuses = Vec::new();
        for _ in 0..3 {
            for method in [Method::GET, Method::POST] {
                let request = axum::http::Request::builder()
                    .method(method.clone())
                    .uri("/users")
                    .body(Body::empty())
                    .unwrap();
                let response = dispatcher.dispatch(request).await;
                statuses.push((method, response.status()));
            }
        }

        assert_eq!(
            statuses,
            vec![
                (Method::GET, StatusCode::OK),
                (Method::POST, StatusCode::OK),
                (Method::GET, StatusCode::OK),
                (Method::POST, StatusCode::OK),
                (Method::GET, StatusCode::TOO_MANY_REQUESTS),
                (Method::POST, StatusCode::TOO_MANY_REQUESTS),
            ]
        );
    }

    #[tokio::test]
    async fn test_unregistered_format_does_not_spend_quota() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());
        for _ in 0..3 {
            let response = dispatcher
                .dispatch(get("/users", Some("application/vnd.api.v1+xml")))
                .await;
            assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }

        let response = dispatcher.dispatch(get("/users", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
    }

    #[tokio::test]
    async fn test_not_found_and_method_not_allowed() {
        let dispatcher = build_dispatcher(ThrottleRegistry::new());
        let response = dispatcher.dispatch(get("/missing", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = axum::http::Request::builder()
            .method(Method::DELETE)
            .uri("/users")
            .body(Body::empty())
            .unwrap();
        let response = dispatcher.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, HEAD, OPTIONS");
    }
}
