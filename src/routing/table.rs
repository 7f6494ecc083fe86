//! Versioned route table.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::Method;
use clap::ValueEnum;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::rate_limit::throttle::{RouteThrottle, Throttle, ThrottleRegistry};
use crate::routing::route::{
    normalize, GroupOptions, PathPattern, Route, RouteBuilder, RouteHandler, RouteParams,
};

/// How a requested version is matched against registered versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum VersionFallback {
    /// Only the exact version string matches.
    Exact,
    /// `v2.0.1` may be served by `v2.0`, then `v2`. Exact matches win.
    #[default]
    PointRelease,
}

/// Result of matching a request within one version's routes.
#[derive(Debug, Clone)]
pub enum RouteMatch {
    Found(Arc<Route>, RouteParams),
    /// An `OPTIONS` request for a path without an explicit `OPTIONS` route.
    Options(Vec<Method>),
}

/// Ordered routes registered for one version.
#[derive(Debug, Clone, Default)]
pub struct RouteCollection {
    routes: Vec<Arc<Route>>,
}

impl RouteCollection {
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First route matching host, path and method, in registration order.
    pub fn match_request(&self, method: &Method, host: Option<&str>, path: &str) -> Result<RouteMatch> {
        let mut allowed: Vec<Method> = Vec::new();

        for route in self.routes.iter().filter(|r| r.matches_domain(host)) {
            let Some(params) = route.match_path(path) else {
                continue;
            };
            if route.allows(method) {
                return Ok(RouteMatch::Found(Arc::clone(route), params));
            }
            for m in route.methods() {
                if !allowed.contains(m) {
                    allowed.push(m.clone());
                }
            }
        }

        if allowed.is_empty() {
            return Err(GatewayError::NotFound(normalize(path)));
        }

        if allowed.contains(&Method::GET) && !allowed.contains(&Method::HEAD) {
            allowed.push(Method::HEAD);
        }
        if !allowed.contains(&Method::OPTIONS) {
            allowed.push(Method::OPTIONS);
        }

        if *method == Method::OPTIONS {
            return Ok(RouteMatch::Options(allowed));
        }

        Err(GatewayError::MethodNotAllowed {
            method: method.clone(),
            allowed,
        })
    }
}

/// Route collections keyed by version.
#[derive(Debug, Clone, Default)]
pub struct VersionedRouteTable {
    collections: BTreeMap<String, RouteCollection>,
    fallback: VersionFallback,
}

impl VersionedRouteTable {
    pub fn builder(registry: &ThrottleRegistry) -> RouteTableBuilder<'_> {
        RouteTableBuilder::new(registry)
    }

    /// Collection serving `version`, and the version it is registered under.
    pub fn resolve(&self, version: &str) -> Option<(&str, &RouteCollection)> {
        if let Some((name, routes)) = self.collections.get_key_value(version) {
            return Some((name.as_str(), routes));
        }

        if self.fallback == VersionFallback::Exact {
            return None;
        }

        let mut candidate = version;
        while let Some((parent, _)) = candidate.rsplit_once('.') {
            if let Some((name, routes)) = self.collections.get_key_value(parent) {
                return Some((name.as_str(), routes));
            }
            candidate = parent;
        }

        None
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.collections.values().flat_map(|c| c.routes.iter())
    }

    pub fn fallback(&self) -> VersionFallback {
        self.fallback
    }
}

/// Routes registered within a `version(...)` block.
pub struct VersionGroup {
    versions: Vec<String>,
    options: GroupOptions,
    routes: Vec<RouteBuilder>,
}

impl VersionGroup {
    pub fn route<H>(&mut self, methods: &[Method], path: &str, handler: H) -> &mut RouteBuilder
    where
        H: RouteHandler + 'static,
    {
        let index = self.routes.len();
        self.routes
            .push(RouteBuilder::new(methods.to_vec(), path, Arc::new(handler)));
        &mut self.routes[index]
    }

    pub fn get<H: RouteHandler + 'static>(&mut self, path: &str, handler: H) -> &mut RouteBuilder {
        self.route(&[Method::GET], path, handler)
    }

    pub fn post<H: RouteHandler + 'static>(&mut self, path: &str, handler: H) -> &mut RouteBuilder {
        self.route(&[Method::POST], path, handler)
    }

    pub fn put<H: RouteHandler + 'static>(&mut self, path: &str, handler: H) -> &mut RouteBuilder {
        self.route(&[Method::PUT], path, handler)
    }

    pub fn patch<H: RouteHandler + 'static>(&mut self, path: &str, handler: H) -> &mut RouteBuilder {
        self.route(&[Method::PATCH], path, handler)
    }

    pub fn delete<H: RouteHandler + 'static>(&mut self, path: &str, handler: H) -> &mut RouteBuilder {
        self.route(&[Method::DELETE], path, handler)
    }

    pub fn options<H: RouteHandler + 'static>(&mut self, path: &str, handler: H) -> &mut RouteBuilder {
        self.route(&[Method::OPTIONS], path, handler)
    }
}

/// Collects version groups and produces an immutable [`VersionedRouteTable`].
pub struct RouteTableBuilder<'a> {
    registry: &'a ThrottleRegistry,
    prefix: Option<String>,
    domain: Option<String>,
    conditional_request: bool,
    fallback: VersionFallback,
    groups: Vec<VersionGroup>,
}

impl<'a> RouteTableBuilder<'a> {
    fn new(registry: &'a ThrottleRegistry) -> Self {
        Self {
            registry,
            prefix: None,
            domain: None,
            conditional_request: true,
            fallback: VersionFallback::default(),
            groups: Vec::new(),
        }
    }

    /// Prefix applied to every group.
    pub fn prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.map(str::to_string);
        self
    }

    /// Domain applied to groups that do not set their own.
    pub fn domain(mut self, domain: Option<&str>) -> Self {
        self.domain = domain.map(str::to_string);
        self
    }

    /// Default used when neither route nor group sets `conditional_request`.
    pub fn conditional_request(mut self, enabled: bool) -> Self {
        self.conditional_request = enabled;
        self
    }

    pub fn version_fallback(mut self, fallback: VersionFallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Register routes for one or more versions.
    pub fn version<F>(mut self, versions: &[&str], options: GroupOptions, register: F) -> Self
    where
        F: FnOnce(&mut VersionGroup),
    {
        let mut group = VersionGroup {
            versions: versions.iter().map(|v| v.to_string()).collect(),
            options,
            routes: Vec::new(),
        };
        register(&mut group);
        self.groups.push(group);
        self
    }

    pub fn build(self) -> Result<VersionedRouteTable> {
        let mut collections: BTreeMap<String, RouteCollection> = BTreeMap::new();

        for (group_index, group) in self.groups.iter().enumerate() {
            if group.versions.is_empty() {
                return Err(GatewayError::Configuration(
                    "A route group must list at least one version".to_string(),
                ));
            }

            let group_throttle = group
                .options
                .throttle
                .as_ref()
                .map(|reference| self.registry.resolve(reference))
                .transpose()?;

            for (route_index, builder) in group.routes.iter().enumerate() {
                let position = format!("{}.{}", group_index, route_index);
                let route = Arc::new(self.finish_route(
                    group,
                    builder,
                    &position,
                    group_throttle.as_ref(),
                )?);
                debug!(
                    target: "apigate::routing",
                    uri = %route.uri(),
                    methods = ?route.methods(),
                    versions = ?route.versions(),
                    "Route registered"
                );
                for version in &group.versions {
                    collections
                        .entry(version.clone())
                        .or_default()
                        .routes
                        .push(Arc::clone(&route));
                }
            }
        }

        Ok(VersionedRouteTable {
            collections,
            fallback: self.fallback,
        })
    }

    fn finish_route(
        &self,
        group: &VersionGroup,
        builder: &RouteBuilder,
        position: &str,
        group_throttle: Option<&Arc<dyn Throttle>>,
    ) -> Result<Route> {
        if builder.methods.is_empty() {
            return Err(GatewayError::InvalidRoute {
                path: builder.path.clone(),
                reason: "No methods given".to_string(),
            });
        }

        let uri = normalize(&format!(
            "{}/{}/{}",
            self.prefix.as_deref().unwrap_or_default(),
            group.options.prefix.as_deref().unwrap_or_default(),
            builder.path
        ));
        let pattern = PathPattern::compile(&uri, &builder.wheres)?;

        let throttle = match &builder.throttle {
            Some(reference) => Some(self.registry.resolve(reference)?),
            None => group_throttle.cloned(),
        };

        let rate_limit = if builder.rate_limit.is_set() {
            builder.rate_limit
        } else {
            group.options.rate_limit
        };
        let domain = group.options.domain.clone().or_else(|| self.domain.clone());
        let route_throttle: Option<Arc<dyn Throttle>> = rate_limit.is_set().then(|| {
            let identity = route_identity(position, group, domain.as_deref(), &builder.methods, &uri);
            Arc::new(RouteThrottle::for_route(&identity, rate_limit.limit, rate_limit.expires))
                as Arc<dyn Throttle>
        });

        let mut middleware = group.options.middleware.clone();
        middleware.extend(builder.middleware.iter().cloned());

        Ok(Route {
            methods: builder.methods.clone(),
            uri,
            pattern,
            versions: group.versions.clone(),
            name: builder.name.clone(),
            domain,
            handler: Arc::clone(&builder.handler),
            rate_limit,
            throttle,
            route_throttle,
            conditional_request: builder
                .conditional_request
                .or(group.options.conditional_request)
                .unwrap_or(self.conditional_request),
            middleware,
        })
    }
}

/// Registration position, versions, domain, methods and path of a route.
fn route_identity(
    position: &str,
    group: &VersionGroup,
    domain: Option<&str>,
    methods: &[Method],
    uri: &str,
) -> String {
    let methods: Vec<&str> = methods.iter().map(Method::as_str).collect();
    format!(
        "{}|{}|{}|{}|{}",
        position,
        group.versions.join(","),
        domain.unwrap_or("*"),
        methods.join(","),
        uri
    )
}
