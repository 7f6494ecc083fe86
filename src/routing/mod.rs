//! Versioned routing and request dispatch.

pub mod conditional;
pub mod dispatcher;
pub mod route;
pub mod table;

pub use dispatcher::{DispatchPhase, Dispatcher, InternalRequest};
pub use route::{GroupOptions, RateLimit, Route, RouteBuilder, RouteHandler, RouteParams};
pub use table::{RouteCollection, RouteMatch, RouteTableBuilder, VersionFallback, VersionGroup, VersionedRouteTable};
