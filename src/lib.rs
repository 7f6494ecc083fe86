pub mod accept;
pub mod auth;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod format;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod redis;
pub mod response;
pub mod routing;
pub mod server;
pub mod validation;

pub use accept::{AcceptParser, MediaType, Negotiation};
pub use config::Config;
pub use error::{GatewayError, Result};
pub use response::RateLimitDecision;
pub use routing::{Dispatcher, GroupOptions, VersionedRouteTable};
pub use server::create_app;
