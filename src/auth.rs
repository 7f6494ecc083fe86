//! Pluggable authentication capability.
//!
//! Providers live outside this crate. The dispatcher only needs to know whether
//! a request is authenticated, both to guard routes carrying the
//! [`AUTH_MIDDLEWARE`] marker and to let throttles distinguish callers.

use axum::http::request::Parts;

/// Route middleware name marking a route as protected.
pub const AUTH_MIDDLEWARE: &str = "auth";

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, parts: &Parts) -> bool;
}

/// Treats every request as unauthenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl Authenticator for Anonymous {
    fn authenticate(&self, _parts: &Parts) -> bool {
        false
    }
}

impl<F> Authenticator for F
where
    F: Fn(&Parts) -> bool + Send + Sync,
{
    fn authenticate(&self, parts: &Parts) -> bool {
        self(parts)
    }
}
