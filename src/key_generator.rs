//! Key generation utilities for rate limiting.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::rate_limit::store::CounterKeys;
use crate::rate_limit::throttle::ThrottleContext;

/// Computes the identity a request is counted under.
pub type Limiter = Arc<dyn Fn(&ThrottleContext<'_>) -> String + Send + Sync>;

/// Strategy for deriving the default limiter identity
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterStrategy {
    /// Use client IP address
    ClientIp,
    /// Use a request header, falling back to the client IP when absent
    Header(String),
}

/// Builds limiter identities and counter keys
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    namespace: String,
    strategy: LimiterStrategy,
}

impl KeyGenerator {
    pub fn new(namespace: &str, strategy: LimiterStrategy) -> Self {
        Self {
            namespace: namespace.to_string(),
            strategy,
        }
    }

    /// Identity for the request using the configured strategy
    pub fn limiter_identity(&self, context: &ThrottleContext<'_>) -> String {
        match &self.strategy {
            LimiterStrategy::ClientIp => context.client_ip.to_string(),
            LimiterStrategy::Header(name) => context
                .parts
                .headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map_or_else(|| context.client_ip.to_string(), str::to_string),
        }
    }

    /// Counter keys for a policy and limiter identity.
    ///
    /// The policy and limiter are wrapped in a hash tag so all three keys of a
    /// window land on the same Redis cluster slot.
    pub fn counter_keys(&self, policy: &str, limiter: &str) -> CounterKeys {
        let base = format!(
            "{}:{{{}:{}}}",
            self.namespace,
            Self::sanitize_key(policy),
            Self::sanitize_key(limiter)
        );
        CounterKeys::new(&base)
    }

    /// Policy id for a route scoped limit, hashed from the route identity
    pub fn route_policy_id(identity: &str) -> String {
        format!("route.{}", hex::encode(Sha256::digest(identity.as_bytes())))
    }

    /// Encode a key component so it can be joined with `:` and braces.
    ///
    /// ASCII alphanumerics and `-_.` pass through, every other byte becomes
    /// `%XX`. Distinct components always encode to distinct strings.
    pub fn sanitize_key(key: &str) -> String {
        let mut encoded = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                encoded.push(char::from(byte));
            } else {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
        encoded
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new("apigate", LimiterStrategy::ClientIp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::testing::test_route;
    use axum::http::{request::Parts, Request};

    fn create_test_parts() -> Parts {
        Request::builder()
            .uri("/users")
            .header("x-api-key", "test-api-key")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn identity(strategy: LimiterStrategy) -> String {
        let parts = create_test_parts();
        let route = test_route();
        let context = ThrottleContext {
            parts: &parts,
            route: &route,
            client_ip: "192.168.1.1",
            authenticated: false,
        };
        KeyGenerator::new("apigate", strategy).limiter_identity(&context)
    }

    #[test]
    fn test_client_ip_strategy() {
        assert_eq!(identity(LimiterStrategy::ClientIp), "192.168.1.1");
    }

    #[test]
    fn test_header_strategy() {
        assert_eq!(
            identity(LimiterStrategy::Header("x-api-key".to_string())),
            "test-api-key"
        );
    }

    #[test]
    fn test_missing_header_falls_back_to_ip() {
        assert_eq!(
            identity(LimiterStrategy::Header("x-missing".to_string())),
            "192.168.1.1"
        );
    }

    #[test]
    fn test_counter_keys_share_hash_tag() {
        let keys = KeyGenerator::default().counter_keys("unauthenticated", "10.0.0.1");
        assert_eq!(keys.requests, "apigate:{unauthenticated:10.0.0.1}:requests");
        assert_eq!(keys.expires, "apigate:{unauthenticated:10.0.0.1}:expires");
        assert_eq!(keys.reset, "apigate:{unauthenticated:10.0.0.1}:reset");
    }

    #[test]
    fn test_route_policy_id_is_stable() {
        let id = KeyGenerator::route_policy_id("/users");
        assert_eq!(id, KeyGenerator::route_policy_id("/users"));
        assert_ne!(id, KeyGenerator::route_policy_id("/posts"));
        assert_eq!(id.len(), "route.".len() + 64);
    }

    #[test]
    fn test_sanitize_key() {
        let key = "test@key#with$special%chars";
        let sanitized = KeyGenerator::sanitize_key(key);
        assert_eq!(sanitized, "test%40key%23with%24special%25chars");
        assert_eq!(KeyGenerator::sanitize_key("::1"), "%3A%3A1");
        assert_eq!(KeyGenerator::sanitize_key("route.ab_c-1"), "route.ab_c-1");
    }

    #[test]
    fn test_colons_in_components_do_not_collide() {
        let keys = KeyGenerator::default();
        assert_ne!(
            keys.counter_keys("a:b", "c").requests,
            keys.counter_keys("a", "b:c").requests
        );
        assert_eq!(
            keys.counter_keys("unauthenticated", "2001:db8::1").requests,
            "apigate:{unauthenticated:2001%3Adb8%3A%3A1}:requests"
        );
    }
}
