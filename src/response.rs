use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use crate::error::GatewayError;
use crate::rate_limit::store::CounterSnapshot;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Quota reporting headers attached to every rate limited response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset: u64,
}

impl RateLimitHeaders {
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_LIMIT),
            HeaderValue::from(self.limit),
        );
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_REMAINING),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_RESET),
            HeaderValue::from(self.reset),
        );
    }
}

/// Outcome of admission control for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub policy: String,
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: u64,
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    pub fn allowed(policy: &str, limit: u64, remaining: u64, reset_time: u64) -> Self {
        Self {
            policy: policy.to_string(),
            allowed: true,
            limit,
            remaining,
            reset_time,
            retry_after: None,
        }
    }

    pub fn denied(policy: &str, limit: u64, reset_time: u64, retry_after: u64) -> Self {
        Self {
            policy: policy.to_string(),
            allowed: false,
            limit,
            remaining: 0,
            reset_time,
            retry_after: Some(retry_after),
        }
    }

    /// Build a decision from the counter state observed after the increment.
    pub fn from_snapshot(policy: &str, snapshot: &CounterSnapshot, now: u64) -> Self {
        if snapshot.requests <= snapshot.limit {
            Self::allowed(
                policy,
                snapshot.limit,
                snapshot.limit - snapshot.requests,
                snapshot.reset_at,
            )
        } else {
            Self::denied(
                policy,
                snapshot.limit,
                snapshot.reset_at,
                snapshot.reset_at.saturating_sub(now),
            )
        }
    }

    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset_time,
        }
    }

    /// The error returned to the client when this decision denies the request.
    pub fn rejection(&self) -> GatewayError {
        GatewayError::RateLimitExceeded {
            headers: self.headers(),
            retry_after: self.retry_after.unwrap_or_default(),
        }
    }
}
