use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub last_reset: u64,
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            allowed_requests: 0,
            throttled_requests: 0,
            last_reset: now_secs(),
        }
    }
}

/// Admission outcomes per throttle policy.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    policy_metrics: Arc<RwLock<HashMap<String, AdmissionMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_request(&self, policy: &str, allowed: bool) {
        let mut metrics = self.policy_metrics.write().await;
        let policy_metrics = metrics.entry(policy.to_string()).or_default();

        policy_metrics.total_requests += 1;
        if allowed {
            policy_metrics.allowed_requests += 1;
        } else {
            policy_metrics.throttled_requests += 1;
        }
    }

    pub async fn get_policy_metrics(&self, policy: &str) -> Option<AdmissionMetrics> {
        let metrics = self.policy_metrics.read().await;
        metrics.get(policy).cloned()
    }

    pub async fn get_all_metrics(&self) -> HashMap<String, AdmissionMetrics> {
        let metrics = self.policy_metrics.read().await;
        metrics.clone()
    }

    pub async fn reset_policy_metrics(&self, policy: &str) {
        let mut metrics = self.policy_metrics.write().await;
        if let Some(policy_metrics) = metrics.get_mut(policy) {
            *policy_metrics = AdmissionMetrics::default();
        }
    }

    pub async fn get_global_metrics(&self) -> AdmissionMetrics {
        let metrics = self.policy_metrics.read().await;
        let mut global = AdmissionMetrics::default();

        for policy_metrics in metrics.values() {
            global.total_requests += policy_metrics.total_requests;
            global.allowed_requests += policy_metrics.allowed_requests;
            global.throttled_requests += policy_metrics.throttled_requests;
        }

        global
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_request_per_policy() {
        let collector = MetricsCollector::new();
        collector.record_request("unauthenticated", true).await;
        collector.record_request("unauthenticated", false).await;
        collector.record_request("authenticated", true).await;

        let guest = collector.get_policy_metrics("unauthenticated").await.unwrap();
        assert_eq!(guest.total_requests, 2);
        assert_eq!(guest.allowed_requests, 1);
        assert_eq!(guest.throttled_requests, 1);

        let global = collector.get_global_metrics().await;
        assert_eq!(global.total_requests, 3);
        assert_eq!(global.throttled_requests, 1);
        assert_eq!(collector.get_all_metrics().await.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_policy_metrics() {
        let collector = MetricsCollector::new();
        collector.record_request("route.abc", false).await;
        collector.reset_policy_metrics("route.abc").await;

        let metrics = collector.get_policy_metrics("route.abc").await.unwrap();
        assert_eq!(metrics.total_requests, 0);
        assert!(collector.get_policy_metrics("missing").await.is_none());
    }
}
