use std::sync::Arc;
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::rate_limit::CounterStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unavailable,
}

/// Liveness report served on `/health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: Health,
    pub checked_at: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Dependencies,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Dependencies {
    pub counter_store: StoreStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreStatus {
    pub backend: String,
    pub status: Health,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoreStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == Health::Healthy
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn CounterStore>,
    started: SystemTime,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            started: SystemTime::now(),
        }
    }

    pub async fn check_health(&self) -> HealthReport {
        let now = SystemTime::now();
        let counter_store = self.check_counter_store().await;

        // Admission fails closed without the counter store.
        let status = if counter_store.is_healthy() {
            Health::Healthy
        } else {
            Health::Unhealthy
        };

        HealthReport {
            status,
            checked_at: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: now.duration_since(self.started).unwrap_or_default().as_secs(),
            dependencies: Dependencies { counter_store },
        }
    }

    /// Pings the counter store, timing the round trip.
    pub async fn check_counter_store(&self) -> StoreStatus {
        let start = Instant::now();
        let result = self.store.ping().await;
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (status, error) = match result {
            Ok(()) => (Health::Healthy, None),
            Err(e) => (Health::Unavailable, Some(e.to_string())),
        };

        StoreStatus {
            backend: self.store.name().to_string(),
            status,
            latency_ms,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::MemoryCounterStore;

    #[test]
    fn test_report_serializes_lowercase_status() {
        let report = HealthReport {
            status: Health::Unhealthy,
            checked_at: 1234567890,
            version: "1.0.0".to_string(),
            uptime_seconds: 3600,
            dependencies: Dependencies {
                counter_store: StoreStatus {
                    backend: "redis".to_string(),
                    status: Health::Unavailable,
                    latency_ms: 5,
                    error: Some("connection refused".to_string()),
                },
            },
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["dependencies"]["counter_store"]["status"], "unavailable");
        assert_eq!(json["dependencies"]["counter_store"]["error"], "connection refused");
    }

    #[tokio::test]
    async fn test_memory_store_is_healthy() {
        let checker = HealthChecker::new(Arc::new(MemoryCounterStore::new()));
        let report = checker.check_health().await;
        assert_eq!(report.status, Health::Healthy);
        assert_eq!(report.dependencies.counter_store.backend, "memory");
        assert!(report.dependencies.counter_store.error.is_none());
    }
}
