//! Counter store abstraction for rate limit windows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::error::{GatewayError, Result};

/// The three counters tracked per policy and limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterKeys {
    pub requests: String,
    pub expires: String,
    pub reset: String,
}

impl CounterKeys {
    pub fn new(base: &str) -> Self {
        Self {
            requests: format!("{}:requests", base),
            expires: format!("{}:expires", base),
            reset: format!("{}:reset", base),
        }
    }
}

/// A rate limit window as requested by the selected throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterWindow {
    pub expires_minutes: u64,
    pub reset_at: u64,
    pub ttl: Duration,
}

impl CounterWindow {
    pub fn new(expires_minutes: u64, now: u64) -> Self {
        let seconds = expires_minutes.saturating_mul(60);
        Self {
            expires_minutes,
            reset_at: now.saturating_add(seconds),
            // Stores reject a zero expiry.
            ttl: Duration::from_secs(seconds.max(1)),
        }
    }
}

/// Counter values observed after a request was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    pub requests: u64,
    pub reset_at: u64,
}

/// Read-only view of a window, combined with the policy limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub limit: u64,
    pub expires_minutes: u64,
    pub reset_at: u64,
}

/// Shared key/value store backing rate limit counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Store `value` under `key` unless the key already exists.
    async fn add(&self, key: &str, value: i64, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Increment `key` by one, creating it at one when absent.
    async fn increment(&self, key: &str) -> Result<i64>;

    async fn forget(&self, key: &str) -> Result<()>;

    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Drop expired entries. Stores with native expiry have nothing to do.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Count one request against a window.
    ///
    /// Resets the window when its stored expiry differs from the requested
    /// one, initialises absent counters and increments `requests`. The default
    /// implementation composes the primitive operations and is not atomic;
    /// bundled stores override it with a single atomic operation.
    async fn hit(&self, keys: &CounterKeys, window: &CounterWindow) -> Result<CounterHit> {
        let expires = i64::try_from(window.expires_minutes).unwrap_or(i64::MAX);
        let reset_at = i64::try_from(window.reset_at).unwrap_or(i64::MAX);

        if self.get(&keys.expires).await? != Some(expires) {
            self.forget(&keys.requests).await?;
            self.forget(&keys.expires).await?;
            self.forget(&keys.reset).await?;
        }

        self.add(&keys.requests, 0, window.ttl).await?;
        self.add(&keys.expires, expires, window.ttl).await?;
        self.add(&keys.reset, reset_at, window.ttl).await?;

        let requests = self.increment(&keys.requests).await?;
        let reset_at = self.get(&keys.reset).await?.unwrap_or(reset_at);

        Ok(CounterHit {
            requests: u64::try_from(requests).unwrap_or_default(),
            reset_at: u64::try_from(reset_at).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process counter store. Suitable for a single gateway instance.
#[derive(Debug, Clone)]
pub struct MemoryCounterStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|_| {
            GatewayError::CounterStore("Failed to acquire lock on memory counters".to_string())
        })
    }

    fn live_value(entries: &HashMap<String, Entry>, key: &str, now: u64) -> Option<i64> {
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value)
    }

    fn add_entry(entries: &mut HashMap<String, Entry>, key: &str, value: i64, ttl: Duration, now: u64) -> bool {
        if Self::live_value(entries, key, now).is_some() {
            return false;
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(now.saturating_add(ttl.as_secs())),
            },
        );
        true
    }

    fn increment_entry(entries: &mut HashMap<String, Entry>, key: &str, now: u64) -> i64 {
        match entries.get_mut(key).filter(|entry| entry.is_live(now)) {
            Some(entry) => {
                entry.value += 1;
                entry.value
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: 1,
                        expires_at: None,
                    },
                );
                1
            }
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn add(&self, key: &str, value: i64, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        Ok(Self::add_entry(&mut entries, key, value, ttl, now))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(Self::live_value(&entries, key, now))
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        Ok(Self::increment_entry(&mut entries, key, now))
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let initial_count = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(initial_count - entries.len())
    }

    async fn hit(&self, keys: &CounterKeys, window: &CounterWindow) -> Result<CounterHit> {
        let now = self.clock.now();
        let expires = i64::try_from(window.expires_minutes).unwrap_or(i64::MAX);
        let reset_at = i64::try_from(window.reset_at).unwrap_or(i64::MAX);

        // One critical section per hit, so concurrent requests cannot
        // interleave between initialisation and increment.
        let mut entries = self.lock()?;

        if Self::live_value(&entries, &keys.expires, now) != Some(expires) {
            entries.remove(&keys.requests);
            entries.remove(&keys.expires);
            entries.remove(&keys.reset);
        }

        Self::add_entry(&mut entries, &keys.requests, 0, window.ttl, now);
        Self::add_entry(&mut entries, &keys.expires, expires, window.ttl, now);
        Self::add_entry(&mut entries, &keys.reset, reset_at, window.ttl, now);

        let requests = Self::increment_entry(&mut entries, &keys.requests, now);
        let reset_at = Self::live_value(&entries, &keys.reset, now).unwrap_or(reset_at);

        Ok(CounterHit {
            requests: u64::try_from(requests).unwrap_or_default(),
            reset_at: u64::try_from(reset_at).unwrap_or_default(),
        })
    }
}
