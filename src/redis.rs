use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::rate_limit::store::{CounterHit, CounterKeys, CounterStore, CounterWindow};

/// Resets a window whose expiry changed, initialises absent counters and
/// counts the request in one round trip.
const HIT_SCRIPT: &str = r"
local expires = redis.call('GET', KEYS[2])
if expires ~= ARGV[1] then
  redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
end
redis.call('SET', KEYS[1], 0, 'NX', 'EX', ARGV[3])
redis.call('SET', KEYS[2], ARGV[1], 'NX', 'EX', ARGV[3])
redis.call('SET', KEYS[3], ARGV[2], 'NX', 'EX', ARGV[3])
local requests = redis.call('INCR', KEYS[1])
local reset = tonumber(redis.call('GET', KEYS[3])) or tonumber(ARGV[2])
return {requests, reset}
";

/// Counter store shared between gateway instances through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: MultiplexedConnection,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            GatewayError::Configuration(format!("Failed to create Redis client: {}", e))
        })?;
        let connection = client.get_multiplexed_async_connection().await.map_err(|e| {
            GatewayError::CounterStore(format!("Failed to connect to Redis: {}", e))
        })?;

        info!(target: "apigate::redis", "Connected to Redis counter store");
        Ok(Self { connection })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn add(&self, key: &str, value: i64, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let stored: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(stored.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn forget(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn hit(&self, keys: &CounterKeys, window: &CounterWindow) -> Result<CounterHit> {
        let mut conn = self.connection.clone();
        let script = redis::Script::new(HIT_SCRIPT);

        let (requests, reset_at): (i64, i64) = script
            .key(&keys.requests)
            .key(&keys.expires)
            .key(&keys.reset)
            .arg(window.expires_minutes)
            .arg(window.reset_at)
            .arg(window.ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;

        Ok(CounterHit {
            requests: u64::try_from(requests).unwrap_or_default(),
            reset_at: u64::try_from(reset_at).unwrap_or_default(),
        })
    }
}
