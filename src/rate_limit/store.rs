use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

/// Result of asking a bucket for tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TakeOutcome {
    Allowed { remaining: f64 },
    Denied { wait: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error")]
    Redis(#[from] redis::RedisError),
}

/// Keyed token-bucket storage. The take operation is atomic per key so
/// multiple dispatcher instances can share one backend.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn try_take(
        &self,
        key: &str,
        rate_per_sec: f64,
        capacity: f64,
        cost: f64,
    ) -> Result<TakeOutcome, StoreError>;

    /// Whether this backend is shared across instances.
    fn is_shared(&self) -> bool;
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn refill(tokens: f64, last_ms: u64, now_ms: u64, rate: f64, capacity: f64) -> f64 {
    let elapsed = now_ms.saturating_sub(last_ms) as f64 / 1000.0;
    (tokens + elapsed * rate).min(capacity)
}

/// Process-local bucket state. Correct for a single instance only; selecting
/// it in a multi-instance deployment weakens limiting, which is why startup
/// logs the fallback loudly.
#[derive(Default, Clone)]
pub struct InMemoryTokenStore {
    buckets: Arc<Mutex<HashMap<String, (f64, u64)>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn try_take(
        &self,
        key: &str,
        rate_per_sec: f64,
        capacity: f64,
        cost: f64,
    ) -> Result<TakeOutcome, StoreError> {
        let now = now_millis();
        let mut buckets = self.buckets.lock().expect("bucket mutex poisoned");
        let (tokens, last) = buckets
            .get(key)
            .copied()
            .unwrap_or((capacity, now));
        let tokens = refill(tokens, last, now, rate_per_sec, capacity);

        if tokens >= cost {
            let remaining = tokens - cost;
            buckets.insert(key.to_string(), (remaining, now));
            Ok(TakeOutcome::Allowed { remaining })
        } else {
            buckets.insert(key.to_string(), (tokens, now));
            let wait = Duration::from_secs_f64((cost - tokens) / rate_per_sec);
            Ok(TakeOutcome::Denied { wait })
        }
    }

    fn is_shared(&self) -> bool {
        false
    }
}

/// Shared bucket state in Redis. The refill-and-take runs as one Lua script
/// so concurrent instances cannot double-spend.
#[derive(Clone)]
pub struct RedisTokenStore {
    connection: ConnectionManager,
    script: Script,
}

const TAKE_SCRIPT: &str = r#"
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  ts = now_ms
end
local elapsed = now_ms - ts
if elapsed < 0 then elapsed = 0 end
tokens = tokens + (elapsed / 1000.0) * rate
if tokens > capacity then tokens = capacity end
local allowed = 0
local wait_ms = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
else
  wait_ms = math.ceil(((cost - tokens) / rate) * 1000)
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now_ms)
redis.call('PEXPIRE', KEYS[1], math.ceil((capacity / rate) * 2000))
return {allowed, wait_ms}
"#;

impl RedisTokenStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(TAKE_SCRIPT),
        }
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn try_take(
        &self,
        key: &str,
        rate_per_sec: f64,
        capacity: f64,
        cost: f64,
    ) -> Result<TakeOutcome, StoreError> {
        let mut connection = self.connection.clone();
        let (allowed, wait_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(rate_per_sec)
            .arg(capacity)
            .arg(now_millis())
            .arg(cost)
            .invoke_async(&mut connection)
            .await?;
        if allowed == 1 {
            Ok(TakeOutcome::Allowed { remaining: 0.0 })
        } else {
            Ok(TakeOutcome::Denied {
                wait: Duration::from_millis(wait_ms.max(0) as u64),
            })
        }
    }

    fn is_shared(&self) -> bool {
        true
    }
}
