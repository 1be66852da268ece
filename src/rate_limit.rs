//! # Rate Limiting Module
//!
//! Sliding-window request limiting per `(rule key type, identifier)`. Each
//! record keeps the timestamps of requests inside the trailing window;
//! every check purges expired entries, counts what remains, and admits the
//! request only when the count is below the limit. The purge-count-insert
//! sequence is atomic per record (a mutex for the in-memory store, a Lua
//! script for Redis), so the allowed count can never exceed the limit in
//! any rolling window, no matter how many requests race on the same key.
//!
//! Two stores are provided: the in-memory default, and a Redis sorted-set
//! store for gateways that share quota across replicas.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::core::config::RateLimitRule;
use crate::core::error::{GatewayError, GatewayResult};

/// Outcome of one rate-limit check, including standard quota metadata
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Configured maximum for the window
    pub limit: u32,
    /// Requests still available in the current window
    pub remaining: u32,
    /// Unix seconds when the oldest counted request leaves the window
    pub reset_at: u64,
    pub window: Duration,
}

/// Storage backend for sliding-window counters
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically purge, count, and (if below the limit) record a request
    async fn hit(&self, key: &str, limit: u32, window: Duration) -> GatewayResult<RateLimitDecision>;

    /// Drop records idle longer than `ttl`; returns how many were evicted.
    /// Stores with native expiry can leave this as the default no-op.
    fn evict_idle(&self, _ttl: Duration) -> usize {
        0
    }
}

/// Facade over the configured store; builds composite keys per rule
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    /// Limiter backed by process-local memory
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Limiter backed by a shared Redis store
    pub async fn redis(url: &str) -> GatewayResult<Self> {
        Ok(Self {
            store: Arc::new(RedisStore::connect(url).await?),
        })
    }

    pub fn with_store(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// Check one request against the service's rule
    pub async fn check(
        &self,
        service: &str,
        rule: &RateLimitRule,
        identifier: &str,
    ) -> GatewayResult<RateLimitDecision> {
        let key = format!("rl:{}:{}:{}", service, rule.key.as_str(), identifier);
        let decision = self.store.hit(&key, rule.limit, rule.window).await?;
        if !decision.allowed {
            debug!(key = %key, limit = rule.limit, "rate limit exceeded");
        }
        Ok(decision)
    }

    /// Evict idle records from the underlying store
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.store.evict_idle(ttl)
    }
}

/// Per-identifier sliding window of request timestamps
struct WindowRecord {
    timestamps: VecDeque<Instant>,
    last_seen: Instant,
}

/// In-memory store; one mutex per record keeps check-and-increment atomic
/// without serializing unrelated identifiers.
pub struct MemoryStore {
    records: DashMap<String, Mutex<WindowRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn hit(&self, key: &str, limit: u32, window: Duration) -> GatewayResult<RateLimitDecision> {
        let now = Instant::now();
        let entry = self.records.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(WindowRecord {
                timestamps: VecDeque::new(),
                last_seen: now,
            })
        });

        let mut record = entry.lock();
        record.last_seen = now;

        // Lazily purge everything older than the trailing window
        while let Some(front) = record.timestamps.front() {
            if now.duration_since(*front) >= window {
                record.timestamps.pop_front();
            } else {
                break;
            }
        }

        let count = record.timestamps.len() as u32;
        let allowed = count < limit;
        if allowed {
            record.timestamps.push_back(now);
        }

        // The window resets when the oldest counted request expires
        let reset_in = record
            .timestamps
            .front()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
            .unwrap_or(window);

        Ok(RateLimitDecision {
            allowed,
            limit,
            remaining: if allowed { limit - count - 1 } else { 0 },
            reset_at: unix_seconds_after(reset_in),
            window,
        })
    }

    fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, record| now.duration_since(record.lock().last_seen) < ttl);
        before - self.records.len()
    }
}

fn unix_seconds_after(delay: Duration) -> u64 {
    (SystemTime::now() + delay)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Redis-backed store using a sorted set per key
///
/// The whole purge-count-insert runs inside one Lua script, which Redis
/// executes atomically, so replicas sharing the store cannot jointly admit
/// more than `limit` requests per window.
pub struct RedisStore {
    connection: redis::aio::ConnectionManager,
    script: redis::Script,
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
local window_start = tonumber(ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, window_start)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
    allowed = 1
    count = count + 1
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_score = 0
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {allowed, count, oldest_score}
"#;

impl RedisStore {
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::config(format!("invalid redis url: {}", e)))?;
        let connection = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::internal(format!("redis connection failed: {}", e)))?;
        Ok(Self {
            connection,
            script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn hit(&self, key: &str, limit: u32, window: Duration) -> GatewayResult<RateLimitDecision> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let window_ms = window.as_millis() as u64;
        let member = format!("{}:{}", now_ms, uuid::Uuid::new_v4());

        let mut connection = self.connection.clone();
        let (allowed, count, oldest_ms): (i64, i64, i64) = self
            .script
            .key(key)
            .arg(now_ms.saturating_sub(window_ms)) // window_start
            .arg(limit)
            .arg(now_ms)
            .arg(member)
            .arg(window_ms)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| GatewayError::internal(format!("redis rate limit check failed: {}", e)))?;

        let allowed = allowed == 1;
        let oldest_ms = if oldest_ms > 0 { oldest_ms as u64 } else { now_ms };

        Ok(RateLimitDecision {
            allowed,
            limit,
            remaining: if allowed {
                limit.saturating_sub(count as u32)
            } else {
                0
            },
            reset_at: (oldest_ms + window_ms) / 1000,
            window,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RateLimitKey;

    fn rule(limit: u32, window: Duration) -> RateLimitRule {
        RateLimitRule {
            limit,
            window,
            key: RateLimitKey::Ip,
        }
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_with_descending_remaining() {
        let limiter = RateLimiter::in_memory();
        let rule = rule(5, Duration::from_secs(60));

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = limiter.check("svc", &rule, "1.2.3.4").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.limit, 5);
        }

        let sixth = limiter.check("svc", &rule, "1.2.3.4").await.unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
    }

    #[tokio::test]
    async fn test_allowed_count_never_exceeds_limit() {
        let limiter = RateLimiter::in_memory();
        let rule = rule(7, Duration::from_secs(60));

        let mut allowed = 0;
        for _ in 0..50 {
            if limiter.check("svc", &rule, "9.9.9.9").await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 7);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::in_memory();
        let rule = rule(2, Duration::from_millis(150));

        assert!(limiter.check("svc", &rule, "a").await.unwrap().allowed);
        assert!(limiter.check("svc", &rule, "a").await.unwrap().allowed);
        assert!(!limiter.check("svc", &rule, "a").await.unwrap().allowed);

        // Once the oldest request falls outside the trailing window the
        // identifier is admitted again.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(limiter.check("svc", &rule, "a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_rejection_does_not_consume_window_space() {
        let limiter = RateLimiter::in_memory();
        let rule = rule(1, Duration::from_millis(120));

        assert!(limiter.check("svc", &rule, "a").await.unwrap().allowed);
        // Hammering while full must not push the reset further out
        for _ in 0..10 {
            assert!(!limiter.check("svc", &rule, "a").await.unwrap().allowed);
        }
        tokio::time::sleep(Duration::from_millis(160)).await;
        assert!(limiter.check("svc", &rule, "a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let limiter = RateLimiter::in_memory();
        let rule = rule(1, Duration::from_secs(60));

        assert!(limiter.check("svc", &rule, "a").await.unwrap().allowed);
        assert!(!limiter.check("svc", &rule, "a").await.unwrap().allowed);
        // Different identifier, different record
        assert!(limiter.check("svc", &rule, "b").await.unwrap().allowed);
        // Same identifier under a different service is also separate
        assert!(limiter.check("other", &rule, "a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_time_is_in_the_future() {
        let limiter = RateLimiter::in_memory();
        let rule = rule(1, Duration::from_secs(60));

        let decision = limiter.check("svc", &rule, "a").await.unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(decision.reset_at >= now);
        assert!(decision.reset_at <= now + 61);
    }

    #[tokio::test]
    async fn test_idle_records_evicted() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::with_store(store.clone());
        let rule = rule(5, Duration::from_secs(60));

        limiter.check("svc", &rule, "a").await.unwrap();
        limiter.check("svc", &rule, "b").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.evict_idle(Duration::from_millis(10)), 2);
        assert_eq!(limiter.evict_idle(Duration::from_secs(60)), 0);
    }

    #[tokio::test]
    async fn test_concurrent_checks_stay_within_limit() {
        let limiter = Arc::new(RateLimiter::in_memory());
        let rule = Arc::new(rule(10, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = limiter.clone();
            let rule = rule.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("svc", &rule, "same").await.unwrap().allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
