//! Redis limiter store
//!
//! Counters live in Redis so limits hold across every worker process that
//! shares the same server. Each check-and-update runs as a Lua script.

use crate::error::LimitResult;
use crate::kind::LimiterKind;
use crate::stores::{Admission, LimiterStore, bucket_position, epoch_millis};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

const ACQUIRE_SLOT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local expires = tonumber(ARGV[3])
local token = ARGV[4]

local reclaimed = redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
local held = redis.call('ZCARD', key)

if held < capacity then
    redis.call('ZADD', key, expires, token)
    redis.call('PEXPIREAT', key, expires + 1000)
    return {1, capacity - held - 1, 0, reclaimed}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local wait = 0
if oldest[2] then
    wait = tonumber(oldest[2]) - now
end
return {0, 0, wait, reclaimed}
"#;

const BUCKET_TAKE: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local index = ARGV[2]
local ttl = tonumber(ARGV[3])

local current = redis.call('HGET', key, 'index')
local count = 0
if current == index then
    count = tonumber(redis.call('HGET', key, 'count')) or 0
end

if count < capacity then
    count = count + 1
    redis.call('HSET', key, 'index', index, 'count', count)
    redis.call('PEXPIRE', key, ttl)
    return {1, capacity - count}
end
return {0, 0}
"#;

const WINDOW_TAKE: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - period)
local count = redis.call('ZCARD', key)

if count < capacity then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, period + 1000)
    return {1, capacity - count - 1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local wait = 0
if oldest[2] then
    wait = tonumber(oldest[2]) + period - now
end
return {0, 0, wait}
"#;

/// Redis-backed limiter store
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect to Redis (e.g. "redis://localhost:6379")
    pub async fn new(url: &str) -> LimitResult<Self> {
        debug!(url = %url, "Connecting to Redis for limiters");

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            prefix: "jobwright:limiter".to_string(),
        })
    }

    /// Connect with a custom key prefix
    pub async fn with_prefix(url: &str, prefix: impl Into<String>) -> LimitResult<Self> {
        let mut store = Self::new(url).await?;
        store.prefix = prefix.into();
        Ok(store)
    }

    fn key(&self, kind: &str, name: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, name)
    }
}

fn wait_hint(ms: i64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}

#[async_trait]
impl LimiterStore for RedisStore {
    async fn acquire_slot(
        &self,
        name: &str,
        capacity: u64,
        lock_timeout: Duration,
    ) -> LimitResult<Admission> {
        let now = epoch_millis();
        let token = Uuid::new_v4().to_string();

        let mut conn = self.conn.clone();
        let (allowed, remaining, wait, reclaimed): (i64, i64, i64, i64) =
            redis::Script::new(ACQUIRE_SLOT)
                .key(self.key("concurrent", name))
                .arg(capacity)
                .arg(now)
                .arg(now + lock_timeout.as_millis() as u64)
                .arg(&token)
                .invoke_async(&mut conn)
                .await?;

        trace!(limiter = %name, allowed = allowed == 1, "Redis concurrent acquire");

        Ok(Admission {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            retry_after: if allowed == 1 { None } else { wait_hint(wait) },
            token: (allowed == 1).then_some(token),
            reclaimed: reclaimed.max(0) as u64,
        })
    }

    async fn release_slot(&self, name: &str, token: &str) -> LimitResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.key("concurrent", name))
            .arg(token)
            .query_async(&mut conn)
            .await?;
        trace!(limiter = %name, released = removed > 0, "Redis concurrent release");
        Ok(removed > 0)
    }

    async fn bucket_take(
        &self,
        name: &str,
        capacity: u64,
        period: Duration,
    ) -> LimitResult<Admission> {
        let (index, until_boundary) = bucket_position(epoch_millis(), period);

        let mut conn = self.conn.clone();
        let (allowed, remaining): (i64, i64) = redis::Script::new(BUCKET_TAKE)
            .key(self.key("bucket", name))
            .arg(capacity)
            .arg(index.to_string())
            .arg(period.as_millis() as u64 + 1000)
            .invoke_async(&mut conn)
            .await?;

        trace!(limiter = %name, allowed = allowed == 1, "Redis bucket take");

        if allowed == 1 {
            Ok(Admission::allowed(remaining.max(0) as u64))
        } else {
            Ok(Admission::denied(Some(until_boundary)))
        }
    }

    async fn window_take(
        &self,
        name: &str,
        capacity: u64,
        period: Duration,
    ) -> LimitResult<Admission> {
        let now = epoch_millis();
        let member = format!("{}-{}", now, Uuid::new_v4());

        let mut conn = self.conn.clone();
        let (allowed, remaining, wait): (i64, i64, i64) = redis::Script::new(WINDOW_TAKE)
            .key(self.key("window", name))
            .arg(capacity)
            .arg(now)
            .arg(period.as_millis() as u64)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        trace!(limiter = %name, allowed = allowed == 1, "Redis window take");

        if allowed == 1 {
            Ok(Admission::allowed(remaining.max(0) as u64))
        } else {
            Ok(Admission::denied(wait_hint(wait)))
        }
    }

    async fn in_use(&self, name: &str, kind: &LimiterKind) -> LimitResult<u64> {
        let now = epoch_millis();
        let mut conn = self.conn.clone();

        let used: i64 = match kind {
            LimiterKind::Concurrent { .. } => {
                redis::cmd("ZCOUNT")
                    .arg(self.key("concurrent", name))
                    .arg(format!("({}", now))
                    .arg("+inf")
                    .query_async(&mut conn)
                    .await?
            }
            LimiterKind::Bucket { period, .. } => {
                let (index, _) = bucket_position(now, *period);
                let (stored, count): (Option<String>, Option<i64>) = redis::cmd("HMGET")
                    .arg(self.key("bucket", name))
                    .arg("index")
                    .arg("count")
                    .query_async(&mut conn)
                    .await?;
                if stored.as_deref() == Some(index.to_string().as_str()) {
                    count.unwrap_or(0)
                } else {
                    0
                }
            }
            LimiterKind::Window { period, .. } => {
                redis::cmd("ZCOUNT")
                    .arg(self.key("window", name))
                    .arg(format!("({}", now.saturating_sub(period.as_millis() as u64)))
                    .arg("+inf")
                    .query_async(&mut conn)
                    .await?
            }
        };

        Ok(used.max(0) as u64)
    }

    async fn reset(&self, name: &str) -> LimitResult<()> {
        debug!(limiter = %name, "Resetting limiter state in Redis");

        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key("concurrent", name))
            .arg(self.key("bucket", name))
            .arg(self.key("window", name))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}
