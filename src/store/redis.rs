use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{CounterStore, WindowOutcome, unavailable};
use crate::error::Result;

// Entries live in a sorted set scored by timestamp; members carry the
// increment amount ("ts:tag:amount"). The tag is unique across gateway
// instances, so two admissions in the same millisecond can never
// collapse into one member. Prune + sum + conditional append runs as
// one script so concurrent instances cannot jointly exceed a limit. A
// negative limit skips the check (plain append).
const WINDOW_SCRIPT: &str = r#"
local window_ms = tonumber(ARGV[1])
local amount = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])
local tag = ARGV[5]

redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", now_ms - window_ms)

local current = 0
local oldest = -1
local entries = redis.call("ZRANGE", KEYS[1], 0, -1, "WITHSCORES")
for i = 1, #entries, 2 do
  current = current + (tonumber(string.match(entries[i], "([^:]+)$")) or 0)
  local score = tonumber(entries[i + 1])
  if oldest < 0 or score < oldest then
    oldest = score
  end
end

local oldest_age = 0
if oldest >= 0 then
  oldest_age = math.floor((now_ms - oldest) / 1000)
end

if limit >= 0 and current + amount > limit then
  return {0, current, oldest_age}
end

redis.call("ZADD", KEYS[1], now_ms, now_ms .. ":" .. tag .. ":" .. amount)
redis.call("PEXPIRE", KEYS[1], window_ms + 60000)
return {1, current + amount, oldest_age}
"#;

/// Counter store backed by a shared redis, usable across memory-isolated
/// gateway instances. There is no non-atomic fallback: if scripting or
/// the connection fails, the error is surfaced and the caller decides
/// whether to fail open or closed.
#[derive(Debug)]
pub struct RedisCounterStore {
    client: redis::Client,
    /// Random per-instance id baked into every member tag. Memory-isolated
    /// instances share the sorted set, and a per-process sequence alone
    /// would let two instances produce the identical member in the same
    /// millisecond, collapsing two admissions into one entry.
    instance: u64,
    seq: AtomicU64,
}

impl RedisCounterStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url.as_ref()).map_err(unavailable)?,
            instance: rand::random(),
            seq: AtomicU64::new(0),
        })
    }

    fn next_member_tag(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{seq}", self.instance)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    async fn run_window_script(
        &self,
        key: &str,
        window_seconds: u64,
        amount: u64,
        limit: i64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(WINDOW_SCRIPT);
        let reply: Vec<i64> = script
            .key(key)
            .arg(window_seconds.saturating_mul(1000))
            .arg(amount)
            .arg(limit)
            .arg(now_ms)
            .arg(self.next_member_tag())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if reply.len() != 3 {
            return Err(unavailable(format!(
                "unexpected window script reply: {reply:?}"
            )));
        }
        Ok(WindowOutcome {
            allowed: reply[0] == 1,
            current: reply[1].max(0) as u64,
            oldest_age_seconds: reply[2].max(0) as u64,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_window(
        &self,
        key: &str,
        window_seconds: u64,
        amount: u64,
        limit: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run_window_script(key, window_seconds, amount, limit, now_ms)
            .await
    }

    async fn append_window(
        &self,
        key: &str,
        window_seconds: u64,
        amount: u64,
        now_ms: u64,
    ) -> Result<()> {
        self.run_window_script(key, window_seconds, amount, -1, now_ms)
            .await
            .map(|_| ())
    }

    async fn read_counter(&self, key: &str, _now_ms: u64) -> Result<u64> {
        let mut conn = self.connection().await?;
        let value: Option<u64> = conn.get(key).await.map_err(unavailable)?;
        Ok(value.unwrap_or(0))
    }

    async fn add_counter(
        &self,
        key: &str,
        amount: u64,
        ttl_seconds: Option<u64>,
        _now_ms: u64,
    ) -> Result<u64> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().incr(key, amount);
        if let Some(ttl) = ttl_seconds {
            pipe.expire(key, ttl as i64).ignore();
        }
        let (value,): (u64,) = pipe.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(value)
    }
}
