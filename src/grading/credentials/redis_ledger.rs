use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use time::OffsetDateTime;

use crate::core::time::unix_millis;

use super::{CredentialLedger, LedgerEntry, RatePolicy, ReleaseOutcome};

// KEYS come in triples per credential: request log, leases, state hash.
const ACQUIRE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local rpm = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local token = ARGV[5]
local best = -1
local best_used = nil
for i = 1, #KEYS, 3 do
    redis.call("ZREMRANGEBYSCORE", KEYS[i], "-inf", now - window)
    redis.call("ZREMRANGEBYSCORE", KEYS[i + 1], "-inf", now)
    local backoff = tonumber(redis.call("HGET", KEYS[i + 2], "backoff_until") or "0")
    if backoff <= now then
        local used = redis.call("ZCARD", KEYS[i]) + redis.call("ZCARD", KEYS[i + 1])
        if used < rpm then
            local last = tonumber(redis.call("HGET", KEYS[i + 2], "last_acquired") or "-1")
            if best_used == nil or last < best_used then
                best = (i - 1) / 3
                best_used = last
            end
        end
    end
end
if best >= 0 then
    local base = best * 3 + 1
    redis.call("ZADD", KEYS[base + 1], now + ttl, token)
    redis.call("PEXPIRE", KEYS[base + 1], ttl)
    redis.call("HSET", KEYS[base + 2], "last_acquired", now)
end
return best
"#;

const RELEASE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local token = ARGV[2]
local outcome = ARGV[3]
local base = tonumber(ARGV[4])
local cap = tonumber(ARGV[5])
local window = tonumber(ARGV[6])
redis.call("ZREM", KEYS[2], token)
redis.call("ZADD", KEYS[1], now, token)
redis.call("PEXPIRE", KEYS[1], window)
if outcome == "success" then
    redis.call("HSET", KEYS[3], "backoff_until", 0, "penalty_streak", 0)
elseif outcome == "rate_limited" then
    redis.call("HINCRBY", KEYS[3], "penalty_count", 1)
    local streak = redis.call("HINCRBY", KEYS[3], "penalty_streak", 1)
    local delay = math.min(base * math.pow(2, streak - 1), cap)
    redis.call("HSET", KEYS[3], "backoff_until", math.floor(now + delay))
end
return 1
"#;

/// Credential bookkeeping shared by every process that points at the same
/// Redis and key prefix.
pub(crate) struct RedisLedger {
    connection: ConnectionManager,
    key_prefix: String,
    ids: Vec<String>,
    policy: RatePolicy,
    acquire_script: Script,
    release_script: Script,
}

impl RedisLedger {
    pub(crate) fn new(
        connection: ConnectionManager,
        key_prefix: String,
        ids: Vec<String>,
        policy: RatePolicy,
    ) -> Self {
        Self {
            connection,
            key_prefix,
            ids,
            policy,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    fn keys_for(&self, id: &str) -> [String; 3] {
        credential_keys(&self.key_prefix, id)
    }
}

fn credential_keys(prefix: &str, id: &str) -> [String; 3] {
    [format!("{prefix}:{id}:log"), format!("{prefix}:{id}:leases"), format!("{prefix}:{id}:state")]
}

#[async_trait]
impl CredentialLedger for RedisLedger {
    async fn acquire(&self, token: &str, now: OffsetDateTime) -> Result<Option<usize>> {
        if self.ids.is_empty() {
            return Ok(None);
        }

        let mut invocation = self.acquire_script.prepare_invoke();
        for id in &self.ids {
            for key in self.keys_for(id) {
                invocation.key(key);
            }
        }
        invocation
            .arg(unix_millis(now))
            .arg(self.policy.window_ms())
            .arg(self.policy.rpm_limit)
            .arg(self.policy.lease_ttl_ms())
            .arg(token);

        let mut connection = self.connection.clone();
        let picked: i64 = invocation
            .invoke_async(&mut connection)
            .await
            .context("credential acquire script failed")?;

        Ok(usize::try_from(picked).ok())
    }

    async fn release(
        &self,
        index: usize,
        token: &str,
        outcome: ReleaseOutcome,
        now: OffsetDateTime,
    ) -> Result<()> {
        let id = self
            .ids
            .get(index)
            .with_context(|| format!("unknown credential index {index}"))?;

        let mut invocation = self.release_script.prepare_invoke();
        for key in self.keys_for(id) {
            invocation.key(key);
        }
        invocation
            .arg(unix_millis(now))
            .arg(token)
            .arg(outcome.as_str())
            .arg(self.policy.backoff_base.as_millis() as i64)
            .arg(self.policy.backoff_max.as_millis() as i64)
            .arg(self.policy.window_ms());

        let mut connection = self.connection.clone();
        let _: i64 = invocation
            .invoke_async(&mut connection)
            .await
            .context("credential release script failed")?;

        Ok(())
    }

    async fn snapshot(&self, now: OffsetDateTime) -> Result<Vec<LedgerEntry>> {
        if self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let now_ms = unix_millis(now);
        let log_floor = format!("({}", now_ms - self.policy.window_ms());
        let lease_floor = format!("({now_ms}");

        let mut pipe = redis::pipe();
        for id in &self.ids {
            let [log_key, lease_key, state_key] = self.keys_for(id);
            pipe.cmd("ZCOUNT").arg(&log_key).arg(&log_floor).arg("+inf");
            pipe.cmd("ZCOUNT").arg(&lease_key).arg(&lease_floor).arg("+inf");
            pipe.cmd("HGET").arg(&state_key).arg("penalty_count");
            pipe.cmd("HGET").arg(&state_key).arg("backoff_until");
        }

        let mut connection = self.connection.clone();
        let values: Vec<Option<i64>> =
            pipe.query_async(&mut connection).await.context("credential stats read failed")?;

        Ok(values
            .chunks(4)
            .map(|chunk| LedgerEntry {
                request_count: chunk.first().copied().flatten().unwrap_or(0) as u32,
                in_flight: chunk.get(1).copied().flatten().unwrap_or(0) as u32,
                penalty_count: chunk.get(2).copied().flatten().unwrap_or(0) as u32,
                backoff_until_ms: chunk.get(3).copied().flatten().unwrap_or(0),
            })
            .collect())
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}
