//! Scoring-service credentials and their rate-limit bookkeeping.
//!
//! Every credential has a rolling request window, a set of in-flight leases
//! and a backoff deadline. A credential is eligible when it is not backing off
//! and `requests_in_window + in_flight < rpm`. Every released lease enters
//! the window, so that sum bounds issued requests per rolling window.
//!
//! The bookkeeping lives behind [`CredentialLedger`]: [`LocalLedger`] keeps it
//! in process memory, [`RedisLedger`] keeps it in Redis so every replica draws
//! from the same budget.

mod local;
mod redis_ledger;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::config::{CredentialStoreKind, Settings};
use crate::core::redis::RedisHandle;
use crate::core::time::{seconds_until, unix_millis};

pub(crate) use local::LocalLedger;
pub(crate) use redis_ledger::RedisLedger;

/// One access key to the scoring service.
#[derive(Clone)]
pub(crate) struct Credential {
    id: String,
    api_key: String,
}

impl Credential {
    pub(crate) fn new(id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { id: id.into(), api_key: api_key.into() }
    }

    /// Ids are positional (`key-1`, `key-2`, ...) so they stay stable across
    /// restarts as long as the key list keeps its order.
    pub(crate) fn from_keys(keys: &[String]) -> Vec<Self> {
        keys.iter().enumerate().map(|(idx, key)| Self::new(format!("key-{}", idx + 1), key)).collect()
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").field("id", &self.id).field("api_key", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RatePolicy {
    pub(crate) rpm_limit: u32,
    pub(crate) window: Duration,
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_max: Duration,
    /// How long an unreleased lease keeps counting against a credential.
    pub(crate) lease_ttl: Duration,
}

impl RatePolicy {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        let credentials = settings.credentials();
        let call_timeout = Duration::from_secs(settings.scorer().timeout_seconds);
        Self {
            rpm_limit: credentials.rpm_limit,
            window: Duration::from_secs(credentials.window_seconds),
            backoff_base: Duration::from_secs(credentials.backoff_base_seconds),
            backoff_max: Duration::from_secs(credentials.backoff_max_seconds),
            lease_ttl: call_timeout * 2 + Duration::from_secs(5),
        }
    }

    /// Backoff after the `streak`-th consecutive rate-limit signal:
    /// `base * 2^(streak - 1)`, capped at `backoff_max`.
    pub(crate) fn backoff_for(&self, streak: u32) -> Duration {
        if streak == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(streak - 1).unwrap_or(u32::MAX);
        self.backoff_base.checked_mul(factor).unwrap_or(self.backoff_max).min(self.backoff_max)
    }

    pub(crate) fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }

    pub(crate) fn lease_ttl_ms(&self) -> i64 {
        self.lease_ttl.as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    Success,
    RateLimited,
    Failure,
}

impl ReleaseOutcome {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RateLimited => "rate_limited",
            Self::Failure => "failure",
        }
    }
}

/// Raw per-credential state as stored by a ledger, in ledger order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LedgerEntry {
    pub(crate) request_count: u32,
    pub(crate) in_flight: u32,
    pub(crate) penalty_count: u32,
    pub(crate) backoff_until_ms: i64,
}

impl LedgerEntry {
    pub(crate) fn is_eligible(&self, now_ms: i64, rpm_limit: u32) -> bool {
        self.backoff_until_ms <= now_ms
            && self.request_count.saturating_add(self.in_flight) < rpm_limit
    }
}

#[async_trait]
pub(crate) trait CredentialLedger: Send + Sync {
    /// Reserves the least-recently-used eligible credential under `token`
    /// and returns its index.
    async fn acquire(&self, token: &str, now: OffsetDateTime) -> Result<Option<usize>>;

    /// Drops the lease and logs the request in the window; `outcome` only
    /// decides the backoff.
    async fn release(
        &self,
        index: usize,
        token: &str,
        outcome: ReleaseOutcome,
        now: OffsetDateTime,
    ) -> Result<()>;

    /// Read-only view of every credential; never mutates counters.
    async fn snapshot(&self, now: OffsetDateTime) -> Result<Vec<LedgerEntry>>;

    fn kind(&self) -> &'static str;
}

/// A reserved credential. Must be handed back through
/// [`CredentialPool::release`]; an unreleased lease expires after the
/// policy's `lease_ttl`.
#[derive(Debug)]
pub(crate) struct CredentialLease {
    index: usize,
    token: String,
    credential: Credential,
}

impl CredentialLease {
    pub(crate) fn credential(&self) -> &Credential {
        &self.credential
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct CredentialStats {
    pub(crate) id: String,
    pub(crate) request_count: u32,
    pub(crate) in_flight: u32,
    pub(crate) penalty_count: u32,
    pub(crate) backoff_seconds: u64,
}

#[derive(Clone)]
pub(crate) struct CredentialPool {
    credentials: Arc<[Credential]>,
    ledger: Arc<dyn CredentialLedger>,
    policy: RatePolicy,
}

impl CredentialPool {
    pub(crate) fn new(
        credentials: Vec<Credential>,
        ledger: Arc<dyn CredentialLedger>,
        policy: RatePolicy,
    ) -> Self {
        Self { credentials: credentials.into(), ledger, policy }
    }

    pub(crate) fn local(credentials: Vec<Credential>, policy: RatePolicy) -> Self {
        let ledger = Arc::new(LocalLedger::new(credentials.len(), policy));
        Self::new(credentials, ledger, policy)
    }

    /// Picks the ledger named by `CREDENTIAL_STORE`. A Redis ledger needs a
    /// live connection; without one the pool degrades to process-local
    /// counters and says so in the log.
    pub(crate) async fn from_settings(settings: &Settings, redis: &RedisHandle) -> Self {
        let credentials = Credential::from_keys(&settings.scorer().api_keys);
        let policy = RatePolicy::from_settings(settings);
        let store = settings.credentials().store;

        if credentials.is_empty() {
            tracing::warn!("No scorer credentials configured; drains will not grade anything");
        }

        let pool = match store {
            CredentialStoreKind::Redis => match redis.connection().await {
                Some(connection) => {
                    let ids = credentials.iter().map(|item| item.id().to_string()).collect();
                    let ledger = Arc::new(RedisLedger::new(
                        connection,
                        settings.credentials().key_prefix.clone(),
                        ids,
                        policy,
                    ));
                    Self::new(credentials, ledger, policy)
                }
                None => {
                    tracing::error!(
                        "Redis unavailable for credential ledger; falling back to process-local \
                         counters, effective RPM now scales with replica count"
                    );
                    Self::local(credentials, policy)
                }
            },
            CredentialStoreKind::Local => {
                tracing::warn!(
                    "Using process-local credential ledger; rate limits are enforced per instance"
                );
                Self::local(credentials, policy)
            }
        };

        tracing::info!(
            credentials = pool.size(),
            rpm_limit = policy.rpm_limit,
            ledger = pool.ledger_kind(),
            configured = store.as_str(),
            "Credential pool ready"
        );

        pool
    }

    pub(crate) fn size(&self) -> usize {
        self.credentials.len()
    }

    pub(crate) fn ledger_kind(&self) -> &'static str {
        self.ledger.kind()
    }

    pub(crate) fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    pub(crate) async fn acquire(&self) -> Result<Option<CredentialLease>> {
        self.acquire_at(OffsetDateTime::now_utc()).await
    }

    pub(crate) async fn acquire_at(&self, now: OffsetDateTime) -> Result<Option<CredentialLease>> {
        if self.credentials.is_empty() {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        let Some(index) = self.ledger.acquire(&token, now).await.context("Failed to acquire credential")?
        else {
            return Ok(None);
        };

        let credential = self
            .credentials
            .get(index)
            .cloned()
            .with_context(|| format!("Ledger returned unknown credential index {index}"))?;

        Ok(Some(CredentialLease { index, token, credential }))
    }

    pub(crate) async fn release(&self, lease: CredentialLease, outcome: ReleaseOutcome) -> Result<()> {
        self.release_at(lease, outcome, OffsetDateTime::now_utc()).await
    }

    pub(crate) async fn release_at(
        &self,
        lease: CredentialLease,
        outcome: ReleaseOutcome,
        now: OffsetDateTime,
    ) -> Result<()> {
        if outcome == ReleaseOutcome::RateLimited {
            metrics::counter!(
                "grading_credential_penalties_total",
                "credential" => lease.credential.id().to_string()
            )
            .increment(1);
            tracing::warn!(credential = lease.credential.id(), "Credential rate limited; backing off");
        }

        self.ledger
            .release(lease.index, &lease.token, outcome, now)
            .await
            .with_context(|| format!("Failed to release credential {}", lease.credential.id()))
    }

    /// Credentials that could be acquired right now.
    pub(crate) async fn available(&self) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        let now_ms = unix_millis(now);
        let entries = self.ledger.snapshot(now).await.context("Failed to read credential ledger")?;
        Ok(entries.iter().filter(|entry| entry.is_eligible(now_ms, self.policy.rpm_limit)).count())
    }

    pub(crate) async fn stats(&self) -> Result<Vec<CredentialStats>> {
        self.stats_at(OffsetDateTime::now_utc()).await
    }

    pub(crate) async fn stats_at(&self, now: OffsetDateTime) -> Result<Vec<CredentialStats>> {
        let entries = self.ledger.snapshot(now).await.context("Failed to read credential ledger")?;

        Ok(self
            .credentials
            .iter()
            .zip(entries)
            .map(|(credential, entry)| CredentialStats {
                id: credential.id().to_string(),
                request_count: entry.request_count,
                in_flight: entry.in_flight,
                penalty_count: entry.penalty_count,
                backoff_seconds: seconds_until(entry.backoff_until_ms, now),
            })
            .collect())
    }
}
