use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::core::time::unix_millis;

use super::{CredentialLedger, LedgerEntry, RatePolicy, ReleaseOutcome};

#[derive(Debug, Default)]
struct SlotState {
    /// Release times (unix ms) of issued requests, oldest first.
    log: VecDeque<i64>,
    /// Lease token -> expiry (unix ms).
    leases: HashMap<String, i64>,
    penalty_count: u32,
    penalty_streak: u32,
    backoff_until_ms: i64,
    last_acquired_ms: Option<i64>,
}

impl SlotState {
    fn prune(&mut self, now_ms: i64, window_ms: i64) {
        let cutoff = now_ms - window_ms;
        while self.log.front().is_some_and(|ts| *ts <= cutoff) {
            self.log.pop_front();
        }
        self.leases.retain(|_, expires_at| *expires_at > now_ms);
    }

    fn entry(&self) -> LedgerEntry {
        LedgerEntry {
            request_count: self.log.len() as u32,
            in_flight: self.leases.len() as u32,
            penalty_count: self.penalty_count,
            backoff_until_ms: self.backoff_until_ms,
        }
    }
}

/// Credential bookkeeping held in process memory. One mutex covers all
/// credentials so selection and reservation happen in a single step.
pub(crate) struct LocalLedger {
    policy: RatePolicy,
    slots: Mutex<Vec<SlotState>>,
}

impl LocalLedger {
    pub(crate) fn new(size: usize, policy: RatePolicy) -> Self {
        let slots = (0..size).map(|_| SlotState::default()).collect();
        Self { policy, slots: Mutex::new(slots) }
    }
}

#[async_trait]
impl CredentialLedger for LocalLedger {
    async fn acquire(&self, token: &str, now: OffsetDateTime) -> Result<Option<usize>> {
        let now_ms = unix_millis(now);
        let window_ms = self.policy.window_ms();
        let mut slots = self.slots.lock().await;

        let mut picked: Option<(usize, i64)> = None;
        for (index, slot) in slots.iter_mut().enumerate() {
            slot.prune(now_ms, window_ms);
            if !slot.entry().is_eligible(now_ms, self.policy.rpm_limit) {
                continue;
            }
            let last_used = slot.last_acquired_ms.unwrap_or(i64::MIN);
            if picked.map_or(true, |(_, best)| last_used < best) {
                picked = Some((index, last_used));
            }
        }

        let Some((index, _)) = picked else {
            return Ok(None);
        };

        let slot = &mut slots[index];
        slot.leases.insert(token.to_string(), now_ms + self.policy.lease_ttl_ms());
        slot.last_acquired_ms = Some(now_ms);

        Ok(Some(index))
    }

    async fn release(
        &self,
        index: usize,
        token: &str,
        outcome: ReleaseOutcome,
        now: OffsetDateTime,
    ) -> Result<()> {
        let now_ms = unix_millis(now);
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(index) else {
            anyhow::bail!("unknown credential index {index}");
        };

        slot.leases.remove(token);
        // the call reached the scorer whatever the outcome
        slot.log.push_back(now_ms);

        match outcome {
            ReleaseOutcome::Success => {
                slot.penalty_streak = 0;
                slot.backoff_until_ms = 0;
            }
            ReleaseOutcome::RateLimited => {
                slot.penalty_count = slot.penalty_count.saturating_add(1);
                slot.penalty_streak = slot.penalty_streak.saturating_add(1);
                let backoff = self.policy.backoff_for(slot.penalty_streak);
                slot.backoff_until_ms = now_ms + backoff.as_millis() as i64;
            }
            ReleaseOutcome::Failure => {}
        }

        Ok(())
    }

    async fn snapshot(&self, now: OffsetDateTime) -> Result<Vec<LedgerEntry>> {
        let now_ms = unix_millis(now);
        let cutoff = now_ms - self.policy.window_ms();
        let slots = self.slots.lock().await;

        Ok(slots
            .iter()
            .map(|slot| LedgerEntry {
                request_count: slot.log.iter().filter(|ts| **ts > cutoff).count() as u32,
                in_flight: slot.leases.values().filter(|expires_at| **expires_at > now_ms).count()
                    as u32,
                penalty_count: slot.penalty_count,
                backoff_until_ms: slot.backoff_until_ms,
            })
            .collect())
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
