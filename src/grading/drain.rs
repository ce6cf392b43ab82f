use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::config::Settings;

use super::dispatcher::{Dispatcher, RoundSummary};
use super::store::JobStore;

#[derive(Debug, Clone, Copy)]
pub(crate) struct DrainPolicy {
    pub(crate) default_limit: usize,
    pub(crate) default_rounds: u32,
    pub(crate) max_rounds: u32,
    pub(crate) round_pause: Duration,
    pub(crate) max_duration: Duration,
    pub(crate) stale_after: Duration,
}

impl DrainPolicy {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        let drain = settings.drain();
        Self {
            default_limit: drain.default_limit,
            default_rounds: drain.default_rounds,
            max_rounds: drain.max_rounds,
            round_pause: Duration::from_millis(drain.round_pause_ms),
            max_duration: Duration::from_secs(drain.max_duration_seconds),
            stale_after: Duration::from_secs(settings.queue().stale_processing_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StopReason {
    /// Every requested round ran.
    #[default]
    RoundsCompleted,
    /// A round had capacity but found nothing pending.
    QueueEmpty,
    /// The next round would not fit in the time budget.
    TimeBudget,
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct DrainSummary {
    pub(crate) limit: usize,
    pub(crate) rounds_requested: u32,
    pub(crate) rounds: u32,
    pub(crate) recovered: usize,
    pub(crate) claimed: usize,
    pub(crate) succeeded: usize,
    pub(crate) retried: usize,
    pub(crate) failed: usize,
    pub(crate) deferred: usize,
    pub(crate) stopped: StopReason,
}

impl DrainSummary {
    fn absorb(&mut self, round: &RoundSummary) {
        self.rounds += 1;
        self.claimed += round.claimed;
        self.succeeded += round.succeeded;
        self.retried += round.retried;
        self.failed += round.failed;
        self.deferred += round.deferred;
    }
}

/// Runs a bounded number of dispatcher rounds per invocation. There is no
/// loop that waits for new work; callers trigger it again when they want
/// more progress. Overlapping invocations are safe because claims are
/// exclusive.
#[derive(Clone)]
pub(crate) struct DrainController {
    dispatcher: Dispatcher,
    store: Arc<dyn JobStore>,
    pool_size: usize,
    policy: DrainPolicy,
    shutdown: Option<watch::Receiver<bool>>,
}

impl DrainController {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        store: Arc<dyn JobStore>,
        pool_size: usize,
        policy: DrainPolicy,
    ) -> Self {
        Self { dispatcher, store, pool_size, policy, shutdown: None }
    }

    /// Stops between rounds once the receiver reports `true`.
    pub(crate) fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub(crate) fn policy(&self) -> &DrainPolicy {
        &self.policy
    }

    /// `limit` is capped at the pool size and `rounds` at `max_rounds`.
    pub(crate) async fn drain(&self, limit: usize, rounds: u32) -> Result<DrainSummary> {
        let started = Instant::now();
        let deadline = started + self.policy.max_duration;
        let limit = limit.min(self.pool_size);
        let rounds = rounds.min(self.policy.max_rounds);

        let mut summary =
            DrainSummary { limit, rounds_requested: rounds, ..DrainSummary::default() };

        let recovered = self.store.recover_stale(self.policy.stale_after).await?;
        if !recovered.is_empty() {
            metrics::counter!("grading_jobs_recovered_total").increment(recovered.len() as u64);
            tracing::warn!(count = recovered.len(), "Recovered stale grading claims");
        }
        summary.recovered = recovered.len();

        for round in 0..rounds {
            if round > 0 {
                if self.shutdown_requested() {
                    summary.stopped = StopReason::Shutdown;
                    break;
                }
                if Instant::now() + self.policy.round_pause >= deadline {
                    summary.stopped = StopReason::TimeBudget;
                    break;
                }
                if self.pause().await {
                    summary.stopped = StopReason::Shutdown;
                    break;
                }
            }

            let result = self.dispatcher.run_round(limit).await?;
            metrics::counter!("grading_drain_rounds_total").increment(1);
            summary.absorb(&result);

            if result.capacity > 0 && result.claimed == 0 {
                summary.stopped = StopReason::QueueEmpty;
                break;
            }
        }

        tracing::info!(
            limit,
            rounds = summary.rounds,
            recovered = summary.recovered,
            claimed = summary.claimed,
            succeeded = summary.succeeded,
            retried = summary.retried,
            failed = summary.failed,
            deferred = summary.deferred,
            stopped = ?summary.stopped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Drain finished"
        );

        Ok(summary)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleeps for the round pause. Returns `true` if shutdown fired meanwhile.
    async fn pause(&self) -> bool {
        let Some(mut shutdown) = self.shutdown.clone() else {
            tokio::time::sleep(self.policy.round_pause).await;
            return false;
        };

        tokio::select! {
            _ = tokio::time::sleep(self.policy.round_pause) => false,
            changed = shutdown.changed() => changed.is_ok() && *shutdown.borrow(),
        }
    }
}
