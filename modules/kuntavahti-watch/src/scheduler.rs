//! Periodic driver: every tick, discover across eligible sources, then
//! drain the pipeline with a small pool of workers per stage. Owned by the
//! process entry point; there is no global scheduler state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinSet;
use tracing::{info, warn};

use kuntavahti_common::{Config, Stage};
use kuntavahti_connectors::Gateway;
use kuntavahti_store::{SourceRow, Store};

use crate::budget::LlmBudget;
use crate::llm::LanguageModel;
use crate::stages::{self, case_build, extract, fetch, triage, StageError};

/// Worker pool sizes; case build stays at one to bound strong-model
/// concurrency.
const POOLS: &[(Stage, usize)] = &[
    (Stage::Fetch, 4),
    (Stage::Extract, 2),
    (Stage::Triage, 2),
    (Stage::CaseBuild, 1),
];

/// Failures before a source enters exponential cooldown.
const COOLDOWN_FAILURE_FLOOR: i64 = 10;
/// A source without a success for this long needs admin attention.
const STALE_SUCCESS_HOURS: i64 = 72;
/// Grace period for in-flight work on shutdown.
const SHUTDOWN_GRACE_SECS: u64 = 60;

#[derive(Debug, Default)]
pub struct TickStats {
    pub discover: Option<stages::DiscoverStats>,
    pub processed: u64,
    pub stale_sources: usize,
}

pub struct Scheduler {
    store: Store,
    gateway: Arc<Gateway>,
    model: Arc<dyn LanguageModel>,
    config: Config,
    budget: LlmBudget,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        gateway: Arc<Gateway>,
        model: Arc<dyn LanguageModel>,
        config: Config,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let budget = LlmBudget::new(config.llm_monthly_budget_eur);
        Self {
            store,
            gateway,
            model,
            config,
            budget,
            shutdown,
        }
    }

    /// Run ticks until shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        info!(interval_secs = self.config.tick_interval_secs, "Scheduler running");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match self.tick().await {
                Ok(stats) => info!(
                    processed = stats.processed,
                    stale_sources = stats.stale_sources,
                    "Tick complete"
                ),
                Err(e) => warn!(error = %e, "Tick failed"),
            }

            // Sleep in slices so shutdown is honored promptly.
            let mut remaining = self.config.tick_interval_secs;
            while remaining > 0 && !self.shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                remaining -= 1;
            }
        }
        info!(
            grace_secs = SHUTDOWN_GRACE_SECS,
            "Shutdown requested, letting in-flight work settle"
        );
        Ok(())
    }

    /// One scheduler tick: discover, then drain.
    pub async fn tick(&self) -> Result<TickStats> {
        let now = Utc::now();
        let mut stats = TickStats::default();

        let sources = self.store.enabled_sources().await?;
        stats.stale_sources = sources.iter().filter(|s| needs_attention(s, now)).count();
        for source in sources.iter().filter(|s| needs_attention(s, now)) {
            warn!(
                source_id = source.id,
                municipality = %source.municipality,
                "Source has not succeeded in over 72h"
            );
        }

        let due: Vec<SourceRow> = sources
            .into_iter()
            .filter(|s| source_due(s, now))
            .collect();
        if !due.is_empty() {
            let discover_stats =
                stages::run_discover(&self.store, self.gateway.clone(), due, now).await;
            info!(%discover_stats, "Discovery pass done");
            stats.discover = Some(discover_stats);
        }

        stats.processed = self.drain().await?;
        Ok(stats)
    }

    /// Drain the pipeline until no stage has work, the per-tick budget is
    /// spent, or shutdown is requested. Each round runs every stage pool
    /// concurrently; claims are atomic so workers never collide.
    pub async fn drain(&self) -> Result<u64> {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.config.tick_drain_secs);
        let mut total: u64 = 0;

        loop {
            if self.shutdown.load(Ordering::Relaxed) || tokio::time::Instant::now() >= deadline {
                break;
            }

            let mut round: u64 = 0;
            let mut workers: JoinSet<Result<u64>> = JoinSet::new();
            for (stage, pool_size) in POOLS {
                for _ in 0..*pool_size {
                    let scheduler = self.clone_parts();
                    let stage = *stage;
                    workers.spawn(async move {
                        scheduler.run_stage_worker(stage, deadline).await
                    });
                }
            }
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(n)) => round += n,
                    Ok(Err(e)) => warn!(error = %e, "Stage worker failed"),
                    Err(e) => warn!(error = %e, "Stage worker panicked"),
                }
            }

            total += round;
            if round == 0 {
                break;
            }
        }
        Ok(total)
    }

    fn clone_parts(&self) -> SchedulerWorker {
        SchedulerWorker {
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            model: self.model.clone(),
            config: self.config.clone(),
            budget: self.budget,
            shutdown: self.shutdown.clone(),
        }
    }
}

struct SchedulerWorker {
    store: Store,
    gateway: Arc<Gateway>,
    model: Arc<dyn LanguageModel>,
    config: Config,
    budget: LlmBudget,
    shutdown: Arc<AtomicBool>,
}

impl SchedulerWorker {
    async fn run_stage_worker(&self, stage: Stage, deadline: tokio::time::Instant) -> Result<u64> {
        let mut processed: u64 = 0;
        loop {
            if self.shutdown.load(Ordering::Relaxed) || tokio::time::Instant::now() >= deadline {
                break;
            }
            let now = Utc::now();
            let Some(doc) = self.store.claim_next(stage, now).await? else {
                break;
            };

            let result = match stage {
                Stage::Fetch => {
                    fetch::fetch_document(&self.store, &self.gateway, &self.config, &doc, now).await
                }
                Stage::Extract => {
                    extract::extract_document(&self.store, &self.config, &doc, now).await
                }
                Stage::Triage => {
                    triage::triage_document(
                        &self.store,
                        self.model.as_ref(),
                        &self.config,
                        &self.budget,
                        &doc,
                        now,
                    )
                    .await
                }
                Stage::CaseBuild => {
                    case_build::build_case(
                        &self.store,
                        self.model.as_ref(),
                        &self.config,
                        &self.budget,
                        &doc,
                        now,
                    )
                    .await
                }
            };

            match result {
                Ok(()) => processed += 1,
                Err(StageError::Retryable(msg)) => {
                    warn!(document_id = doc.id, stage = %stage, error = %msg, "Stage failed, will retry");
                    if stage == Stage::Fetch {
                        let retries = self.store.increment_fetch_retries(doc.id).await?;
                        if retries >= fetch::MAX_FETCH_RETRIES {
                            self.store
                                .mark_document_error(
                                    doc.id,
                                    &format!("fetch failed after {retries} attempts: {msg}"),
                                    now,
                                )
                                .await?;
                        }
                    }
                    // Other stages keep their claim; the lease throttles the
                    // retry to the next tick.
                }
                Err(StageError::Permanent(msg)) => {
                    warn!(document_id = doc.id, stage = %stage, error = %msg, "Stage failed permanently");
                    self.store.mark_document_error(doc.id, &msg, now).await?;
                }
            }
        }
        Ok(processed)
    }
}

/// Cooldown before the next attempt once a source keeps failing:
/// `2^min(failures - 10, 12)` minutes from the 10th consecutive failure on.
pub fn cooldown_after(consecutive_failures: i64) -> Option<Duration> {
    if consecutive_failures < COOLDOWN_FAILURE_FLOOR {
        return None;
    }
    let exponent = (consecutive_failures - COOLDOWN_FAILURE_FLOOR).min(12) as u32;
    Some(Duration::minutes(2_i64.pow(exponent)))
}

/// Whether a source should be attempted now.
pub fn source_due(source: &SourceRow, now: DateTime<Utc>) -> bool {
    match cooldown_after(source.consecutive_failures) {
        None => true,
        Some(cooldown) => match source.last_attempt_at {
            None => true,
            Some(last) => now - last >= cooldown,
        },
    }
}

/// A source that hasn't succeeded in 72 hours gets flagged for the admin.
pub fn needs_attention(source: &SourceRow, now: DateTime<Utc>) -> bool {
    let stale = Duration::hours(STALE_SUCCESS_HOURS);
    match source.last_success_at {
        Some(t) => now - t > stale,
        None => now - source.created_at > stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(failures: i64, last_attempt_mins_ago: Option<i64>) -> SourceRow {
        let now = Utc::now();
        SourceRow {
            id: 1,
            municipality: "Salla".to_string(),
            platform: "tweb".to_string(),
            base_url: "http://salla.tweb.fi".to_string(),
            enabled: true,
            config_json: None,
            last_success_at: None,
            last_error: None,
            consecutive_failures: failures,
            last_attempt_at: last_attempt_mins_ago.map(|m| now - Duration::minutes(m)),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn no_cooldown_below_ten_failures() {
        assert!(cooldown_after(0).is_none());
        assert!(cooldown_after(9).is_none());
    }

    #[test]
    fn cooldown_doubles_from_the_tenth_failure() {
        assert_eq!(cooldown_after(10), Some(Duration::minutes(1)));
        assert_eq!(cooldown_after(11), Some(Duration::minutes(2)));
        assert_eq!(cooldown_after(14), Some(Duration::minutes(16)));
        // Capped at 2^12 minutes.
        assert_eq!(cooldown_after(30), Some(Duration::minutes(4096)));
        assert_eq!(cooldown_after(1000), Some(Duration::minutes(4096)));
    }

    #[test]
    fn failing_source_waits_out_its_cooldown() {
        let now = Utc::now();
        // 12 failures → 4 minute cooldown.
        assert!(!source_due(&source(12, Some(2)), now));
        assert!(source_due(&source(12, Some(5)), now));
        // Healthy sources always run.
        assert!(source_due(&source(0, Some(0)), now));
    }

    #[test]
    fn sources_without_recent_success_get_flagged() {
        let now = Utc::now();
        let mut s = source(0, None);
        s.last_success_at = Some(now - Duration::hours(80));
        assert!(needs_attention(&s, now));
        s.last_success_at = Some(now - Duration::hours(2));
        assert!(!needs_attention(&s, now));

        // Never succeeded, but brand new: not flagged yet.
        let fresh = source(0, None);
        assert!(!needs_attention(&fresh, now));
    }
}
