//! Monthly LLM budget enforcement against the persisted usage ledger.

use chrono::{DateTime, Utc};
use kuntavahti_store::Store;
use tracing::warn;

/// Gate in front of every model call: spend so far this calendar month plus
/// the projected cost of the call must stay within the ceiling. At most one
/// in-flight call can overshoot, since the check happens before the call.
#[derive(Debug, Clone, Copy)]
pub struct LlmBudget {
    monthly_limit_eur: f64,
}

impl LlmBudget {
    pub fn new(monthly_limit_eur: f64) -> Self {
        Self { monthly_limit_eur }
    }

    pub fn is_active(&self) -> bool {
        self.monthly_limit_eur > 0.0
    }

    /// Whether a call with the given projected cost fits the budget.
    pub async fn allows(
        &self,
        store: &Store,
        projected_eur: f64,
        now: DateTime<Utc>,
    ) -> kuntavahti_store::Result<bool> {
        if !self.is_active() {
            return Ok(true);
        }
        let spent = store.month_to_date_cost(now).await?;
        let allowed = spent + projected_eur <= self.monthly_limit_eur;
        if !allowed {
            warn!(
                spent_eur = spent,
                projected_eur,
                limit_eur = self.monthly_limit_eur,
                "LLM budget exhausted, skipping call"
            );
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kuntavahti_common::Stage;

    #[tokio::test]
    async fn projected_overshoot_is_refused() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        store
            .record_llm_usage(None, "claude-haiku", Stage::Triage, 100_000, 5_000, 9.98, now)
            .await
            .unwrap();

        let budget = LlmBudget::new(10.0);
        assert!(!budget.allows(&store, 0.05, now).await.unwrap());
        assert!(budget.allows(&store, 0.01, now).await.unwrap());
    }

    #[tokio::test]
    async fn zero_limit_means_unlimited() {
        let store = Store::in_memory().await.unwrap();
        let budget = LlmBudget::new(0.0);
        assert!(budget.allows(&store, 1000.0, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn budget_frees_up_on_month_rollover() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        store
            .record_llm_usage(None, "claude-haiku", Stage::Triage, 100_000, 5_000, 9.98, now)
            .await
            .unwrap();

        let budget = LlmBudget::new(10.0);
        let next_month = now + chrono::Duration::days(40);
        assert!(budget.allows(&store, 0.05, next_month).await.unwrap());
    }
}
