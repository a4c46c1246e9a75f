//! Cost accounting for LLM calls.
//!
//! Cost is computed at insert time against the pricing row active on the
//! call date. Later pricing changes never mutate recorded costs.

use crate::llm::types::TokenUsage;
use crate::storage::db::{Database, PricingRow, UsageRecordInsert};
use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

/// `(prompt - cached)/1e6 * input + cached/1e6 * cached_input + completion/1e6 * output`.
/// A NULL cached price means cached tokens bill at the full input rate.
pub fn compute_cost(usage: &TokenUsage, pricing: &PricingRow) -> f64 {
    let cached_price = pricing.cached_input_price.unwrap_or(pricing.input_price);
    let uncached_prompt = (usage.prompt_tokens - usage.cached_tokens).max(0) as f64;
    uncached_prompt / 1e6 * pricing.input_price
        + usage.cached_tokens as f64 / 1e6 * cached_price
        + usage.completion_tokens as f64 / 1e6 * pricing.output_price
}

/// One completed LLM call, as seen by the recorder.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub model: String,
    pub purpose: String,
    pub usage: TokenUsage,
    pub user_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Installed once at startup; every gateway call reports through it.
#[async_trait]
pub trait UsageObserver: Send + Sync {
    async fn record(&self, event: UsageEvent);
}

/// Default observer: prices the call and appends an llm_usage_records row.
/// Recording failures are logged, never surfaced to the caller.
pub struct DbUsageRecorder {
    db: Database,
}

impl DbUsageRecorder {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UsageObserver for DbUsageRecorder {
    async fn record(&self, event: UsageEvent) {
        let today = Utc::now().date_naive();
        let pricing = match self.db.active_pricing(&event.model, today) {
            Ok(p) => p,
            Err(e) => {
                warn!(model = %event.model, error = %e, "pricing lookup failed");
                None
            }
        };

        let (cost_usd, pricing_id) = match &pricing {
            Some(row) => (compute_cost(&event.usage, row), Some(row.id)),
            None => {
                warn!(model = %event.model, "no pricing row, recording zero cost");
                (0.0, None)
            }
        };

        metrics::counter!("llm_calls_total", 1, "purpose" => event.purpose.clone());
        metrics::counter!(
            "llm_tokens_total",
            event.usage.total_tokens.max(0) as u64,
            "purpose" => event.purpose.clone()
        );

        let insert = UsageRecordInsert {
            model: event.model,
            purpose: event.purpose,
            user_id: event.user_id,
            prompt_tokens: event.usage.prompt_tokens,
            completion_tokens: event.usage.completion_tokens,
            cached_tokens: event.usage.cached_tokens,
            cost_usd,
            metadata: event.metadata,
            pricing_id,
        };
        if let Err(e) = self.db.record_usage(&insert) {
            warn!(error = %e, "failed to record LLM usage");
        }
    }
}
