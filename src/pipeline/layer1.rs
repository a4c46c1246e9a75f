//! Layer 1: cheap relevance scoring over title + summary.
//!
//! One small-model call scores the article 0-300 across three rubric
//! dimensions and flags critical events. The total routes the article:
//! below the discard threshold it dies here, above the full-analysis
//! threshold (or critical) it gets the deep path, otherwise lightweight.

use crate::error::{AppError, AppResult};
use crate::llm::{CallOptions, ChatRequest, LlmGateway, Message, ProviderCredentials};
use crate::models::SystemSettings;
use crate::pipeline::{extract_json, purpose};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const SCORING_TIMEOUT: Duration = Duration::from_secs(30);

const SCORING_PROMPT: &str = r#"You are a financial news triage scorer. Score the article on three dimensions, each 0-100:

- relevance: is this investment-relevant news (earnings, guidance, M&A, regulation, macro data) rather than ads, listicles, or lifestyle content?
- market_impact: how strongly could this move prices of specific assets or sectors?
- actionability: does it contain concrete, datable facts an investor could act on?

Also set is_critical=true for market-moving events regardless of score (major defaults, halts, central bank surprises, large M&A).

Return JSON only:
{"dimension_scores": {"relevance": 0, "market_impact": 0, "actionability": 0}, "is_critical": false, "reasoning": "one sentence"}

Title: {title}
Summary: {summary}"#;

#[derive(Debug, Clone)]
pub struct Layer1Outcome {
    /// Sum of the dimension scores, clamped to 0-300.
    pub total_score: i32,
    pub is_critical: bool,
    /// Persisted breakdown for the score_details column.
    pub score_details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer1Route {
    Discard,
    FullAnalysis,
    Lightweight,
}

impl Layer1Outcome {
    /// Routing decision against the live thresholds.
    pub fn route(&self, settings: &SystemSettings) -> Layer1Route {
        if self.total_score < settings.layer1_discard_threshold && !self.is_critical {
            Layer1Route::Discard
        } else if self.total_score >= settings.layer1_full_analysis_threshold || self.is_critical {
            Layer1Route::FullAnalysis
        } else {
            Layer1Route::Lightweight
        }
    }
}

pub async fn score_article(
    gateway: &LlmGateway,
    settings: &SystemSettings,
    title: &str,
    summary: Option<&str>,
    url: &str,
) -> AppResult<Layer1Outcome> {
    if title.trim().is_empty() {
        return Err(AppError::Validation("cannot score an article without a title".into()));
    }

    let prompt = SCORING_PROMPT
        .replace("{title}", title)
        .replace("{summary}", summary.unwrap_or("N/A"));

    let mut request = ChatRequest::new(
        settings.layer1_scoring_model.clone(),
        vec![Message::user(prompt)],
    );
    request.temperature = Some(0.0);
    request.max_tokens = Some(300);
    request.json_response = true;
    request.timeout = SCORING_TIMEOUT;

    let opts = CallOptions::for_purpose(purpose::LAYER1_SCORING)
        .with_system(ProviderCredentials::from_settings(settings))
        .with_metadata(json!({"url": truncate(url, 80)}));

    let response = gateway.chat(&request, &opts).await?;
    let content = response.content.unwrap_or_default();

    let Some(parsed) = extract_json(&content) else {
        warn!(url, chars = content.len(), "unparseable scoring response");
        return Err(AppError::Provider("layer1 scoring returned no JSON".into()));
    };

    let dimensions = &parsed["dimension_scores"];
    let dim = |key: &str| -> i64 { dimensions[key].as_i64().unwrap_or(0).clamp(0, 100) };
    let relevance = dim("relevance");
    let market_impact = dim("market_impact");
    let actionability = dim("actionability");
    let total_score = (relevance + market_impact + actionability).clamp(0, 300) as i32;
    let is_critical = parsed["is_critical"].as_bool().unwrap_or(false);

    let score_details = json!({
        "dimension_scores": {
            "relevance": relevance,
            "market_impact": market_impact,
            "actionability": actionability,
        },
        "reasoning": parsed["reasoning"].as_str().unwrap_or(""),
        "is_critical_event": is_critical,
    });

    info!(url, total_score, is_critical, "layer1 scored");
    Ok(Layer1Outcome {
        total_score,
        is_critical,
        score_details,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(score: i32, critical: bool) -> Layer1Outcome {
        Layer1Outcome {
            total_score: score,
            is_critical: critical,
            score_details: json!({}),
        }
    }

    #[test]
    fn test_routing_thresholds() {
        let settings = SystemSettings::default(); // 105 / 195
        assert_eq!(outcome(30, false).route(&settings), Layer1Route::Discard);
        assert_eq!(outcome(104, false).route(&settings), Layer1Route::Discard);
        assert_eq!(outcome(105, false).route(&settings), Layer1Route::Lightweight);
        assert_eq!(outcome(150, false).route(&settings), Layer1Route::Lightweight);
        assert_eq!(outcome(194, false).route(&settings), Layer1Route::Lightweight);
        assert_eq!(outcome(195, false).route(&settings), Layer1Route::FullAnalysis);
        assert_eq!(outcome(230, false).route(&settings), Layer1Route::FullAnalysis);
    }

    #[test]
    fn test_critical_overrides_discard() {
        let settings = SystemSettings::default();
        assert_eq!(outcome(30, true).route(&settings), Layer1Route::FullAnalysis);
    }
}
