//! Layer 2: final classification.
//!
//! Two variants share the decision semantics. Deep filter (full-analysis
//! path) extracts up to 8 entities plus detailed summary and an analysis
//! report; lightweight caps entities at 4 and skips the expensive fields.
//! Transport errors propagate (the stage fails and is retried on a later
//! pass); an unparseable response fails open to keep-with-empty-metadata.

use crate::error::AppResult;
use crate::llm::{CallOptions, ChatRequest, LlmGateway, Message, ProviderCredentials};
use crate::models::{EntityType, FilterStatus, RelatedEntity, Sentiment, SystemSettings};
use crate::pipeline::{extract_json, purpose};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const DEEP_TIMEOUT: Duration = Duration::from_secs(90);
const LIGHTWEIGHT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ENTITIES_DEEP: usize = 8;
const MAX_ENTITIES_LIGHT: usize = 4;
const MAX_TAGS: usize = 5;
const MAX_SUMMARY_CHARS: usize = 500;

/// Text caps per variant (chars).
const DEEP_TEXT_CHARS: usize = 20000;
const LIGHT_TEXT_CHARS: usize = 3000;

const DEEP_PROMPT: &str = r#"You are a financial news analyst. Read the full article and return JSON:

{
  "decision": "keep" or "delete",
  "entities": [{"entity": "AAPL", "type": "stock", "score": 0.8}],
  "sentiment": "bullish" / "bearish" / "neutral",
  "industry_tags": ["tech"],
  "event_tags": ["earnings"],
  "investment_summary": "2-3 sentences on the investment angle",
  "detailed_summary": "a faithful paragraph-level summary",
  "analysis_report": "markdown analysis: what happened, who is affected, likely market reaction, risks"
}

- decision: delete only for ads, spam, or content with zero investment value
- entities: at most 8; type is stock (use the ticker), index, or macro; score in [0,1] is relevance
- tags: at most 5 each, short lowercase slugs

Source: {source}
Title: {title}

Article:
{text}"#;

const LIGHTWEIGHT_PROMPT: &str = r#"Quickly extract key facts from this news item. Return JSON:

{
  "decision": "keep" or "delete",
  "entities": [{"entity": "AAPL", "type": "stock", "score": 0.8}],
  "sentiment": "bullish" / "bearish" / "neutral",
  "industry_tags": ["tech"],
  "event_tags": ["earnings"],
  "investment_summary": "one concise sentence"
}

- decision: delete = ad / filler / no investment value at all
- entities: at most 4; type is stock (use the ticker), index, or macro
- do NOT produce detailed_summary or analysis_report

Title: {title}
Text: {text}"#;

#[derive(Debug, Clone)]
pub struct Layer2Outcome {
    pub decision: FilterStatus,
    pub entities: Vec<RelatedEntity>,
    pub sentiment: Sentiment,
    pub industry_tags: Vec<String>,
    pub event_tags: Vec<String>,
    pub investment_summary: String,
    pub detailed_summary: String,
    pub analysis_report: String,
}

impl Layer2Outcome {
    /// Fail-open default: keep with empty metadata.
    fn default_keep() -> Self {
        Self {
            decision: FilterStatus::Keep,
            entities: Vec::new(),
            sentiment: Sentiment::Neutral,
            industry_tags: Vec::new(),
            event_tags: Vec::new(),
            investment_summary: String::new(),
            detailed_summary: String::new(),
            analysis_report: String::new(),
        }
    }
}

/// Validate raw entity JSON: known types only, scores clamped into [0,1],
/// empty names dropped, capped at `max`.
pub fn validate_entities(raw: &serde_json::Value, max: usize) -> Vec<RelatedEntity> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let entity = item["entity"].as_str()?.trim().to_string();
            if entity.is_empty() {
                return None;
            }
            let entity_type = EntityType::parse(item["type"].as_str()?)?;
            let score = item["score"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0);
            Some(RelatedEntity {
                entity,
                entity_type,
                score,
            })
        })
        .take(max)
        .collect()
}

fn string_list(raw: &serde_json::Value, max: usize) -> Vec<String> {
    raw.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .take(max)
                .collect()
        })
        .unwrap_or_default()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn parse_outcome(parsed: &serde_json::Value, max_entities: usize, deep: bool) -> Layer2Outcome {
    let decision = match parsed["decision"].as_str() {
        Some("delete") => FilterStatus::Delete,
        _ => FilterStatus::Keep,
    };
    let sentiment = parsed["sentiment"]
        .as_str()
        .and_then(Sentiment::parse)
        .unwrap_or(Sentiment::Neutral);

    Layer2Outcome {
        decision,
        entities: validate_entities(&parsed["entities"], max_entities),
        sentiment,
        industry_tags: string_list(&parsed["industry_tags"], MAX_TAGS),
        event_tags: string_list(&parsed["event_tags"], MAX_TAGS),
        investment_summary: truncate_chars(
            parsed["investment_summary"].as_str().unwrap_or(""),
            MAX_SUMMARY_CHARS,
        ),
        detailed_summary: if deep {
            parsed["detailed_summary"].as_str().unwrap_or("").to_string()
        } else {
            String::new()
        },
        analysis_report: if deep {
            parsed["analysis_report"].as_str().unwrap_or("").to_string()
        } else {
            String::new()
        },
    }
}

async fn run_filter(
    gateway: &LlmGateway,
    settings: &SystemSettings,
    model: &str,
    prompt: String,
    call_purpose: &str,
    timeout: Duration,
    max_tokens: u32,
    max_entities: usize,
    deep: bool,
    url: &str,
) -> AppResult<Layer2Outcome> {
    let mut request = ChatRequest::new(model.to_string(), vec![Message::user(prompt)]);
    request.temperature = Some(0.2);
    request.max_tokens = Some(max_tokens);
    request.json_response = true;
    request.timeout = timeout;

    let opts = CallOptions::for_purpose(call_purpose)
        .with_system(ProviderCredentials::from_settings(settings))
        .with_metadata(json!({"url": url.chars().take(80).collect::<String>()}));

    let response = gateway.chat(&request, &opts).await?;
    let content = response.content.unwrap_or_default();

    let Some(parsed) = extract_json(&content) else {
        warn!(url, purpose = call_purpose, chars = content.len(), "JSON parse failed, defaulting to keep");
        return Ok(Layer2Outcome::default_keep());
    };

    let outcome = parse_outcome(&parsed, max_entities, deep);
    info!(
        url,
        purpose = call_purpose,
        decision = outcome.decision.as_str(),
        entities = outcome.entities.len(),
        sentiment = outcome.sentiment.as_str(),
        "layer2 decision"
    );
    Ok(outcome)
}

/// Deep filter for the full-analysis path.
pub async fn deep_filter(
    gateway: &LlmGateway,
    settings: &SystemSettings,
    title: &str,
    full_text: &str,
    source: &str,
    url: &str,
) -> AppResult<Layer2Outcome> {
    let prompt = DEEP_PROMPT
        .replace("{source}", source)
        .replace("{title}", title)
        .replace("{text}", &truncate_chars(full_text, DEEP_TEXT_CHARS));
    run_filter(
        gateway,
        settings,
        &settings.deep_filter_model,
        prompt,
        purpose::DEEP_FILTER,
        DEEP_TIMEOUT,
        4000,
        MAX_ENTITIES_DEEP,
        true,
        url,
    )
    .await
}

/// Lightweight extraction for below-threshold articles.
pub async fn lightweight_filter(
    gateway: &LlmGateway,
    settings: &SystemSettings,
    title: &str,
    text: &str,
    url: &str,
) -> AppResult<Layer2Outcome> {
    let prompt = LIGHTWEIGHT_PROMPT
        .replace("{title}", title)
        .replace("{text}", &truncate_chars(text, LIGHT_TEXT_CHARS));
    run_filter(
        gateway,
        settings,
        &settings.lightweight_model,
        prompt,
        purpose::LIGHTWEIGHT_FILTER,
        LIGHTWEIGHT_TIMEOUT,
        500,
        MAX_ENTITIES_LIGHT,
        false,
        url,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_entities_caps_and_clamps() {
        let raw = json!([
            {"entity": "AAPL", "type": "stock", "score": 1.7},
            {"entity": "SPX", "type": "index", "score": -0.2},
            {"entity": "", "type": "stock", "score": 0.5},
            {"entity": "rates", "type": "macro"},
            {"entity": "X", "type": "crypto", "score": 0.5},
            {"entity": "B", "type": "stock", "score": 0.4},
            {"entity": "C", "type": "stock", "score": 0.3}
        ]);
        let entities = validate_entities(&raw, 4);
        assert_eq!(entities.len(), 4);
        assert_eq!(entities[0].score, 1.0);
        assert_eq!(entities[1].score, 0.0);
        // Missing score defaults to 0.5; unknown type dropped entirely
        assert_eq!(entities[2].entity, "rates");
        assert_eq!(entities[2].score, 0.5);
        assert_eq!(entities[3].entity, "B");
    }

    #[test]
    fn test_parse_outcome_lightweight_has_no_report() {
        let parsed = json!({
            "decision": "keep",
            "entities": [{"entity": "ACME", "type": "stock", "score": 0.6}],
            "sentiment": "neutral",
            "industry_tags": ["industrials"],
            "event_tags": ["meeting"],
            "investment_summary": "Annual meeting moved.",
            "detailed_summary": "should be ignored",
            "analysis_report": "should be ignored"
        });
        let outcome = parse_outcome(&parsed, MAX_ENTITIES_LIGHT, false);
        assert_eq!(outcome.decision, FilterStatus::Keep);
        assert!(outcome.detailed_summary.is_empty());
        assert!(outcome.analysis_report.is_empty());
        assert_eq!(outcome.entities[0].entity, "ACME");
    }

    #[test]
    fn test_parse_outcome_delete_decision() {
        let parsed = json!({"decision": "delete"});
        let outcome = parse_outcome(&parsed, MAX_ENTITIES_DEEP, true);
        assert_eq!(outcome.decision, FilterStatus::Delete);
    }

    #[test]
    fn test_unknown_decision_defaults_to_keep() {
        let parsed = json!({"decision": "maybe", "sentiment": "confused"});
        let outcome = parse_outcome(&parsed, MAX_ENTITIES_DEEP, true);
        assert_eq!(outcome.decision, FilterStatus::Keep);
        assert_eq!(outcome.sentiment, Sentiment::Neutral);
    }

    #[test]
    fn test_investment_summary_truncated() {
        let parsed = json!({
            "decision": "keep",
            "investment_summary": "x".repeat(1000)
        });
        let outcome = parse_outcome(&parsed, MAX_ENTITIES_DEEP, true);
        assert_eq!(outcome.investment_summary.chars().count(), MAX_SUMMARY_CHARS);
    }
}
