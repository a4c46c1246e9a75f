use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported markets for news and quote routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    Us,
    Hk,
    Sh,
    Sz,
    Metal,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Us => "US",
            Market::Hk => "HK",
            Market::Sh => "SH",
            Market::Sz => "SZ",
            Market::Metal => "METAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "US" => Some(Market::Us),
            "HK" => Some(Market::Hk),
            "SH" => Some(Market::Sh),
            "SZ" => Some(Market::Sz),
            "METAL" => Some(Market::Metal),
            _ => None,
        }
    }
}

/// Infer the market from a symbol's shape.
///
/// 6-digit codes are A-shares (6xxxxx -> SH, otherwise SZ), `.HK` suffixes
/// are Hong Kong listings, known futures symbols map to METAL, everything
/// else defaults to US.
pub fn detect_market(symbol: &str) -> Market {
    let upper = symbol.to_ascii_uppercase();
    if upper.ends_with(".HK") {
        return Market::Hk;
    }
    if upper.ends_with("=F") || matches!(upper.as_str(), "GC" | "SI" | "HG" | "PL" | "PA") {
        return Market::Metal;
    }
    if upper.len() == 6 && upper.chars().all(|c| c.is_ascii_digit()) {
        if upper.starts_with('6') {
            return Market::Sh;
        }
        return Market::Sz;
    }
    Market::Us
}

/// Content lifecycle for the blob attached to an article
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Pending,
    Fetched,
    Embedded,
    Partial,
    Failed,
    Blocked,
    Deleted,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Pending => "pending",
            ContentStatus::Fetched => "fetched",
            ContentStatus::Embedded => "embedded",
            ContentStatus::Partial => "partial",
            ContentStatus::Failed => "failed",
            ContentStatus::Blocked => "blocked",
            ContentStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fetched" => Some(Self::Fetched),
            "embedded" => Some(Self::Embedded),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// True once a blob exists on disk for this article.
    pub fn has_content_file(&self) -> bool {
        matches!(self, Self::Fetched | Self::Partial | Self::Embedded)
    }
}

/// Classification lifecycle driven by the LLM pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStatus {
    Pending,
    Useful,
    Uncertain,
    Keep,
    Delete,
    Failed,
}

impl FilterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStatus::Pending => "pending",
            FilterStatus::Useful => "useful",
            FilterStatus::Uncertain => "uncertain",
            FilterStatus::Keep => "keep",
            FilterStatus::Delete => "delete",
            FilterStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "useful" => Some(Self::Useful),
            "uncertain" => Some(Self::Uncertain),
            "keep" => Some(Self::Keep),
            "delete" => Some(Self::Delete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states are never overwritten by a replayed task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Keep | Self::Delete)
    }
}

/// Which Layer 2 variant an article was routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPath {
    FullAnalysis,
    Lightweight,
}

impl ProcessingPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingPath::FullAnalysis => "full_analysis",
            ProcessingPath::Lightweight => "lightweight",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full_analysis" => Some(Self::FullAnalysis),
            "lightweight" => Some(Self::Lightweight),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Bullish => "bullish",
            Sentiment::Bearish => "bearish",
            Sentiment::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bullish" => Some(Self::Bullish),
            "bearish" => Some(Self::Bearish),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Stock,
    Index,
    Macro,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Stock => "stock",
            EntityType::Index => "index",
            EntityType::Macro => "macro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock" => Some(Self::Stock),
            "index" => Some(Self::Index),
            "macro" => Some(Self::Macro),
            _ => None,
        }
    }
}

/// An entity the classifier linked to an article, with a relevance score in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub entity: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub score: f64,
}

/// Denormalised entity fields kept on the news row for cheap RAG filtering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityRollup {
    pub has_stock_entities: bool,
    pub has_macro_entities: bool,
    pub max_entity_score: Option<f64>,
    pub primary_entity: Option<String>,
    pub primary_entity_type: Option<EntityType>,
}

impl EntityRollup {
    /// Derive the rollup from a validated entity list. The primary entity
    /// is the highest-scoring one; ties keep the earlier entry.
    pub fn from_entities(entities: &[RelatedEntity]) -> Self {
        let mut rollup = EntityRollup::default();
        for e in entities {
            match e.entity_type {
                EntityType::Stock => rollup.has_stock_entities = true,
                EntityType::Macro => rollup.has_macro_entities = true,
                EntityType::Index => {}
            }
        }
        if let Some(top) = entities.iter().max_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) {
            rollup.max_entity_score = Some(top.score);
            rollup.primary_entity = Some(top.entity.clone());
            rollup.primary_entity_type = Some(top.entity_type);
        }
        rollup
    }
}

/// A news article row. URL is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsArticle {
    pub id: Uuid,
    pub url: String,
    pub symbol: Option<String>,
    pub market: Market,
    pub source: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,

    pub content_file_path: Option<String>,
    pub content_status: ContentStatus,
    pub content_error: Option<String>,

    pub filter_status: FilterStatus,
    pub content_score: Option<i32>,
    pub processing_path: Option<ProcessingPath>,
    pub sentiment_tag: Option<Sentiment>,
    pub industry_tags: Vec<String>,
    pub event_tags: Vec<String>,
    pub investment_summary: Option<String>,
    pub detailed_summary: Option<String>,
    pub analysis_report: Option<String>,
    pub related_entities: Vec<RelatedEntity>,

    pub has_stock_entities: bool,
    pub has_macro_entities: bool,
    pub max_entity_score: Option<f64>,
    pub primary_entity: Option<String>,
    pub primary_entity_type: Option<EntityType>,

    pub image_insights: Option<String>,
    pub has_visual_data: bool,
    pub score_details: Option<serde_json::Value>,
}

/// Reference enqueued by the external scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRef {
    pub url: String,
    pub symbol: Option<String>,
    pub market: Market,
    pub title: String,
    pub summary: Option<String>,
    pub source: String,
    pub published_at: DateTime<Utc>,
}

/// Live admin-configured settings, read on every pipeline invocation.
///
/// Thresholds are on the 0-300 Layer 1 scale. Rows written by the legacy
/// 0-100 configuration are rescaled at load time (see storage::db).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub enable_llm_pipeline: bool,
    pub layer1_discard_threshold: i32,
    pub layer1_full_analysis_threshold: i32,
    pub layer1_scoring_model: String,
    pub cleaning_model: String,
    pub deep_filter_model: String,
    pub lightweight_model: String,
    pub embedding_model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub news_retention_days: i64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            enable_llm_pipeline: true,
            layer1_discard_threshold: 105,
            layer1_full_analysis_threshold: 195,
            layer1_scoring_model: "gpt-4o-mini".to_string(),
            cleaning_model: "gpt-4o-mini".to_string(),
            deep_filter_model: "gpt-4o".to_string(),
            lightweight_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            openai_api_key: None,
            openai_base_url: None,
            anthropic_api_key: None,
            anthropic_base_url: None,
            news_retention_days: 30,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub content_dir: String,
    pub port: u16,
    pub pipeline_workers: usize,
    pub browser_service_url: Option<String>,
    pub extract_api_key: Option<String>,
    pub akshare_service_url: Option<String>,
    pub tiingo_api_key: Option<String>,
    pub tushare_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./newswire.db".to_string());

        let content_dir = std::env::var("NEWS_CONTENT_DIR")
            .unwrap_or_else(|_| "./data/news_content".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let pipeline_workers = std::env::var("PIPELINE_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(4);

        Ok(Self {
            database_path,
            content_dir,
            port,
            pipeline_workers,
            browser_service_url: std::env::var("BROWSER_SERVICE_URL").ok(),
            extract_api_key: std::env::var("EXTRACT_API_KEY").ok(),
            akshare_service_url: std::env::var("AKSHARE_SERVICE_URL").ok(),
            tiingo_api_key: std::env::var("TIINGO_API_KEY").ok(),
            tushare_token: std::env::var("TUSHARE_TOKEN").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_base_url: std::env::var("OPENAI_BASE_URL").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            anthropic_base_url: std::env::var("ANTHROPIC_BASE_URL").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_market() {
        assert_eq!(detect_market("AAPL"), Market::Us);
        assert_eq!(detect_market("0700.HK"), Market::Hk);
        assert_eq!(detect_market("600519"), Market::Sh);
        assert_eq!(detect_market("000001"), Market::Sz);
        assert_eq!(detect_market("GC=F"), Market::Metal);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            ContentStatus::Pending,
            ContentStatus::Fetched,
            ContentStatus::Embedded,
            ContentStatus::Partial,
            ContentStatus::Failed,
            ContentStatus::Blocked,
            ContentStatus::Deleted,
        ] {
            assert_eq!(ContentStatus::parse(s.as_str()), Some(s));
        }
        assert!(ContentStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_entity_rollup_picks_highest_score() {
        let entities = vec![
            RelatedEntity {
                entity: "SPX".into(),
                entity_type: EntityType::Index,
                score: 0.4,
            },
            RelatedEntity {
                entity: "AAPL".into(),
                entity_type: EntityType::Stock,
                score: 0.9,
            },
            RelatedEntity {
                entity: "rates".into(),
                entity_type: EntityType::Macro,
                score: 0.3,
            },
        ];
        let rollup = EntityRollup::from_entities(&entities);
        assert!(rollup.has_stock_entities);
        assert!(rollup.has_macro_entities);
        assert_eq!(rollup.primary_entity.as_deref(), Some("AAPL"));
        assert_eq!(rollup.primary_entity_type, Some(EntityType::Stock));
        assert_eq!(rollup.max_entity_score, Some(0.9));
    }

    #[test]
    fn test_entity_rollup_empty() {
        let rollup = EntityRollup::from_entities(&[]);
        assert!(!rollup.has_stock_entities);
        assert!(rollup.primary_entity.is_none());
        assert!(rollup.max_entity_score.is_none());
    }

    #[test]
    fn test_content_file_path_states() {
        assert!(ContentStatus::Fetched.has_content_file());
        assert!(ContentStatus::Partial.has_content_file());
        assert!(ContentStatus::Embedded.has_content_file());
        assert!(!ContentStatus::Pending.has_content_file());
        assert!(!ContentStatus::Failed.has_content_file());
    }
}
