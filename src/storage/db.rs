//! SQLite-backed relational store.
//!
//! Holds the news rows, live system settings, LLM pricing and usage
//! records, document embeddings (vector blobs + FTS5 keyword index), and
//! the pipeline event log.
//!
//! Key decisions:
//! - WAL mode for concurrent reads during pipeline writes
//! - schema_version table with in-code migrations
//! - embeddings stored as little-endian f32 BLOBs; keyword search goes
//!   through an FTS5 shadow table kept in sync by triggers
//! - advisory locks are an in-process async registry keyed by the same
//!   i64 hash the embedding indexer derives from (source_type, source_id)

use crate::error::{AppError, AppResult};
use crate::models::{
    ArticleRef, ContentStatus, EntityRollup, EntityType, FilterStatus, Market, NewsArticle,
    ProcessingPath, RelatedEntity, Sentiment, SystemSettings,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Schema version for migrations.
/// Version history:
/// - v1: news, settings, pricing, usage records, embeddings, events
/// - v2: multimodal columns (image_insights, has_visual_data) on news
const SCHEMA_VERSION: u32 = 2;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS news (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL UNIQUE,
    symbol TEXT,
    market TEXT NOT NULL,
    source TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT,
    published_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    content_file_path TEXT,
    content_status TEXT NOT NULL DEFAULT 'pending',
    content_error TEXT,
    filter_status TEXT NOT NULL DEFAULT 'pending',
    content_score INTEGER,
    processing_path TEXT,
    sentiment_tag TEXT,
    industry_tags TEXT,
    event_tags TEXT,
    investment_summary TEXT,
    detailed_summary TEXT,
    analysis_report TEXT,
    related_entities TEXT,
    has_stock_entities INTEGER NOT NULL DEFAULT 0,
    has_macro_entities INTEGER NOT NULL DEFAULT 0,
    max_entity_score REAL,
    primary_entity TEXT,
    primary_entity_type TEXT,
    score_details TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_news_symbol_published
    ON news(symbol, published_at DESC);
CREATE INDEX IF NOT EXISTS idx_news_filter_status ON news(filter_status);
CREATE INDEX IF NOT EXISTS idx_news_published ON news(published_at DESC);

CREATE TABLE IF NOT EXISTS system_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    enable_llm_pipeline INTEGER NOT NULL DEFAULT 1,
    layer1_discard_threshold INTEGER NOT NULL DEFAULT 105,
    layer1_full_analysis_threshold INTEGER NOT NULL DEFAULT 195,
    layer1_scoring_model TEXT NOT NULL DEFAULT 'gpt-4o-mini',
    cleaning_model TEXT NOT NULL DEFAULT 'gpt-4o-mini',
    deep_filter_model TEXT NOT NULL DEFAULT 'gpt-4o',
    lightweight_model TEXT NOT NULL DEFAULT 'gpt-4o-mini',
    embedding_model TEXT NOT NULL DEFAULT 'text-embedding-3-small',
    openai_api_key TEXT,
    openai_base_url TEXT,
    anthropic_api_key TEXT,
    anthropic_base_url TEXT,
    news_retention_days INTEGER NOT NULL DEFAULT 30
);

CREATE TABLE IF NOT EXISTS model_pricing (
    id TEXT PRIMARY KEY,
    model TEXT NOT NULL,
    input_price REAL NOT NULL DEFAULT 0,
    cached_input_price REAL,
    output_price REAL NOT NULL DEFAULT 0,
    effective_from TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(model, effective_from)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS llm_usage_records (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    model TEXT NOT NULL,
    purpose TEXT NOT NULL,
    user_id TEXT,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    cached_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    metadata TEXT,
    pricing_id TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_usage_created ON llm_usage_records(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_usage_purpose ON llm_usage_records(purpose, created_at DESC);

CREATE TABLE IF NOT EXISTS document_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    symbol TEXT,
    chunk_index INTEGER NOT NULL,
    chunk_text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    model TEXT NOT NULL,
    token_count INTEGER,
    created_at INTEGER NOT NULL,
    UNIQUE(source_type, source_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_source
    ON document_embeddings(source_type, source_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_symbol ON document_embeddings(symbol);

CREATE VIRTUAL TABLE IF NOT EXISTS document_embeddings_fts USING fts5(
    chunk_text,
    content='document_embeddings',
    content_rowid='id',
    tokenize='unicode61 remove_diacritics 2'
);

CREATE TRIGGER IF NOT EXISTS document_embeddings_ai
AFTER INSERT ON document_embeddings BEGIN
    INSERT INTO document_embeddings_fts(rowid, chunk_text)
    VALUES (new.id, new.chunk_text);
END;

CREATE TRIGGER IF NOT EXISTS document_embeddings_ad
AFTER DELETE ON document_embeddings BEGIN
    INSERT INTO document_embeddings_fts(document_embeddings_fts, rowid, chunk_text)
    VALUES ('delete', old.id, old.chunk_text);
END;

CREATE TABLE IF NOT EXISTS pipeline_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    news_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_news ON pipeline_events(news_id, id);
"#;

/// Number of dimensions every stored embedding must have.
pub const EMBEDDING_DIMENSIONS: usize = 1536;

/// Encode an embedding vector as a little-endian f32 blob.
pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode a little-endian f32 blob back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[derive(Debug, Clone)]
pub struct PricingRow {
    pub id: Uuid,
    pub model: String,
    pub input_price: f64,
    pub cached_input_price: Option<f64>,
    pub output_price: f64,
    pub effective_from: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct UsageRecordInsert {
    pub model: String,
    pub purpose: String,
    pub user_id: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cached_tokens: i64,
    pub cost_usd: f64,
    pub metadata: Option<serde_json::Value>,
    pub pricing_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct UsageRecordRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub purpose: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub pricing_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingInsert {
    pub chunk_index: i64,
    pub chunk_text: String,
    pub embedding: Vec<f32>,
    pub token_count: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub id: i64,
    pub source_type: String,
    pub source_id: String,
    pub symbol: Option<String>,
    pub chunk_index: i64,
    pub chunk_text: String,
    pub embedding: Vec<f32>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Fields written together by a Layer 2 decision.
#[derive(Debug, Clone)]
pub struct Layer2Update {
    pub filter_status: FilterStatus,
    pub sentiment_tag: Sentiment,
    pub industry_tags: Vec<String>,
    pub event_tags: Vec<String>,
    pub investment_summary: String,
    pub detailed_summary: String,
    pub analysis_report: String,
    pub related_entities: Vec<RelatedEntity>,
}

#[derive(Debug, Clone)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_calls: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DailyCost {
    pub day: String,
    pub cost_usd: f64,
    pub calls: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PurposeCost {
    pub purpose: String,
    pub cost_usd: f64,
    pub calls: i64,
    pub tokens: i64,
}

/// Process-wide store. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    advisory_locks: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            advisory_locks: Arc::new(Mutex::new(HashMap::new())),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> AppResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -32000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current_version {
            None => {
                conn.execute_batch(SCHEMA_SQL)?;
                Self::create_multimodal_columns(&conn)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [SCHEMA_VERSION],
                )?;
                info!("created database schema v{}", SCHEMA_VERSION);
            }
            Some(1) => {
                Self::create_multimodal_columns(&conn)?;
                conn.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION])?;
                info!("migrated database schema from v1 to v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("database schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "database schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }

        // Default settings row
        conn.execute(
            "INSERT OR IGNORE INTO system_settings (id) VALUES (1)",
            [],
        )?;

        Ok(())
    }

    fn create_multimodal_columns(conn: &Connection) -> rusqlite::Result<()> {
        let has_column: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('news') WHERE name = 'image_insights'",
            [],
            |row| row.get(0),
        )?;
        if has_column == 0 {
            conn.execute_batch(
                "ALTER TABLE news ADD COLUMN image_insights TEXT;
                 ALTER TABLE news ADD COLUMN has_visual_data INTEGER NOT NULL DEFAULT 0;",
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Advisory locks
    // ------------------------------------------------------------------

    /// Take the advisory lock for `key`, waiting until it is free. The
    /// guard releases on drop. Lock holders must re-check persisted state
    /// after acquisition.
    pub async fn advisory_lock(&self, key: i64) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.advisory_locks.lock();
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    // ------------------------------------------------------------------
    // News rows
    // ------------------------------------------------------------------

    /// Insert a pending article for the reference, or return the existing
    /// row when the URL is already known (idempotent scheduler replay).
    pub fn insert_or_get_article(&self, article: &ArticleRef) -> AppResult<NewsArticle> {
        {
            let conn = self.conn.lock();
            let id = Uuid::new_v4();
            conn.execute(
                "INSERT OR IGNORE INTO news
                   (id, url, symbol, market, source, title, summary, published_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    article.url,
                    article.symbol,
                    article.market.as_str(),
                    article.source,
                    article.title,
                    article.summary,
                    article.published_at.timestamp(),
                    Utc::now().timestamp(),
                ],
            )?;
        }
        self.get_article_by_url(&article.url)?
            .ok_or_else(|| AppError::Invariant(format!("article row vanished: {}", article.url)))
    }

    pub fn get_article(&self, id: Uuid) -> AppResult<Option<NewsArticle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM news WHERE id = ?1",
            ARTICLE_COLUMNS
        ))?;
        let row = stmt
            .query_row(params![id.to_string()], row_to_article)
            .optional()?;
        Ok(row)
    }

    pub fn get_article_by_url(&self, url: &str) -> AppResult<Option<NewsArticle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM news WHERE url = ?1",
            ARTICLE_COLUMNS
        ))?;
        let row = stmt.query_row(params![url], row_to_article).optional()?;
        Ok(row)
    }

    /// Paginated listing, newest first, optionally scoped to a symbol.
    /// Deleted articles are excluded.
    pub fn list_news(
        &self,
        symbol: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> AppResult<(Vec<NewsArticle>, i64)> {
        let conn = self.conn.lock();
        let offset = (page.saturating_sub(1) as i64) * page_size as i64;

        let (total, rows) = match symbol {
            Some(sym) => {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM news WHERE symbol = ?1 AND filter_status != 'delete'",
                    params![sym],
                    |r| r.get(0),
                )?;
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM news
                     WHERE symbol = ?1 AND filter_status != 'delete'
                     ORDER BY published_at DESC LIMIT ?2 OFFSET ?3",
                    ARTICLE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![sym, page_size as i64, offset], row_to_article)?
                    .collect::<Result<Vec<_>, _>>()?;
                (total, rows)
            }
            None => {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM news WHERE filter_status != 'delete'",
                    [],
                    |r| r.get(0),
                )?;
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM news
                     WHERE filter_status != 'delete'
                     ORDER BY published_at DESC LIMIT ?1 OFFSET ?2",
                    ARTICLE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![page_size as i64, offset], row_to_article)?
                    .collect::<Result<Vec<_>, _>>()?;
                (total, rows)
            }
        };

        Ok((rows, total))
    }

    /// Persist the Layer 1 outcome in one committed write.
    pub fn set_layer1_result(
        &self,
        id: Uuid,
        score: i32,
        score_details: &serde_json::Value,
        filter_status: FilterStatus,
        processing_path: Option<ProcessingPath>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE news SET content_score = ?2, score_details = ?3,
                 filter_status = ?4, processing_path = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                score,
                score_details.to_string(),
                filter_status.as_str(),
                processing_path.map(|p| p.as_str()),
            ],
        )?;
        Ok(())
    }

    pub fn set_content_result(
        &self,
        id: Uuid,
        status: ContentStatus,
        file_path: Option<&str>,
        error: Option<&str>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE news SET content_status = ?2, content_file_path = ?3, content_error = ?4
             WHERE id = ?1",
            params![id.to_string(), status.as_str(), file_path, error],
        )?;
        Ok(())
    }

    pub fn set_cleaning_result(
        &self,
        id: Uuid,
        image_insights: &str,
        has_visual_data: bool,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE news SET image_insights = ?2, has_visual_data = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                if image_insights.is_empty() { None } else { Some(image_insights) },
                has_visual_data as i64,
            ],
        )?;
        Ok(())
    }

    /// Persist a Layer 2 decision plus the derived entity rollup.
    pub fn set_layer2_result(&self, id: Uuid, update: &Layer2Update) -> AppResult<()> {
        let rollup = EntityRollup::from_entities(&update.related_entities);
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE news SET
                filter_status = ?2,
                sentiment_tag = ?3,
                industry_tags = ?4,
                event_tags = ?5,
                investment_summary = ?6,
                detailed_summary = ?7,
                analysis_report = ?8,
                related_entities = ?9,
                has_stock_entities = ?10,
                has_macro_entities = ?11,
                max_entity_score = ?12,
                primary_entity = ?13,
                primary_entity_type = ?14
             WHERE id = ?1",
            params![
                id.to_string(),
                update.filter_status.as_str(),
                update.sentiment_tag.as_str(),
                serde_json::to_string(&update.industry_tags)?,
                serde_json::to_string(&update.event_tags)?,
                update.investment_summary,
                update.detailed_summary,
                update.analysis_report,
                serde_json::to_string(&update.related_entities)?,
                rollup.has_stock_entities as i64,
                rollup.has_macro_entities as i64,
                rollup.max_entity_score,
                rollup.primary_entity,
                rollup.primary_entity_type.map(|t| t.as_str()),
            ],
        )?;
        Ok(())
    }

    pub fn set_content_status(&self, id: Uuid, status: ContentStatus) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE news SET content_status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_filter_failed(&self, id: Uuid, error: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE news SET filter_status = 'failed', content_error = ?2 WHERE id = ?1",
            params![id.to_string(), error],
        )?;
        Ok(())
    }

    /// Delete rows published before the cutoff. Returns (id, blob path)
    /// pairs so the sweeper can cascade into blob storage. Embedding rows
    /// for the deleted articles are removed in the same transaction.
    pub fn delete_articles_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<(Uuid, Option<String>)>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let victims: Vec<(String, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, content_file_path FROM news WHERE published_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff.timestamp()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (id, _) in &victims {
            tx.execute(
                "DELETE FROM document_embeddings WHERE source_type = 'news' AND source_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM pipeline_events WHERE news_id = ?1", params![id])?;
            tx.execute("DELETE FROM news WHERE id = ?1", params![id])?;
        }
        tx.commit()?;

        Ok(victims
            .into_iter()
            .filter_map(|(id, path)| Uuid::parse_str(&id).ok().map(|u| (u, path)))
            .collect())
    }

    // ------------------------------------------------------------------
    // System settings
    // ------------------------------------------------------------------

    pub fn get_settings(&self) -> AppResult<SystemSettings> {
        let conn = self.conn.lock();
        let mut settings = conn.query_row(
            "SELECT enable_llm_pipeline, layer1_discard_threshold,
                    layer1_full_analysis_threshold, layer1_scoring_model,
                    cleaning_model, deep_filter_model, lightweight_model,
                    embedding_model, openai_api_key, openai_base_url,
                    anthropic_api_key, anthropic_base_url, news_retention_days
             FROM system_settings WHERE id = 1",
            [],
            |row| {
                Ok(SystemSettings {
                    enable_llm_pipeline: row.get::<_, i64>(0)? != 0,
                    layer1_discard_threshold: row.get(1)?,
                    layer1_full_analysis_threshold: row.get(2)?,
                    layer1_scoring_model: row.get(3)?,
                    cleaning_model: row.get(4)?,
                    deep_filter_model: row.get(5)?,
                    lightweight_model: row.get(6)?,
                    embedding_model: row.get(7)?,
                    openai_api_key: row.get(8)?,
                    openai_base_url: row.get(9)?,
                    anthropic_api_key: row.get(10)?,
                    anthropic_base_url: row.get(11)?,
                    news_retention_days: row.get(12)?,
                })
            },
        )?;

        // Rows written by the legacy 0-100 configuration are rescaled to
        // the 0-300 Layer 1 range.
        if settings.layer1_full_analysis_threshold <= 100 {
            settings.layer1_discard_threshold *= 3;
            settings.layer1_full_analysis_threshold *= 3;
        }

        Ok(settings)
    }

    pub fn update_settings(&self, settings: &SystemSettings) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE system_settings SET
                enable_llm_pipeline = ?1,
                layer1_discard_threshold = ?2,
                layer1_full_analysis_threshold = ?3,
                layer1_scoring_model = ?4,
                cleaning_model = ?5,
                deep_filter_model = ?6,
                lightweight_model = ?7,
                embedding_model = ?8,
                openai_api_key = ?9,
                openai_base_url = ?10,
                anthropic_api_key = ?11,
                anthropic_base_url = ?12,
                news_retention_days = ?13
             WHERE id = 1",
            params![
                settings.enable_llm_pipeline as i64,
                settings.layer1_discard_threshold,
                settings.layer1_full_analysis_threshold,
                settings.layer1_scoring_model,
                settings.cleaning_model,
                settings.deep_filter_model,
                settings.lightweight_model,
                settings.embedding_model,
                settings.openai_api_key,
                settings.openai_base_url,
                settings.anthropic_api_key,
                settings.anthropic_base_url,
                settings.news_retention_days,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Model pricing & usage records
    // ------------------------------------------------------------------

    pub fn insert_pricing(
        &self,
        model: &str,
        input_price: f64,
        cached_input_price: Option<f64>,
        output_price: f64,
        effective_from: NaiveDate,
    ) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO model_pricing
                (id, model, input_price, cached_input_price, output_price, effective_from, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                model,
                input_price,
                cached_input_price,
                output_price,
                effective_from.format("%Y-%m-%d").to_string(),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(id)
    }

    /// The pricing row in force for `model` on `date`:
    /// `argmax(effective_from <= date)`.
    pub fn active_pricing(&self, model: &str, date: NaiveDate) -> AppResult<Option<PricingRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, model, input_price, cached_input_price, output_price, effective_from
                 FROM model_pricing
                 WHERE model = ?1 AND effective_from <= ?2
                 ORDER BY effective_from DESC LIMIT 1",
                params![model, date.format("%Y-%m-%d").to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(|(id, model, input, cached, output, from)| {
            let id = Uuid::parse_str(&id).ok()?;
            let effective_from = NaiveDate::parse_from_str(&from, "%Y-%m-%d").ok()?;
            Some(PricingRow {
                id,
                model,
                input_price: input,
                cached_input_price: cached,
                output_price: output,
                effective_from,
            })
        }))
    }

    pub fn record_usage(&self, record: &UsageRecordInsert) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO llm_usage_records
                (id, created_at, model, purpose, user_id, prompt_tokens,
                 completion_tokens, cached_tokens, total_tokens, cost_usd, metadata, pricing_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id.to_string(),
                Utc::now().timestamp(),
                record.model,
                record.purpose,
                record.user_id,
                record.prompt_tokens,
                record.completion_tokens,
                record.cached_tokens,
                record.prompt_tokens + record.completion_tokens,
                record.cost_usd,
                record.metadata.as_ref().map(|m| m.to_string()),
                record.pricing_id.map(|p| p.to_string()),
            ],
        )?;
        Ok(id)
    }

    pub fn usage_records(
        &self,
        purpose: Option<&str>,
        limit: u32,
    ) -> AppResult<Vec<UsageRecordRow>> {
        let conn = self.conn.lock();
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<UsageRecordRow> {
            Ok(UsageRecordRow {
                id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
                created_at: Utc
                    .timestamp_opt(row.get::<_, i64>(1)?, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                model: row.get(2)?,
                purpose: row.get(3)?,
                prompt_tokens: row.get(4)?,
                completion_tokens: row.get(5)?,
                cached_tokens: row.get(6)?,
                total_tokens: row.get(7)?,
                cost_usd: row.get(8)?,
                pricing_id: row
                    .get::<_, Option<String>>(9)?
                    .and_then(|s| Uuid::parse_str(&s).ok()),
            })
        };

        let rows = match purpose {
            Some(p) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, created_at, model, purpose, prompt_tokens, completion_tokens,
                            cached_tokens, total_tokens, cost_usd, pricing_id
                     FROM llm_usage_records WHERE purpose = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![p, limit], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, created_at, model, purpose, prompt_tokens, completion_tokens,
                            cached_tokens, total_tokens, cost_usd, pricing_id
                     FROM llm_usage_records
                     ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    fn cost_filter_clause(purpose: Option<&str>, model: Option<&str>) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(p) = purpose {
            clauses.push(format!("purpose = ?{}", args.len() + 1));
            args.push(p.to_string());
        }
        if let Some(m) = model {
            clauses.push(format!("model = ?{}", args.len() + 1));
            args.push(m.to_string());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (where_clause, args)
    }

    /// Aggregate over insert-time costs. No live repricing.
    pub fn costs_summary(
        &self,
        purpose: Option<&str>,
        model: Option<&str>,
    ) -> AppResult<CostSummary> {
        let (where_clause, args) = Self::cost_filter_clause(purpose, model);
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT COALESCE(SUM(cost_usd), 0), COUNT(*), COALESCE(SUM(total_tokens), 0)
             FROM llm_usage_records {}",
            where_clause
        );
        let summary = conn.query_row(
            &sql,
            rusqlite::params_from_iter(args.iter()),
            |row| {
                Ok(CostSummary {
                    total_cost_usd: row.get(0)?,
                    total_calls: row.get(1)?,
                    total_tokens: row.get(2)?,
                })
            },
        )?;
        Ok(summary)
    }

    pub fn costs_daily(
        &self,
        purpose: Option<&str>,
        model: Option<&str>,
        days: u32,
    ) -> AppResult<Vec<DailyCost>> {
        let (where_clause, args) = Self::cost_filter_clause(purpose, model);
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT date(created_at, 'unixepoch') AS day,
                    SUM(cost_usd), COUNT(*), SUM(total_tokens)
             FROM llm_usage_records {}
             GROUP BY day ORDER BY day DESC LIMIT {}",
            where_clause, days
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok(DailyCost {
                    day: row.get(0)?,
                    cost_usd: row.get(1)?,
                    calls: row.get(2)?,
                    tokens: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn costs_by_purpose(&self, model: Option<&str>) -> AppResult<Vec<PurposeCost>> {
        let (where_clause, args) = Self::cost_filter_clause(None, model);
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT purpose, SUM(cost_usd), COUNT(*), SUM(total_tokens)
             FROM llm_usage_records {}
             GROUP BY purpose ORDER BY SUM(cost_usd) DESC",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok(PurposeCost {
                    purpose: row.get(0)?,
                    cost_usd: row.get(1)?,
                    calls: row.get(2)?,
                    tokens: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Document embeddings
    // ------------------------------------------------------------------

    /// Atomically replace all chunks for a source. Callers hold the
    /// advisory lock for `(source_type, source_id)` around this.
    pub fn replace_embeddings(
        &self,
        source_type: &str,
        source_id: &str,
        symbol: Option<&str>,
        model: &str,
        chunks: &[EmbeddingInsert],
    ) -> AppResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM document_embeddings WHERE source_type = ?1 AND source_id = ?2",
            params![source_type, source_id],
        )?;
        let now = Utc::now().timestamp();
        for chunk in chunks {
            if chunk.embedding.len() != EMBEDDING_DIMENSIONS {
                return Err(AppError::Invariant(format!(
                    "embedding has {} dimensions, expected {}",
                    chunk.embedding.len(),
                    EMBEDDING_DIMENSIONS
                )));
            }
            tx.execute(
                "INSERT INTO document_embeddings
                    (source_type, source_id, symbol, chunk_index, chunk_text,
                     embedding, model, token_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    source_type,
                    source_id,
                    symbol,
                    chunk.chunk_index,
                    chunk.chunk_text,
                    vec_to_blob(&chunk.embedding),
                    model,
                    chunk.token_count,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    pub fn embeddings_for_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> AppResult<Vec<EmbeddingRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, source_type, source_id, symbol, chunk_index, chunk_text,
                    embedding, model, created_at
             FROM document_embeddings
             WHERE source_type = ?1 AND source_id = ?2
             ORDER BY chunk_index",
        )?;
        let rows = stmt
            .query_map(params![source_type, source_id], row_to_embedding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Candidate rows for in-process cosine ranking, newest first.
    pub fn vector_candidates(
        &self,
        symbol: Option<&str>,
        source_type: Option<&str>,
        limit: u32,
    ) -> AppResult<Vec<EmbeddingRow>> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(sym) = symbol {
            clauses.push(format!("symbol = ?{}", args.len() + 1));
            args.push(sym.to_string());
        }
        if let Some(st) = source_type {
            clauses.push(format!("source_type = ?{}", args.len() + 1));
            args.push(st.to_string());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, source_type, source_id, symbol, chunk_index, chunk_text,
                    embedding, model, created_at
             FROM document_embeddings {}
             ORDER BY created_at DESC LIMIT {}",
            where_clause, limit
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_embedding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Keyword search over chunk text through the FTS5 shadow table,
    /// best match first.
    pub fn keyword_search(
        &self,
        query: &str,
        symbol: Option<&str>,
        source_type: Option<&str>,
        limit: u32,
    ) -> AppResult<Vec<EmbeddingRow>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let mut clauses = vec!["f.chunk_text MATCH ?1".to_string()];
        let mut args: Vec<String> = vec![fts_query];
        if let Some(sym) = symbol {
            clauses.push(format!("d.symbol = ?{}", args.len() + 1));
            args.push(sym.to_string());
        }
        if let Some(st) = source_type {
            clauses.push(format!("d.source_type = ?{}", args.len() + 1));
            args.push(st.to_string());
        }

        let conn = self.conn.lock();
        let sql = format!(
            "SELECT d.id, d.source_type, d.source_id, d.symbol, d.chunk_index,
                    d.chunk_text, d.embedding, d.model, d.created_at
             FROM document_embeddings_fts f
             JOIN document_embeddings d ON d.id = f.rowid
             WHERE {}
             ORDER BY f.rank LIMIT {}",
            clauses.join(" AND "),
            limit
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_embedding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Pipeline events
    // ------------------------------------------------------------------

    pub fn append_event(
        &self,
        news_id: Uuid,
        stage: &str,
        outcome: &str,
        detail: Option<&serde_json::Value>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pipeline_events (news_id, stage, outcome, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                news_id.to_string(),
                stage,
                outcome,
                detail.map(|d| d.to_string()),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn events_for(&self, news_id: Uuid) -> AppResult<Vec<(String, String, Option<String>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT stage, outcome, detail FROM pipeline_events WHERE news_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![news_id.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Build an FTS5 query: each whitespace token quoted, OR-joined.
fn build_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

const ARTICLE_COLUMNS: &str = "id, url, symbol, market, source, title, summary, published_at, \
     created_at, content_file_path, content_status, content_error, filter_status, content_score, \
     processing_path, sentiment_tag, industry_tags, event_tags, investment_summary, \
     detailed_summary, analysis_report, related_entities, has_stock_entities, has_macro_entities, \
     max_entity_score, primary_entity, primary_entity_type, image_insights, has_visual_data, \
     score_details";

fn parse_json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn row_to_article(row: &rusqlite::Row<'_>) -> rusqlite::Result<NewsArticle> {
    let id: String = row.get(0)?;
    let market: String = row.get(3)?;
    let content_status: String = row.get(10)?;
    let filter_status: String = row.get(12)?;
    let related_entities: Option<String> = row.get(21)?;
    Ok(NewsArticle {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        url: row.get(1)?,
        symbol: row.get(2)?,
        market: Market::parse(&market).unwrap_or(Market::Us),
        source: row.get(4)?,
        title: row.get(5)?,
        summary: row.get(6)?,
        published_at: Utc
            .timestamp_opt(row.get::<_, i64>(7)?, 0)
            .single()
            .unwrap_or_else(Utc::now),
        created_at: Utc
            .timestamp_opt(row.get::<_, i64>(8)?, 0)
            .single()
            .unwrap_or_else(Utc::now),
        content_file_path: row.get(9)?,
        content_status: ContentStatus::parse(&content_status).unwrap_or(ContentStatus::Pending),
        content_error: row.get(11)?,
        filter_status: FilterStatus::parse(&filter_status).unwrap_or(FilterStatus::Pending),
        content_score: row.get(13)?,
        processing_path: row
            .get::<_, Option<String>>(14)?
            .and_then(|s| ProcessingPath::parse(&s)),
        sentiment_tag: row
            .get::<_, Option<String>>(15)?
            .and_then(|s| Sentiment::parse(&s)),
        industry_tags: parse_json_list(row.get(16)?),
        event_tags: parse_json_list(row.get(17)?),
        investment_summary: row.get(18)?,
        detailed_summary: row.get(19)?,
        analysis_report: row.get(20)?,
        related_entities: related_entities
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        has_stock_entities: row.get::<_, i64>(22)? != 0,
        has_macro_entities: row.get::<_, i64>(23)? != 0,
        max_entity_score: row.get(24)?,
        primary_entity: row.get(25)?,
        primary_entity_type: row
            .get::<_, Option<String>>(26)?
            .and_then(|s| EntityType::parse(&s)),
        image_insights: row.get(27)?,
        has_visual_data: row.get::<_, i64>(28)? != 0,
        score_details: row
            .get::<_, Option<String>>(29)?
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn row_to_embedding(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingRow> {
    let blob: Vec<u8> = row.get(6)?;
    Ok(EmbeddingRow {
        id: row.get(0)?,
        source_type: row.get(1)?,
        source_id: row.get(2)?,
        symbol: row.get(3)?,
        chunk_index: row.get(4)?,
        chunk_text: row.get(5)?,
        embedding: blob_to_vec(&blob),
        model: row.get(7)?,
        created_at: Utc
            .timestamp_opt(row.get::<_, i64>(8)?, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ref(url: &str) -> ArticleRef {
        ArticleRef {
            url: url.to_string(),
            symbol: Some("AAPL".to_string()),
            market: Market::Us,
            title: "Q3 earnings beat".to_string(),
            summary: Some("Revenue up 18%".to_string()),
            source: "reuters".to_string(),
            published_at: Utc::now(),
        }
    }

    fn unit_embedding(seed: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIMENSIONS];
        v[0] = seed;
        v[1] = 1.0 - seed;
        v
    }

    #[test]
    fn test_insert_or_get_is_idempotent_by_url() {
        let db = Database::in_memory().unwrap();
        let first = db.insert_or_get_article(&sample_ref("http://ex/a")).unwrap();
        let second = db.insert_or_get_article(&sample_ref("http://ex/a")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.filter_status, FilterStatus::Pending);
        assert_eq!(first.content_status, ContentStatus::Pending);
    }

    #[test]
    fn test_layer1_result_round_trip() {
        let db = Database::in_memory().unwrap();
        let article = db.insert_or_get_article(&sample_ref("http://ex/a")).unwrap();
        let details = serde_json::json!({"dimensionScores": {"relevance": 80}});
        db.set_layer1_result(
            article.id,
            230,
            &details,
            FilterStatus::Useful,
            Some(ProcessingPath::FullAnalysis),
        )
        .unwrap();

        let reloaded = db.get_article(article.id).unwrap().unwrap();
        assert_eq!(reloaded.content_score, Some(230));
        assert_eq!(reloaded.processing_path, Some(ProcessingPath::FullAnalysis));
        assert_eq!(reloaded.score_details, Some(details));
    }

    #[test]
    fn test_layer2_result_derives_rollup() {
        let db = Database::in_memory().unwrap();
        let article = db.insert_or_get_article(&sample_ref("http://ex/a")).unwrap();
        db.set_layer2_result(
            article.id,
            &Layer2Update {
                filter_status: FilterStatus::Keep,
                sentiment_tag: Sentiment::Bullish,
                industry_tags: vec!["tech".into()],
                event_tags: vec!["earnings".into()],
                investment_summary: "Strong quarter".into(),
                detailed_summary: String::new(),
                analysis_report: String::new(),
                related_entities: vec![
                    RelatedEntity {
                        entity: "AAPL".into(),
                        entity_type: EntityType::Stock,
                        score: 0.9,
                    },
                    RelatedEntity {
                        entity: "rates".into(),
                        entity_type: EntityType::Macro,
                        score: 0.2,
                    },
                ],
            },
        )
        .unwrap();

        let reloaded = db.get_article(article.id).unwrap().unwrap();
        assert_eq!(reloaded.filter_status, FilterStatus::Keep);
        assert!(reloaded.has_stock_entities);
        assert!(reloaded.has_macro_entities);
        assert_eq!(reloaded.primary_entity.as_deref(), Some("AAPL"));
        assert_eq!(reloaded.primary_entity_type, Some(EntityType::Stock));
        assert_eq!(reloaded.max_entity_score, Some(0.9));
        assert_eq!(reloaded.sentiment_tag, Some(Sentiment::Bullish));
    }

    #[test]
    fn test_settings_defaults_and_legacy_rescale() {
        let db = Database::in_memory().unwrap();
        let settings = db.get_settings().unwrap();
        assert!(settings.enable_llm_pipeline);
        assert_eq!(settings.layer1_discard_threshold, 105);
        assert_eq!(settings.layer1_full_analysis_threshold, 195);
        assert_eq!(settings.news_retention_days, 30);

        // Simulate a legacy row on the 0-100 scale
        let mut legacy = settings.clone();
        legacy.layer1_discard_threshold = 35;
        legacy.layer1_full_analysis_threshold = 65;
        db.update_settings(&legacy).unwrap();
        let rescaled = db.get_settings().unwrap();
        assert_eq!(rescaled.layer1_discard_threshold, 105);
        assert_eq!(rescaled.layer1_full_analysis_threshold, 195);
    }

    #[test]
    fn test_active_pricing_picks_latest_effective_row() {
        let db = Database::in_memory().unwrap();
        let d1 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        db.insert_pricing("gpt-4o-mini", 0.15, Some(0.075), 0.60, d1).unwrap();
        let newer = db.insert_pricing("gpt-4o-mini", 0.10, None, 0.40, d2).unwrap();

        let on_feb = db
            .active_pricing("gpt-4o-mini", NaiveDate::from_ymd_opt(2026, 2, 1).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(on_feb.input_price, 0.15);

        let on_july = db
            .active_pricing("gpt-4o-mini", NaiveDate::from_ymd_opt(2026, 7, 1).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(on_july.id, newer);
        assert_eq!(on_july.cached_input_price, None);

        assert!(db
            .active_pricing("gpt-4o-mini", NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_replace_embeddings_is_delete_then_insert() {
        let db = Database::in_memory().unwrap();
        let one = vec![EmbeddingInsert {
            chunk_index: 0,
            chunk_text: "A".into(),
            embedding: unit_embedding(0.1),
            token_count: Some(1),
        }];
        db.replace_embeddings("news", "n1", Some("AAPL"), "text-embedding-3-small", &one)
            .unwrap();

        let three: Vec<EmbeddingInsert> = (0..3)
            .map(|i| EmbeddingInsert {
                chunk_index: i,
                chunk_text: format!("chunk {}", i),
                embedding: unit_embedding(0.2 + i as f32 * 0.1),
                token_count: Some(2),
            })
            .collect();
        db.replace_embeddings("news", "n1", Some("AAPL"), "text-embedding-3-small", &three)
            .unwrap();

        let rows = db.embeddings_for_source("news", "n1").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.model == "text-embedding-3-small"));
        assert!(rows.iter().all(|r| r.chunk_text.starts_with("chunk")));
    }

    #[test]
    fn test_replace_embeddings_rejects_wrong_dimensions() {
        let db = Database::in_memory().unwrap();
        let bad = vec![EmbeddingInsert {
            chunk_index: 0,
            chunk_text: "A".into(),
            embedding: vec![0.0; 10],
            token_count: None,
        }];
        let err = db
            .replace_embeddings("news", "n1", None, "m", &bad)
            .unwrap_err();
        assert_eq!(err.kind(), "invariant_violation");
    }

    #[test]
    fn test_keyword_search_matches_chunk_text() {
        let db = Database::in_memory().unwrap();
        let chunks = vec![
            EmbeddingInsert {
                chunk_index: 0,
                chunk_text: "Apple quarterly revenue rose 18 percent".into(),
                embedding: unit_embedding(0.3),
                token_count: None,
            },
            EmbeddingInsert {
                chunk_index: 1,
                chunk_text: "Unrelated crop harvest report".into(),
                embedding: unit_embedding(0.5),
                token_count: None,
            },
        ];
        db.replace_embeddings("news", "n1", Some("AAPL"), "m", &chunks)
            .unwrap();

        let hits = db.keyword_search("quarterly revenue", None, None, 10).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk_index, 0);

        let none = db.keyword_search("", None, None, 10).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_vector_blob_round_trip() {
        let v: Vec<f32> = vec![0.5, -1.25, 3.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn test_retention_delete_cascades() {
        let db = Database::in_memory().unwrap();
        let mut old_ref = sample_ref("http://ex/old");
        old_ref.published_at = Utc::now() - chrono::Duration::days(90);
        let old = db.insert_or_get_article(&old_ref).unwrap();
        db.set_content_result(old.id, ContentStatus::Fetched, Some("2026/01/01/AAPL/x.json"), None)
            .unwrap();
        db.replace_embeddings(
            "news",
            &old.id.to_string(),
            Some("AAPL"),
            "m",
            &[EmbeddingInsert {
                chunk_index: 0,
                chunk_text: "old text".into(),
                embedding: unit_embedding(0.4),
                token_count: None,
            }],
        )
        .unwrap();
        let fresh = db.insert_or_get_article(&sample_ref("http://ex/new")).unwrap();

        let removed = db
            .delete_articles_older_than(Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, old.id);
        assert_eq!(removed[0].1.as_deref(), Some("2026/01/01/AAPL/x.json"));

        assert!(db.get_article(old.id).unwrap().is_none());
        assert!(db.get_article(fresh.id).unwrap().is_some());
        assert!(db
            .embeddings_for_source("news", &old.id.to_string())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_pipeline_events_append_and_list() {
        let db = Database::in_memory().unwrap();
        let article = db.insert_or_get_article(&sample_ref("http://ex/a")).unwrap();
        db.append_event(article.id, "layer1_scoring", "ok", None).unwrap();
        db.append_event(
            article.id,
            "content_fetch",
            "failed",
            Some(&serde_json::json!({"error": "timeout"})),
        )
        .unwrap();
        let events = db.events_for(article.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "layer1_scoring");
        assert_eq!(events[1].1, "failed");
    }

    #[tokio::test]
    async fn test_advisory_lock_serialises_same_key() {
        let db = Database::in_memory().unwrap();
        let guard = db.advisory_lock(42).await;
        // A different key proceeds immediately.
        let _other = db.advisory_lock(43).await;
        // The same key must wait until the first guard drops.
        let db2 = db.clone();
        let waiter = tokio::spawn(async move {
            let _g = db2.advisory_lock(42).await;
            Utc::now()
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let released_at = Utc::now();
        drop(guard);
        let acquired_at = waiter.await.unwrap();
        assert!(acquired_at >= released_at);
    }
}
