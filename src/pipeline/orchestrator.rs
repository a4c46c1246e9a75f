//! Per-article pipeline state machine.
//!
//! Stages execute strictly in order and each commits its transition
//! before the next begins. Replaying a task is safe at any point: every
//! stage checks the persisted state and skips work that already
//! committed, so a crashed worker resumes where it stopped.

use crate::error::{AppError, AppResult};
use crate::fetch::{extract_image_urls, fetch_images_base64, ContentFetcher, ImageData, StrategyKind};
use crate::llm::LlmGateway;
use crate::models::{
    ArticleRef, ContentStatus, FilterStatus, NewsArticle, ProcessingPath, SystemSettings,
};
use crate::pipeline::layer1::{self, Layer1Route};
use crate::pipeline::layer15;
use crate::pipeline::layer2;
use crate::rag::indexer::EmbeddingIndexer;
use crate::storage::blob::{BlobStore, ContentBlob};
use crate::storage::db::{Database, Layer2Update};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct NewsPipeline {
    db: Database,
    blob: Arc<BlobStore>,
    gateway: Arc<LlmGateway>,
    fetcher: Arc<ContentFetcher>,
    indexer: Arc<EmbeddingIndexer>,
    image_client: reqwest::Client,
}

impl NewsPipeline {
    pub fn new(
        db: Database,
        blob: Arc<BlobStore>,
        gateway: Arc<LlmGateway>,
        fetcher: Arc<ContentFetcher>,
        indexer: Arc<EmbeddingIndexer>,
    ) -> AppResult<Self> {
        let image_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| AppError::Provider(format!("failed to build image client: {}", e)))?;
        Ok(Self {
            db,
            blob,
            gateway,
            fetcher,
            indexer,
            image_client,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Drive one article through every remaining stage. Idempotent per
    /// task: replaying after any commit resumes from that commit.
    pub async fn process(&self, task: &ArticleRef) -> AppResult<()> {
        let settings = self.db.get_settings()?;
        if !settings.enable_llm_pipeline {
            info!(url = %task.url, "llm pipeline disabled, skipping");
            return Ok(());
        }

        let article = self.db.insert_or_get_article(task)?;
        let id = article.id;

        // Already terminal?
        if article.filter_status == FilterStatus::Delete {
            return Ok(());
        }
        if article.filter_status == FilterStatus::Keep
            && article.content_status == ContentStatus::Embedded
        {
            return Ok(());
        }

        // ---- Layer 1: scoring + routing ------------------------------
        let article = if article.content_score.is_none() {
            match self.run_layer1(&article, &settings).await? {
                Some(updated) => updated,
                None => return Ok(()), // discarded
            }
        } else {
            article
        };

        if article.filter_status == FilterStatus::Delete {
            return Ok(());
        }

        // ---- Content fetch -------------------------------------------
        let (full_text, raw_html) = self.run_fetch(&article).await?;

        // Layer 2 already committed? Jump straight to embedding.
        if article.filter_status == FilterStatus::Keep {
            return self.run_embedding(&article, &settings, &full_text).await;
        }

        // ---- Layer 1.5: cleaning + visual extraction ------------------
        let images = self.collect_images(&article, raw_html.as_deref()).await;
        let cleaning = layer15::clean_and_extract(
            &self.gateway,
            &settings,
            &full_text,
            &images,
            &article.url,
        )
        .await;
        self.db
            .set_cleaning_result(id, &cleaning.image_insights, cleaning.has_visual_data)?;
        self.db.append_event(
            id,
            "content_cleaning",
            "ok",
            Some(&json!({
                "cleaned_chars": cleaning.cleaned_text.chars().count(),
                "images": images.len(),
                "has_visual_data": cleaning.has_visual_data,
            })),
        )?;

        // ---- Layer 2: classification ---------------------------------
        let path = article
            .processing_path
            .unwrap_or(ProcessingPath::Lightweight);
        let outcome = match path {
            ProcessingPath::FullAnalysis => {
                layer2::deep_filter(
                    &self.gateway,
                    &settings,
                    &article.title,
                    &cleaning.cleaned_text,
                    &article.source,
                    &article.url,
                )
                .await
            }
            ProcessingPath::Lightweight => {
                layer2::lightweight_filter(
                    &self.gateway,
                    &settings,
                    &article.title,
                    &cleaning.cleaned_text,
                    &article.url,
                )
                .await
            }
        };

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                self.db.set_filter_failed(id, &e.to_string())?;
                self.db.append_event(
                    id,
                    "layer2_filter",
                    "failed",
                    Some(&json!({"error": e.to_string(), "kind": e.kind()})),
                )?;
                return Err(e);
            }
        };

        self.db.set_layer2_result(
            id,
            &Layer2Update {
                filter_status: outcome.decision,
                sentiment_tag: outcome.sentiment,
                industry_tags: outcome.industry_tags.clone(),
                event_tags: outcome.event_tags.clone(),
                investment_summary: outcome.investment_summary.clone(),
                detailed_summary: outcome.detailed_summary.clone(),
                analysis_report: outcome.analysis_report.clone(),
                related_entities: outcome.entities.clone(),
            },
        )?;
        self.db.append_event(
            id,
            "layer2_filter",
            "ok",
            Some(&json!({
                "path": path.as_str(),
                "decision": outcome.decision.as_str(),
                "entities": outcome.entities.len(),
            })),
        )?;

        if outcome.decision == FilterStatus::Delete {
            info!(news_id = %id, "layer2 deleted article");
            return Ok(());
        }

        // ---- Embedding ------------------------------------------------
        let article = self
            .db
            .get_article(id)?
            .ok_or_else(|| AppError::Invariant(format!("article {} vanished mid-pipeline", id)))?;
        self.run_embedding(&article, &settings, &cleaning.cleaned_text)
            .await
    }

    /// Run scoring and commit the routing decision. Returns `None` when
    /// the article was discarded.
    async fn run_layer1(
        &self,
        article: &NewsArticle,
        settings: &SystemSettings,
    ) -> AppResult<Option<NewsArticle>> {
        let outcome = match layer1::score_article(
            &self.gateway,
            settings,
            &article.title,
            article.summary.as_deref(),
            &article.url,
        )
        .await
        {
            Ok(o) => o,
            Err(e) => {
                self.db.set_filter_failed(article.id, &e.to_string())?;
                self.db.append_event(
                    article.id,
                    "layer1_scoring",
                    "failed",
                    Some(&json!({"error": e.to_string(), "kind": e.kind()})),
                )?;
                return Err(e);
            }
        };

        let route = outcome.route(settings);
        let (status, path) = match route {
            Layer1Route::Discard => (FilterStatus::Delete, None),
            Layer1Route::FullAnalysis => {
                (FilterStatus::Useful, Some(ProcessingPath::FullAnalysis))
            }
            Layer1Route::Lightweight => (FilterStatus::Useful, Some(ProcessingPath::Lightweight)),
        };

        self.db.set_layer1_result(
            article.id,
            outcome.total_score,
            &outcome.score_details,
            status,
            path,
        )?;
        self.db.append_event(
            article.id,
            "layer1_scoring",
            "ok",
            Some(&json!({
                "score": outcome.total_score,
                "is_critical": outcome.is_critical,
                "route": match route {
                    Layer1Route::Discard => "discard",
                    Layer1Route::FullAnalysis => "full_analysis",
                    Layer1Route::Lightweight => "lightweight",
                },
            })),
        )?;

        if route == Layer1Route::Discard {
            info!(news_id = %article.id, score = outcome.total_score, "discarded at layer1");
            return Ok(None);
        }

        let updated = self
            .db
            .get_article(article.id)?
            .ok_or_else(|| AppError::Invariant(format!("article {} vanished", article.id)))?;
        Ok(Some(updated))
    }

    /// Fetch (or re-read) the article body. Returns the full text and,
    /// for fresh fetches, the raw HTML for image candidate extraction.
    async fn run_fetch(&self, article: &NewsArticle) -> AppResult<(String, Option<String>)> {
        if article.content_status.has_content_file() {
            if let Some(path) = &article.content_file_path {
                if let Some(blob) = self.blob.read(path)? {
                    return Ok((blob.full_text, None));
                }
                warn!(news_id = %article.id, path, "content file missing, refetching");
            }
        }

        let fetched = match self.fetcher.fetch(&article.url, StrategyKind::HtmlParse).await {
            Ok(f) => f,
            Err(e) => {
                self.db
                    .set_content_result(article.id, ContentStatus::Failed, None, Some(&e.to_string()))?;
                self.db.append_event(
                    article.id,
                    "content_fetch",
                    "failed",
                    Some(&json!({"error": e.to_string(), "kind": e.kind()})),
                )?;
                return Err(e);
            }
        };

        let symbol = article.symbol.clone().unwrap_or_else(|| "GLOBAL".to_string());
        let mut blob = ContentBlob::new(&article.url, &article.title, fetched.full_text.clone());
        blob.authors = fetched.authors.clone();
        blob.keywords = fetched.keywords.clone();
        blob.top_image = fetched.top_image.clone();
        blob.language = fetched.language.clone();
        blob.metadata.insert("source_tag".into(), json!(fetched.source_tag));
        blob.metadata.insert("is_partial".into(), json!(fetched.is_partial));

        let path = self
            .blob
            .save(article.id, &symbol, blob, Some(article.published_at))?;

        let status = if fetched.is_partial {
            ContentStatus::Partial
        } else {
            ContentStatus::Fetched
        };
        self.db
            .set_content_result(article.id, status, Some(&path), None)?;
        self.db.append_event(
            article.id,
            "content_fetch",
            "ok",
            Some(&json!({
                "source_tag": fetched.source_tag,
                "word_count": fetched.word_count,
                "is_partial": fetched.is_partial,
                "path": path,
            })),
        )?;

        Ok((fetched.full_text, fetched.raw_html))
    }

    /// Extract candidate chart/table images from the raw page and inline
    /// them for the multimodal call. Best-effort.
    async fn collect_images(&self, article: &NewsArticle, raw_html: Option<&str>) -> Vec<ImageData> {
        let Some(html) = raw_html else {
            return Vec::new();
        };
        let urls = extract_image_urls(html, &article.url, crate::fetch::images::MAX_IMAGES);
        if urls.is_empty() {
            return Vec::new();
        }
        fetch_images_base64(
            &self.image_client,
            &urls,
            crate::fetch::images::MAX_INLINE_IMAGES,
        )
        .await
    }

    /// Chunk, embed, and mark the article embedded.
    async fn run_embedding(
        &self,
        article: &NewsArticle,
        settings: &SystemSettings,
        content: &str,
    ) -> AppResult<()> {
        if article.content_status == ContentStatus::Embedded {
            return Ok(());
        }

        let outcome = match self
            .indexer
            .store(
                "news",
                &article.id.to_string(),
                content,
                article.symbol.as_deref(),
                settings,
            )
            .await
        {
            Ok(o) => o,
            Err(e) => {
                self.db.append_event(
                    article.id,
                    "embedding",
                    "failed",
                    Some(&json!({"error": e.to_string(), "kind": e.kind()})),
                )?;
                return Err(e);
            }
        };

        if outcome.chunks_stored > 0 {
            self.db.set_content_status(article.id, ContentStatus::Embedded)?;
        }
        self.db.append_event(
            article.id,
            "embedding",
            "ok",
            Some(&json!({
                "chunks": outcome.chunks_stored,
                "model": outcome.model,
            })),
        )?;

        info!(news_id = %article.id, chunks = outcome.chunks_stored, "article pipeline complete");
        Ok(())
    }
}
