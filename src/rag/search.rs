//! Hybrid retrieval over the embedding store.
//!
//! Two backends feed one ranking: cosine similarity over stored vectors
//! and keyword match through the FTS index. The lists fuse via Reciprocal
//! Rank Fusion (`score += weight / (k + rank + 1)`, k = 60), then a
//! freshness decay re-weights: 80% relevance, 20% freshness with a 60-day
//! half-life.

use crate::error::AppResult;
use crate::storage::db::{Database, EmbeddingRow};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::info;

pub const RRF_K: usize = 60;
const RELEVANCE_WEIGHT: f64 = 0.8;
const HALF_LIFE_DAYS: f64 = 60.0;
/// Candidate pool for the in-process cosine pass.
const VECTOR_CANDIDATE_LIMIT: u32 = 2000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub chunk_text: String,
    pub source_type: String,
    pub source_id: String,
    pub symbol: Option<String>,
    pub score: f64,
    pub chunk_index: i64,
    pub created_at: DateTime<Utc>,
    pub model: String,
}

impl SearchResult {
    /// Stable dedup key: source identity plus chunk position.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.source_type, self.source_id, self.chunk_index)
    }

    fn from_row(row: EmbeddingRow, score: f64) -> Self {
        Self {
            chunk_text: row.chunk_text,
            source_type: row.source_type,
            source_id: row.source_id,
            symbol: row.symbol,
            score,
            chunk_index: row.chunk_index,
            created_at: row.created_at,
            model: row.model,
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Fuse ranked lists. Each list carries its weight; an item appearing in
/// several lists accumulates `weight / (k + rank + 1)` from each.
pub fn rrf_fuse(lists: &[(f64, Vec<SearchResult>)], top_k: usize) -> Vec<SearchResult> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut result_map: HashMap<String, SearchResult> = HashMap::new();

    for (weight, results) in lists {
        for (rank, result) in results.iter().enumerate() {
            let key = result.dedup_key();
            *scores.entry(key.clone()).or_insert(0.0) += weight / (RRF_K + rank + 1) as f64;
            result_map.entry(key).or_insert_with(|| result.clone());
        }
    }

    let mut keys: Vec<String> = scores.keys().cloned().collect();
    keys.sort_by(|a, b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    keys.into_iter()
        .take(top_k)
        .map(|key| {
            let mut result = result_map.remove(&key).expect("key came from the map");
            result.score = scores[&key];
            result
        })
        .collect()
}

/// Re-weight by age: `score *= relevance + (1 - relevance) * freshness`,
/// `freshness = 1 / (1 + age_days / half_life)`. Re-sorts and truncates.
pub fn apply_freshness_decay(mut results: Vec<SearchResult>, top_k: usize) -> Vec<SearchResult> {
    let now = Utc::now();
    for result in &mut results {
        let age_days = (now - result.created_at).num_seconds().max(0) as f64 / 86400.0;
        let freshness = 1.0 / (1.0 + age_days / HALF_LIFE_DAYS);
        result.score *= RELEVANCE_WEIGHT + (1.0 - RELEVANCE_WEIGHT) * freshness;
    }
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(top_k);
    results
}

pub struct HybridSearch {
    db: Database,
}

impl HybridSearch {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Vector-only ranking, used when no query text is available.
    pub fn vector_search(
        &self,
        query_embedding: &[f32],
        symbol: Option<&str>,
        source_type: Option<&str>,
        top_k: usize,
    ) -> AppResult<Vec<SearchResult>> {
        let candidates =
            self.db
                .vector_candidates(symbol, source_type, VECTOR_CANDIDATE_LIMIT)?;
        let mut scored: Vec<SearchResult> = candidates
            .into_iter()
            .map(|row| {
                let score = cosine_similarity(query_embedding, &row.embedding);
                SearchResult::from_row(row, score)
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    pub fn keyword_search(
        &self,
        query_text: &str,
        symbol: Option<&str>,
        source_type: Option<&str>,
        top_k: usize,
    ) -> AppResult<Vec<SearchResult>> {
        let rows = self
            .db
            .keyword_search(query_text, symbol, source_type, top_k as u32)?;
        // FTS rank ordering is already best-first; keep rank as score
        // basis (RRF only uses positions).
        let total = rows.len();
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| SearchResult::from_row(row, (total - i) as f64))
            .collect())
    }

    /// Hybrid search: both backends fetch 2x candidates, RRF fuses with
    /// the configured vector weight, freshness decay finishes the ranking.
    pub fn search(
        &self,
        query_text: &str,
        query_embedding: &[f32],
        symbol: Option<&str>,
        source_type: Option<&str>,
        top_k: usize,
        vector_weight: f64,
    ) -> AppResult<Vec<SearchResult>> {
        let vector_results =
            self.vector_search(query_embedding, symbol, source_type, top_k * 2)?;
        let keyword_results = self.keyword_search(query_text, symbol, source_type, top_k * 2)?;

        info!(
            vector = vector_results.len(),
            keyword = keyword_results.len(),
            "hybrid search candidates"
        );

        let fused = rrf_fuse(
            &[
                (vector_weight, vector_results),
                (1.0 - vector_weight, keyword_results),
            ],
            top_k * 2,
        );
        Ok(apply_freshness_decay(fused, top_k))
    }
}
