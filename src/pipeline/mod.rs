//! The news enrichment pipeline.
//!
//! Stage order per article: Layer 1 scoring -> routing -> content fetch ->
//! Layer 1.5 cleaning -> Layer 2 classification -> embedding. Every stage
//! commits its transition before the next begins, so a crashed worker
//! resumes from the last committed state.

pub mod layer1;
pub mod layer15;
pub mod layer2;
pub mod orchestrator;
pub mod queue;
pub mod sweeper;

pub use orchestrator::NewsPipeline;
pub use queue::{spawn_workers, PipelineQueue};
pub use sweeper::spawn_retention_sweeper;

/// Purpose tags used for cost attribution.
pub mod purpose {
    pub const LAYER1_SCORING: &str = "layer1_scoring";
    pub const CONTENT_CLEANING: &str = "content_cleaning";
    pub const DEEP_FILTER: &str = "deep_filter";
    pub const LIGHTWEIGHT_FILTER: &str = "lightweight_filter";
    pub const EMBEDDING: &str = "embedding";
}

/// Pull a JSON object out of an LLM response, tolerating markdown fences
/// and leading prose.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();

    // Fenced block first
    let unfenced = if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        match after.find("```") {
            Some(end) => after[..end].trim(),
            None => after.trim(),
        }
    } else {
        trimmed
    };

    if let Ok(value) = serde_json::from_str(unfenced) {
        return Some(value);
    }

    // Last resort: first '{' to last '}'
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&unfenced[start..=end]).ok()
}
