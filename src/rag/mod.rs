pub mod chunking;
pub mod indexer;
pub mod search;

pub use chunking::chunk_text;
pub use indexer::{advisory_key, EmbeddingIndexer, StoreOutcome};
pub use search::{HybridSearch, SearchResult};
