use serde::{Deserialize, Serialize};

/// Dimension of every embedding vector accepted by the Store and Vector Index.
pub const EMBEDDING_DIM: usize = 768;

/// Default chunk size, in UTF-8 code points, before paragraph packing kicks in.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Whitespace-separated tokens of overlap carried into the next packed chunk.
pub const DEFAULT_OVERLAP: usize = 50;

/// MMR trade-off between raw relevance and diversity.
pub const MMR_LAMBDA: f32 = 0.7;

/// Penalty applied to a candidate whose source file is already represented
/// in the selected MMR set.
pub const SOURCE_REPEAT_PENALTY: f32 = 0.15;

/// Maximum number of entries held in the query-result cache.
pub const CACHE_MAX_ENTRIES: usize = 128;

/// Time-to-live, in seconds, of a cached query result.
pub const CACHE_TTL_SECS: u64 = 300;

/// Upper bound, in seconds, on a single embedding HTTP call.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// How many candidates the Vector Index over-fetches relative to `top_k`,
/// to leave MMR a pool to diversify from.
pub const OVER_FETCH_FACTOR: usize = 2;

/// Internal pipeline size for `embed_batch`.
pub const EMBED_BATCH_SIZE: usize = 32;

/// Relative path substrings that exclude a file from indexing regardless of
/// extension. A policy hook, not a hardcoded law: override via
/// `MEMVAULT_DENY_SUBSTRINGS` (comma-separated) if needed.
pub const DEFAULT_DENY_SUBSTRINGS: &[&str] = &[
    "digests",
    "drafts",
    "homepage-backup",
    "content/toolkit-threads",
    "content/toolkit-articles",
];

/// File extensions considered indexable when the CLI caller does not pass
/// `--ext` explicitly.
pub const DEFAULT_EXTENSIONS: &[&str] = &["md", "mdx", "txt", "rst"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: String,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub chunk_size: usize,
    pub overlap: usize,
    pub mmr_lambda: f32,
    pub source_repeat_penalty: f32,
    pub cache_max_entries: usize,
    pub cache_ttl_secs: u64,
    pub embed_timeout_secs: u64,
    pub over_fetch_factor: usize,
    pub deny_substrings: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("MEMVAULT_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("memvault").to_string_lossy().to_string())
                .unwrap_or_else(|| ".memvault-data".to_string())
        });

        let deny_substrings = std::env::var("MEMVAULT_DENY_SUBSTRINGS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| {
                DEFAULT_DENY_SUBSTRINGS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        Self {
            data_dir,
            embedding_base_url: std::env::var("MEMVAULT_EMBED_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            embedding_model: std::env::var("MEMVAULT_EMBED_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            embedding_dim: std::env::var("MEMVAULT_EMBED_DIM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(EMBEDDING_DIM),
            chunk_size: std::env::var("MEMVAULT_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            overlap: std::env::var("MEMVAULT_OVERLAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_OVERLAP),
            mmr_lambda: std::env::var("MEMVAULT_MMR_LAMBDA")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(MMR_LAMBDA),
            source_repeat_penalty: std::env::var("MEMVAULT_SOURCE_REPEAT_PENALTY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(SOURCE_REPEAT_PENALTY),
            cache_max_entries: std::env::var("MEMVAULT_CACHE_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(CACHE_MAX_ENTRIES),
            cache_ttl_secs: std::env::var("MEMVAULT_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(CACHE_TTL_SECS),
            embed_timeout_secs: std::env::var("MEMVAULT_EMBED_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(EMBED_TIMEOUT_SECS),
            over_fetch_factor: std::env::var("MEMVAULT_OVER_FETCH_FACTOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(OVER_FETCH_FACTOR),
            deny_substrings,
        }
    }

    pub fn store_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.data_dir).join("memvault.db")
    }

    pub fn vector_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.data_dir).join("vector_index.bin")
    }

    pub fn vector_metadata_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.data_dir).join("vector_index_metadata.json")
    }
}
