//! Orchestrates query → embed → ANN → rehydrate → rerank → cache.

use crate::config::AppConfig;
use crate::embedding_client::EmbeddingClient;
use crate::error::AppResult;
use crate::store::Store;
use crate::vector_index::{cosine_similarity, VectorIndex};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub id: i64,
    pub content: String,
    pub source_path: String,
    pub chunk_index: i64,
    pub similarity: f32,
}

struct CacheEntry {
    results: Vec<SearchResult>,
    inserted_at: Instant,
}

/// Bounded query-result cache: TTL eviction on access, capacity eviction on
/// insert. A hash map plus an access-order `Vec` of keys is enough to model
/// the policy exactly; no external LRU crate needed for anything this small.
struct QueryCache {
    entries: HashMap<String, CacheEntry>,
    order: Vec<String>,
    capacity: usize,
    ttl_secs: u64,
}

impl QueryCache {
    fn new(capacity: usize, ttl_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            capacity,
            ttl_secs,
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<SearchResult>> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed().as_secs() >= self.ttl_secs,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| e.results.clone())
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push(key.to_string());
    }

    fn insert(&mut self, key: String, results: Vec<SearchResult>) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self.order.first().cloned() {
                self.entries.remove(&oldest);
                self.order.remove(0);
            }
        }
        self.entries.insert(
            key.clone(),
            CacheEntry {
                results,
                inserted_at: Instant::now(),
            },
        );
        self.touch(&key);
    }
}

pub struct Retriever<'a> {
    store: &'a Store,
    embedder: &'a EmbeddingClient,
    config: &'a AppConfig,
    cache: Mutex<QueryCache>,
}

impl<'a> Retriever<'a> {
    pub fn new(store: &'a Store, embedder: &'a EmbeddingClient, config: &'a AppConfig) -> Self {
        Self {
            store,
            embedder,
            config,
            cache: Mutex::new(QueryCache::new(config.cache_max_entries, config.cache_ttl_secs)),
        }
    }

    pub async fn search(&self, query: &str, top_k: usize) -> AppResult<Vec<SearchResult>> {
        let stats = self.store.get_stats()?;
        if stats.total_chunks == 0 {
            return Ok(Vec::new());
        }

        let cache_key = format!("{:x}", md5::compute(format!("{query}:{top_k}").as_bytes()));
        if let Some(cached) = self.cache.lock().get(&cache_key) {
            return Ok(cached);
        }

        let start = Instant::now();
        let query_embedding = self.embedder.embed(query).await?;

        let over_fetch = self.config.over_fetch_factor.max(1);
        let candidates = self.candidates(&query_embedding, top_k, over_fetch)?;
        let reweighted = apply_recency(candidates);
        let selected = mmr_select(
            reweighted,
            top_k,
            self.config.mmr_lambda,
            self.config.source_repeat_penalty,
        );

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let top_score = selected.first().map(|r| r.similarity);
        self.store.log_search(query, top_score, selected.len(), elapsed_ms);

        self.cache.lock().insert(cache_key, selected.clone());
        Ok(selected)
    }

    fn candidates(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        over_fetch: usize,
    ) -> AppResult<Vec<SearchResult>> {
        let vector_index = match VectorIndex::load(
            self.config.embedding_dim,
            self.config.vector_path(),
            self.config.vector_metadata_path(),
        ) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(error = %e, "vector index snapshot unreadable, falling back to brute-force scan");
                None
            }
        };

        match vector_index {
            Some(index) if index.exists() => {
                let matches = index.search(query_embedding, top_k, over_fetch)?;
                let ids: Vec<i64> = matches.iter().map(|m| m.id).collect();
                let contents = self.store.get_chunks_by_ids(&ids)?;

                Ok(matches
                    .into_iter()
                    .map(|m| match contents.get(&m.id) {
                        Some(c) => SearchResult {
                            id: m.id,
                            content: c.content.clone(),
                            source_path: m.source_path,
                            chunk_index: m.chunk_index,
                            similarity: m.score,
                        },
                        None => SearchResult {
                            id: m.id,
                            content: "[content unavailable]".to_string(),
                            source_path: m.source_path,
                            chunk_index: m.chunk_index,
                            similarity: m.score,
                        },
                    })
                    .collect())
            }
            _ => self.brute_force(query_embedding, top_k, over_fetch),
        }
    }

    fn brute_force(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        over_fetch: usize,
    ) -> AppResult<Vec<SearchResult>> {
        if query_embedding.len() != self.config.embedding_dim {
            return Err(crate::error::AppError::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: query_embedding.len(),
            });
        }
        let all = self.store.all_chunks()?;
        let mut scored: Vec<SearchResult> = all
            .into_iter()
            .filter(|(chunk, _)| {
                let ok = chunk.embedding.len() == self.config.embedding_dim;
                if !ok {
                    tracing::warn!(
                        id = chunk.id,
                        expected = self.config.embedding_dim,
                        actual = chunk.embedding.len(),
                        "skipping chunk with mismatched embedding dimension in brute-force scan"
                    );
                }
                ok
            })
            .map(|(chunk, content)| SearchResult {
                id: chunk.id,
                content,
                source_path: chunk.source_path,
                chunk_index: chunk.chunk_index,
                similarity: cosine_similarity(query_embedding, &chunk.embedding),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k * over_fetch);
        Ok(scored)
    }
}

fn apply_recency(mut candidates: Vec<SearchResult>) -> Vec<SearchResult> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    for candidate in &mut candidates {
        if let Ok(metadata) = std::fs::metadata(&candidate.source_path) {
            if let Ok(modified) = metadata.modified() {
                if let Ok(mtime) = modified.duration_since(UNIX_EPOCH) {
                    let age_days = (now - mtime.as_secs_f64()) / 86_400.0;
                    candidate.similarity += recency_bonus(age_days);
                }
            }
        }
    }
    candidates
}

fn recency_bonus(age_days: f64) -> f32 {
    if age_days < 1.0 {
        0.03
    } else if age_days < 7.0 {
        0.02
    } else if age_days < 30.0 {
        0.01
    } else {
        0.0
    }
}

/// Greedy MMR: repeatedly pick the candidate maximising
/// `lambda * score - (1 - lambda) * penalty`, where `penalty` applies if the
/// candidate's source is already represented in the selection.
fn mmr_select(
    mut candidates: Vec<SearchResult>,
    top_k: usize,
    lambda: f32,
    source_repeat_penalty: f32,
) -> Vec<SearchResult> {
    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected: Vec<SearchResult> = Vec::new();
    let mut seen_sources: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut remaining = candidates;

    while selected.len() < top_k && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_value = f32::MIN;
        for (i, candidate) in remaining.iter().enumerate() {
            let penalty = if seen_sources.contains(&candidate.source_path) {
                source_repeat_penalty
            } else {
                0.0
            };
            let value = lambda * candidate.similarity - (1.0 - lambda) * penalty;
            if value > best_value {
                best_value = value;
                best_idx = i;
            }
        }
        let chosen = remaining.remove(best_idx);
        seen_sources.insert(chosen.source_path.clone());
        selected.push(chosen);
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding_client::EmbeddingClient;
    use crate::store::Store;
    use tempfile::TempDir;

    fn test_setup() -> (TempDir, Store, EmbeddingClient, AppConfig) {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            embedding_base_url: "http://localhost:0".to_string(),
            embedding_model: "test".to_string(),
            embedding_dim: 3,
            chunk_size: 500,
            overlap: 50,
            mmr_lambda: 0.7,
            source_repeat_penalty: 0.15,
            cache_max_entries: 128,
            cache_ttl_secs: 300,
            embed_timeout_secs: 5,
            over_fetch_factor: 2,
            deny_substrings: Vec::new(),
        };
        let store = Store::get_or_create(&config.store_path()).unwrap();
        let embedder = EmbeddingClient::new("http://localhost:0", "test", 5);
        (dir, store, embedder, config)
    }

    fn result(id: i64, source: &str, sim: f32) -> SearchResult {
        SearchResult {
            id,
            content: format!("content {id}"),
            source_path: source.to_string(),
            chunk_index: 0,
            similarity: sim,
        }
    }

    #[test]
    fn mmr_prefers_new_source_on_near_tie() {
        let candidates = vec![
            result(1, "a.md", 0.90),
            result(2, "a.md", 0.89),
            result(3, "a.md", 0.88),
            result(4, "b.md", 0.879),
        ];
        let selected = mmr_select(candidates, 3, 0.7, 0.15);
        assert_eq!(selected.len(), 3);
        let sources: Vec<&str> = selected.iter().map(|r| r.source_path.as_str()).collect();
        assert_eq!(sources.iter().filter(|s| **s == "a.md").count(), 2);
        assert_eq!(sources.iter().filter(|s| **s == "b.md").count(), 1);
    }

    #[test]
    fn mmr_stops_at_top_k() {
        let candidates = vec![result(1, "a.md", 0.9), result(2, "b.md", 0.8), result(3, "c.md", 0.7)];
        let selected = mmr_select(candidates, 2, 0.7, 0.15);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn recency_bonus_tiers() {
        assert_eq!(recency_bonus(0.5), 0.03);
        assert_eq!(recency_bonus(3.0), 0.02);
        assert_eq!(recency_bonus(20.0), 0.01);
        assert_eq!(recency_bonus(100.0), 0.0);
    }

    #[test]
    fn cache_hits_within_ttl_and_evicts_after() {
        let mut cache = QueryCache::new(2, 1);
        cache.insert("k1".into(), vec![result(1, "a.md", 0.5)]);
        assert!(cache.get("k1").is_some());
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn cache_evicts_oldest_over_capacity() {
        let mut cache = QueryCache::new(2, 300);
        cache.insert("k1".into(), vec![result(1, "a.md", 0.5)]);
        cache.insert("k2".into(), vec![result(2, "b.md", 0.5)]);
        cache.insert("k3".into(), vec![result(3, "c.md", 0.5)]);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
        assert!(cache.get("k3").is_some());
    }

    #[test]
    fn brute_force_rejects_query_dimension_mismatch() {
        let (_dir, store, embedder, config) = test_setup();
        let retriever = Retriever::new(&store, &embedder, &config);
        let err = retriever.brute_force(&[1.0, 0.0], 5, 2).unwrap_err();
        assert!(matches!(err, crate::error::AppError::DimensionMismatch { .. }));
    }

    #[test]
    fn candidates_falls_back_to_brute_force_on_corrupt_snapshot() {
        let (_dir, store, embedder, config) = test_setup();
        store
            .store_chunk("hello", "/tmp/a.md", 0, &[1.0, 0.0, 0.0], None, Some(1.0))
            .unwrap();

        // A vector snapshot whose byte length is not a multiple of 4 fails to load.
        std::fs::write(config.vector_path(), [0u8, 1, 2]).unwrap();
        std::fs::write(config.vector_metadata_path(), b"[]").unwrap();

        let retriever = Retriever::new(&store, &embedder, &config);
        let results = retriever.candidates(&[1.0, 0.0, 0.0], 5, 2).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_path, "/tmp/a.md");
    }
}
