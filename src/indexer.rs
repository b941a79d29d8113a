//! Orchestrates scan → diff → chunk → embed → store → rebuild.

use crate::chunker;
use crate::config::AppConfig;
use crate::embedding_client::EmbeddingClient;
use crate::error::AppResult;
use crate::store::Store;
use crate::vector_index::VectorIndex;
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IndexReport {
    pub files_scanned: usize,
    pub files_reindexed: usize,
    pub files_purged: usize,
    pub chunks_written: usize,
    pub chunks_skipped: usize,
    pub rebuilt_vector_index: bool,
}

pub struct Indexer<'a> {
    store: &'a Store,
    embedder: &'a EmbeddingClient,
    config: &'a AppConfig,
}

impl<'a> Indexer<'a> {
    pub fn new(store: &'a Store, embedder: &'a EmbeddingClient, config: &'a AppConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub async fn index_directory(
        &self,
        dir: &Path,
        extensions: &[String],
        force: bool,
    ) -> AppResult<IndexReport> {
        let mut report = IndexReport::default();

        // `source_path` is stored and compared as an absolute path (§3), so
        // canonicalize the root before every downstream path is derived from it.
        let dir = dir.canonicalize()?;
        let dir = dir.as_path();

        // Step 1: enumerate. Step 2: filter dotfiles/deny-list.
        let files = self.enumerate_files(dir, extensions);
        report.files_scanned = files.len();

        // Step 3: orphan purge.
        let current_set: HashSet<String> = files
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        let indexed_set = self.store.get_indexed_files()?;
        for orphan in indexed_set.difference(&current_set) {
            self.store.delete_source(orphan)?;
            report.files_purged += 1;
            info!(source = %orphan, "purged orphaned source file");
        }

        // Step 4: change detection.
        let mut to_reindex = Vec::new();
        for path in &files {
            let path_str = path.to_string_lossy().to_string();
            let current_mtime = file_mtime_secs(path);
            let stored_mtime = self.store.get_file_mtime(&path_str)?;
            let needs_reindex = match (force, stored_mtime, current_mtime) {
                (true, _, _) => true,
                (false, None, _) => true,
                (false, Some(stored), Some(current)) => (current - stored).abs() > 0.01,
                (false, Some(_), None) => false,
            };
            if needs_reindex {
                if let Some(mtime) = current_mtime {
                    to_reindex.push((path.clone(), path_str, mtime));
                } else {
                    warn!(path = %path.display(), "skipping file with unreadable mtime");
                }
            }
        }
        report.files_reindexed = to_reindex.len();

        // Step 5: chunk + in-file dedup + renumber, per file.
        let mut pending: Vec<(String, String, i64, f64, String)> = Vec::new();
        // Deletes precede inserts for the whole run (per §5's ordering rule),
        // so purge every to-be-reindexed file's old rows before the
        // CPU-bound chunking fan-out below.
        for (_, path_str, _) in &to_reindex {
            self.store.delete_source(path_str)?;
        }

        // Chunking and in-file hashing are pure, per-file CPU work with no
        // shared state, so they parallelise cleanly across a small worker
        // pool; only the final store commit stays sequential.
        let per_file: Vec<Vec<(String, String, i64, f64, String)>> = to_reindex
            .par_iter()
            .map(|(path, path_str, mtime)| {
                let raw_chunks = chunker::chunk_file(path, self.config.chunk_size, self.config.overlap);
                dedup_and_renumber(raw_chunks, path_str, *mtime)
            })
            .collect();
        pending.extend(per_file.into_iter().flatten());

        // Step 6: no-op short circuit.
        if pending.is_empty() {
            info!(
                files_scanned = report.files_scanned,
                files_purged = report.files_purged,
                "index run produced no pending chunks; vector index not rebuilt"
            );
            return Ok(report);
        }

        // Step 7: batch-embed.
        let texts: Vec<String> = pending.iter().map(|(c, ..)| c.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await;

        // Step 8: store successful entries.
        let mut to_store = Vec::new();
        for ((content, source, idx, mtime, hash), embedding) in pending.into_iter().zip(embeddings) {
            match embedding {
                Some(v) if v.len() == self.config.embedding_dim => {
                    to_store.push((content, source, idx, v, hash, mtime));
                }
                Some(v) => {
                    warn!(
                        expected = self.config.embedding_dim,
                        actual = v.len(),
                        "dropping chunk with mismatched embedding dimension"
                    );
                    report.chunks_skipped += 1;
                }
                None => {
                    report.chunks_skipped += 1;
                }
            }
        }
        if !to_store.is_empty() {
            let ids = self.store.store_chunks_batch(&to_store)?;
            report.chunks_written = ids.len();
        }

        // Step 9: rebuild vector index from the store, end to end.
        self.rebuild_vector_index()?;
        report.rebuilt_vector_index = true;

        Ok(report)
    }

    pub fn rebuild_vector_index(&self) -> AppResult<()> {
        let embeddings = self.store.get_embeddings_only()?;
        let rows = embeddings
            .into_iter()
            .map(|e| (e.id, e.source_path, e.chunk_index, e.embedding))
            .collect();

        let mut index = VectorIndex::new(
            self.config.embedding_dim,
            self.config.vector_path(),
            self.config.vector_metadata_path(),
        );
        index.build(rows)?;
        Ok(())
    }

    fn enumerate_files(&self, dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
        let ext_set: HashSet<String> = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();

        WalkBuilder::new(dir)
            .hidden(false)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .max_depth(Some(32))
            .build()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .filter(|entry| has_matching_extension(entry.path(), &ext_set))
            .filter(|entry| !is_dotted_or_denied(entry.path(), dir, &self.config.deny_substrings))
            .map(|entry| entry.into_path())
            .collect()
    }
}

fn has_matching_extension(path: &Path, ext_set: &HashSet<String>) -> bool {
    path.extension()
        .map(|e| ext_set.contains(&e.to_string_lossy().to_lowercase()))
        .unwrap_or(false)
}

fn is_dotted_or_denied(path: &Path, root: &Path, deny_substrings: &[String]) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    if relative
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
    {
        return true;
    }
    let rel_str = relative.to_string_lossy();
    deny_substrings.iter().any(|s| rel_str.contains(s.as_str()))
}

/// Deduplicates a file's raw chunks by `content_hash` (first occurrence
/// wins) and renumbers the survivors `0..K-1`, per §4.5 step 5.
fn dedup_and_renumber(
    raw_chunks: Vec<chunker::RawChunk>,
    path_str: &str,
    mtime: f64,
) -> Vec<(String, String, i64, f64, String)> {
    let mut seen_hashes = HashSet::new();
    let mut next_index: i64 = 0;
    let mut out = Vec::new();
    for chunk in raw_chunks {
        let hash = format!("{:x}", md5::compute(chunk.content.as_bytes()));
        if !seen_hashes.insert(hash.clone()) {
            continue;
        }
        out.push((chunk.content, path_str.to_string(), next_index, mtime, hash));
        next_index += 1;
    }
    out
}

fn file_mtime_secs(path: &Path) -> Option<f64> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    let duration = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding_client::EmbeddingClient;
    use crate::store::Store;
    use tempfile::TempDir;

    #[tokio::test]
    async fn index_directory_treats_the_root_as_canonicalized() {
        let corpus = TempDir::new().unwrap();
        std::fs::write(corpus.path().join("a.md"), "hello").unwrap();
        // A path with redundant "." / ".." components that canonicalize()
        // resolves down to the same directory.
        let uncanonical = corpus.path().join(".").join("..").join(
            corpus.path().file_name().unwrap(),
        );
        let data_dir = TempDir::new().unwrap();
        let config = AppConfig {
            data_dir: data_dir.path().to_string_lossy().to_string(),
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

        // Pre-seed a row under the *uncanonical* path string, as if an
        // earlier version of the store had recorded it verbatim.
        store
            .store_chunk("stale", &uncanonical.join("a.md").to_string_lossy(), 0, &[0.1, 0.2, 0.3], None, Some(1.0))
            .unwrap();

        let embedder = EmbeddingClient::new("http://localhost:0", "test", 5);
        let indexer = Indexer::new(&store, &embedder, &config);

        // If the root were not canonicalized, the freshly-enumerated file's
        // path string would equal the pre-seeded row's path string and it
        // would not be purged. Canonicalizing makes them diverge, so the
        // pre-seeded non-canonical row is treated as an orphan.
        let report = indexer
            .index_directory(&uncanonical, &["md".to_string()], false)
            .await
            .unwrap();
        assert_eq!(report.files_purged, 1);
        assert_eq!(report.files_scanned, 1);
    }

    #[test]
    fn dotted_segments_are_denied() {
        let root = Path::new("/corpus");
        assert!(is_dotted_or_denied(Path::new("/corpus/.git/a.md"), root, &[]));
        assert!(!is_dotted_or_denied(Path::new("/corpus/notes/a.md"), root, &[]));
    }

    #[test]
    fn deny_substrings_match_relative_path() {
        let root = Path::new("/corpus");
        let deny = vec!["drafts".to_string()];
        assert!(is_dotted_or_denied(Path::new("/corpus/drafts/a.md"), root, &deny));
        assert!(!is_dotted_or_denied(Path::new("/corpus/final/a.md"), root, &deny));
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        let set: HashSet<String> = ["md".to_string()].into_iter().collect();
        assert!(has_matching_extension(Path::new("a.MD"), &set));
        assert!(!has_matching_extension(Path::new("a.txt"), &set));
    }

    #[test]
    fn dedup_keeps_first_occurrence_and_renumbers_contiguously() {
        let raw = vec![
            chunker::RawChunk { content: "same".into(), chunk_index: 0 },
            chunker::RawChunk { content: "different".into(), chunk_index: 1 },
            chunker::RawChunk { content: "same".into(), chunk_index: 2 },
        ];
        let pending = dedup_and_renumber(raw, "/corpus/a.md", 123.0);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].2, 0);
        assert_eq!(pending[1].2, 1);
        assert_eq!(pending[0].0, "same");
        assert_eq!(pending[1].0, "different");
        let hashes: HashSet<&String> = pending.iter().map(|(_, _, _, _, h)| h).collect();
        assert_eq!(hashes.len(), 2);
    }
}
