//! Durable keyed storage of chunks, vectors, per-file mtimes, and search
//! telemetry, backed by embedded SQLite behind a small connection pool.

use crate::error::AppResult;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    source_path TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    content_hash TEXT,
    file_mtime REAL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(source_path, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_chunks_source_path ON chunks(source_path);
CREATE INDEX IF NOT EXISTS idx_chunks_content_hash ON chunks(content_hash);

CREATE TABLE IF NOT EXISTS search_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query TEXT NOT NULL,
    top_score REAL,
    num_results INTEGER NOT NULL,
    search_time_ms REAL NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub id: i64,
    pub source_path: String,
    pub chunk_index: i64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ChunkContent {
    pub content: String,
    pub source_path: String,
    pub chunk_index: i64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreStats {
    pub total_chunks: i64,
    pub total_files: i64,
}

pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Opens (creating if absent) the store at `path`, enabling WAL mode and
    /// initialising schema and indexes.
    pub fn get_or_create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;
                 PRAGMA foreign_keys=ON;",
            )?;
            Ok(())
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        let store = Self { pool };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> AppResult<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Upserts a chunk keyed on `(source_path, chunk_index)`. Computes
    /// `content_hash` from `content` when not supplied.
    pub fn store_chunk(
        &self,
        content: &str,
        source_path: &str,
        chunk_index: i64,
        embedding: &[f32],
        content_hash: Option<&str>,
        mtime: Option<f64>,
    ) -> AppResult<i64> {
        let hash = content_hash
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{:x}", md5::compute(content.as_bytes())));
        let packed = embedding_to_bytes(embedding);

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "INSERT INTO chunks (content, source_path, chunk_index, embedding, content_hash, file_mtime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_path, chunk_index) DO UPDATE SET
                content = excluded.content,
                embedding = excluded.embedding,
                content_hash = excluded.content_hash,
                file_mtime = excluded.file_mtime
             RETURNING id",
        )?;
        let id: i64 = stmt.query_row(
            params![content, source_path, chunk_index, packed, hash, mtime],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Transactionally stores every pending chunk for one file. Callers are
    /// responsible for calling `delete_source` first so deletes precede
    /// inserts within an indexing run.
    pub fn store_chunks_batch(
        &self,
        chunks: &[(String, String, i64, Vec<f32>, String, f64)],
    ) -> AppResult<Vec<i64>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(chunks.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO chunks (content, source_path, chunk_index, embedding, content_hash, file_mtime)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(source_path, chunk_index) DO UPDATE SET
                    content = excluded.content,
                    embedding = excluded.embedding,
                    content_hash = excluded.content_hash,
                    file_mtime = excluded.file_mtime
                 RETURNING id",
            )?;
            for (content, source, idx, embedding, hash, mtime) in chunks {
                let packed = embedding_to_bytes(embedding);
                let id: i64 = stmt.query_row(
                    params![content, source, idx, packed, hash, mtime],
                    |row| row.get(0),
                )?;
                ids.push(id);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn delete_source(&self, source_path: &str) -> AppResult<usize> {
        let conn = self.pool.get()?;
        let count = conn.execute(
            "DELETE FROM chunks WHERE source_path = ?1",
            params![source_path],
        )?;
        Ok(count)
    }

    pub fn get_file_mtime(&self, source_path: &str) -> AppResult<Option<f64>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare_cached("SELECT file_mtime FROM chunks WHERE source_path = ?1 LIMIT 1")?;
        let result = stmt
            .query_row(params![source_path], |row| row.get::<_, Option<f64>>(0))
            .ok()
            .flatten();
        Ok(result)
    }

    pub fn get_indexed_files(&self) -> AppResult<HashSet<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached("SELECT DISTINCT source_path FROM chunks")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut set = HashSet::new();
        for row in rows {
            set.insert(row?);
        }
        Ok(set)
    }

    /// Used to rebuild the Vector Index without paying for content bytes.
    pub fn get_embeddings_only(&self) -> AppResult<Vec<EmbeddedChunk>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare_cached("SELECT id, source_path, chunk_index, embedding FROM chunks")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let source_path: String = row.get(1)?;
            let chunk_index: i64 = row.get(2)?;
            let raw: Vec<u8> = row.get(3)?;
            Ok((id, source_path, chunk_index, raw))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, source_path, chunk_index, raw) = row?;
            match bytes_to_embedding(&raw) {
                Ok(embedding) => out.push(EmbeddedChunk {
                    id,
                    source_path,
                    chunk_index,
                    embedding,
                }),
                Err(e) => warn!(id, error = %e, "skipping chunk with unreadable embedding"),
            }
        }
        Ok(out)
    }

    pub fn get_chunks_by_ids(&self, ids: &[i64]) -> AppResult<HashMap<i64, ChunkContent>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.pool.get()?;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, content, source_path, chunk_index FROM chunks WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params_iter = rusqlite::params_from_iter(ids.iter());
        let rows = stmt.query_map(params_iter, |row| {
            let id: i64 = row.get(0)?;
            let content: String = row.get(1)?;
            let source_path: String = row.get(2)?;
            let chunk_index: i64 = row.get(3)?;
            Ok((
                id,
                ChunkContent {
                    content,
                    source_path,
                    chunk_index,
                },
            ))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (id, chunk) = row?;
            map.insert(id, chunk);
        }
        Ok(map)
    }

    /// Streams all chunks for the brute-force similarity fallback.
    pub fn all_chunks(&self) -> AppResult<Vec<(EmbeddedChunk, String)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare_cached("SELECT id, source_path, chunk_index, embedding, content FROM chunks")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let source_path: String = row.get(1)?;
            let chunk_index: i64 = row.get(2)?;
            let raw: Vec<u8> = row.get(3)?;
            let content: String = row.get(4)?;
            Ok((id, source_path, chunk_index, raw, content))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, source_path, chunk_index, raw, content) = row?;
            if let Ok(embedding) = bytes_to_embedding(&raw) {
                out.push((
                    EmbeddedChunk {
                        id,
                        source_path,
                        chunk_index,
                        embedding,
                    },
                    content,
                ));
            }
        }
        Ok(out)
    }

    /// Fire-and-forget: telemetry logging must never raise.
    pub fn log_search(&self, query: &str, top_score: Option<f32>, num_results: usize, elapsed_ms: f64) {
        let result = self.pool.get().and_then(|conn| {
            conn.execute(
                "INSERT INTO search_log (query, top_score, num_results, search_time_ms) VALUES (?1, ?2, ?3, ?4)",
                params![query, top_score, num_results as i64, elapsed_ms],
            ).map_err(Into::into)
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to log search telemetry, ignoring");
        }
    }

    pub fn get_stats(&self) -> AppResult<StoreStats> {
        let conn = self.pool.get()?;
        let total_chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        let total_files: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT source_path) FROM chunks",
            [],
            |r| r.get(0),
        )?;
        Ok(StoreStats {
            total_chunks,
            total_files,
        })
    }
}

/// Packs a vector as little-endian float32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Detects the legacy JSON-array encoding by first byte (`[`) and converts
/// transparently; otherwise unpacks little-endian float32 bytes.
pub fn bytes_to_embedding(raw: &[u8]) -> AppResult<Vec<f32>> {
    if raw.first() == Some(&b'[') {
        let values: Vec<f32> = serde_json::from_slice(raw)?;
        return Ok(values);
    }
    if raw.len() % 4 != 0 {
        return Err(crate::error::AppError::StoreError(
            "embedding byte length is not a multiple of 4".into(),
        ));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::get_or_create(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let v = vec![0.1_f32, -0.2, 3.5];
        let bytes = embedding_to_bytes(&v);
        let back = bytes_to_embedding(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn legacy_json_embedding_detected_by_first_byte() {
        let json = serde_json::to_vec(&vec![1.0_f32, 2.0]).unwrap();
        let back = bytes_to_embedding(&json).unwrap();
        assert_eq!(back, vec![1.0, 2.0]);
    }

    #[test]
    fn store_and_fetch_chunk() {
        let (_dir, store) = open_temp();
        let id = store
            .store_chunk("hello world", "/tmp/a.md", 0, &[0.1, 0.2], None, Some(1000.0))
            .unwrap();
        let fetched = store.get_chunks_by_ids(&[id]).unwrap();
        assert_eq!(fetched.get(&id).unwrap().content, "hello world");
    }

    #[test]
    fn upsert_on_same_source_and_index_replaces_row() {
        let (_dir, store) = open_temp();
        let id1 = store
            .store_chunk("v1", "/tmp/a.md", 0, &[0.1], None, Some(1.0))
            .unwrap();
        let id2 = store
            .store_chunk("v2", "/tmp/a.md", 0, &[0.2], None, Some(2.0))
            .unwrap();
        assert_eq!(id1, id2);
        let fetched = store.get_chunks_by_ids(&[id2]).unwrap();
        assert_eq!(fetched.get(&id2).unwrap().content, "v2");
    }

    #[test]
    fn delete_source_removes_all_its_chunks() {
        let (_dir, store) = open_temp();
        store.store_chunk("a", "/tmp/a.md", 0, &[0.1], None, Some(1.0)).unwrap();
        store.store_chunk("b", "/tmp/a.md", 1, &[0.2], None, Some(1.0)).unwrap();
        let removed = store.delete_source("/tmp/a.md").unwrap();
        assert_eq!(removed, 2);
        assert!(store.get_indexed_files().unwrap().is_empty());
    }

    #[test]
    fn stats_reflect_distinct_files_and_total_chunks() {
        let (_dir, store) = open_temp();
        store.store_chunk("a", "/tmp/a.md", 0, &[0.1], None, Some(1.0)).unwrap();
        store.store_chunk("b", "/tmp/b.md", 0, &[0.2], None, Some(1.0)).unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_files, 2);
    }

    #[test]
    fn log_search_never_raises() {
        let (_dir, store) = open_temp();
        store.log_search("query", Some(0.9), 3, 12.5);
    }
}
