//! In-memory exact inner-product search over L2-normalised vectors, with a
//! persistent snapshot (binary vector file + JSON metadata sidecar).
//!
//! No quantisation: an exact scan is acceptable at the expected corpus scale
//! (≤10^6 chunks). Larger deployments may swap this for an IVF/HNSW index
//! without altering the `build / load / search / exists` contract.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorMeta {
    pub id: i64,
    pub source_path: String,
    pub chunk_index: i64,
}

#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: i64,
    pub source_path: String,
    pub chunk_index: i64,
    pub score: f32,
}

pub struct VectorIndex {
    dim: usize,
    /// Row-major, N x dim, each row L2-normalised.
    vectors: Vec<f32>,
    metadata: Vec<VectorMeta>,
    vector_path: PathBuf,
    metadata_path: PathBuf,
}

impl VectorIndex {
    pub fn new(dim: usize, vector_path: PathBuf, metadata_path: PathBuf) -> Self {
        Self {
            dim,
            vectors: Vec::new(),
            metadata: Vec::new(),
            vector_path,
            metadata_path,
        }
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn metadata(&self) -> &[VectorMeta] {
        &self.metadata
    }

    /// Normalises every input vector L2 and writes the snapshot to disk.
    /// Accepts rows of `(id, source_path, chunk_index, embedding)`; any
    /// trailing content field (a legacy 5-tuple shape) is simply not part of
    /// this input type and is ignored by construction.
    pub fn build(&mut self, rows: Vec<(i64, String, i64, Vec<f32>)>) -> AppResult<()> {
        let mut vectors = Vec::with_capacity(rows.len() * self.dim);
        let mut metadata = Vec::with_capacity(rows.len());

        for (id, source_path, chunk_index, embedding) in rows {
            if embedding.len() != self.dim {
                return Err(AppError::DimensionMismatch {
                    expected: self.dim,
                    actual: embedding.len(),
                });
            }
            let normalised = l2_normalise(&embedding);
            vectors.extend_from_slice(&normalised);
            metadata.push(VectorMeta {
                id,
                source_path,
                chunk_index,
            });
        }

        self.vectors = vectors;
        self.metadata = metadata;
        self.persist()?;
        Ok(())
    }

    fn persist(&self) -> AppResult<()> {
        if let Some(parent) = self.vector_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = Vec::with_capacity(self.vectors.len() * 4);
        for v in &self.vectors {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        atomic_write(&self.vector_path, &bytes)?;

        let json = serde_json::to_vec(&self.metadata)?;
        atomic_write(&self.metadata_path, &json)?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.vector_path.exists() && self.metadata_path.exists()
    }

    /// Loads the persisted snapshot, returning `None` if either artefact is
    /// missing.
    pub fn load(dim: usize, vector_path: PathBuf, metadata_path: PathBuf) -> AppResult<Option<Self>> {
        if !vector_path.exists() || !metadata_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&vector_path)?;
        if raw.len() % 4 != 0 {
            return Err(AppError::StoreError("vector snapshot length not a multiple of 4".into()));
        }
        let vectors: Vec<f32> = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let metadata_raw = std::fs::read(&metadata_path)?;
        let metadata: Vec<VectorMeta> = serde_json::from_slice(&metadata_raw)?;

        if dim > 0 && !metadata.is_empty() && vectors.len() != metadata.len() * dim {
            return Err(AppError::StoreError(
                "vector snapshot row count does not match metadata length".into(),
            ));
        }

        Ok(Some(Self {
            dim,
            vectors,
            metadata,
            vector_path,
            metadata_path,
        }))
    }

    /// L2-normalises the query and returns the `min(top_k * over_fetch, N)`
    /// highest inner-product rows.
    pub fn search(&self, query: &[f32], top_k: usize, over_fetch: usize) -> AppResult<Vec<VectorMatch>> {
        if query.len() != self.dim {
            return Err(AppError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let q = l2_normalise(query);
        let limit = (top_k * over_fetch).min(self.metadata.len());

        let mut scored: Vec<VectorMatch> = self
            .metadata
            .iter()
            .enumerate()
            .map(|(row, meta)| {
                let row_start = row * self.dim;
                let row_vec = &self.vectors[row_start..row_start + self.dim];
                let score = dot(&q, row_vec);
                VectorMatch {
                    id: meta.id,
                    source_path: meta.source_path.clone(),
                    chunk_index: meta.chunk_index,
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    #[cfg(test)]
    fn row_norm(&self, row: usize) -> f32 {
        let start = row * self.dim;
        dot(&self.vectors[start..start + self.dim], &self.vectors[start..start + self.dim]).sqrt()
    }
}

fn l2_normalise(v: &[f32]) -> Vec<f32> {
    let norm = dot(v, v).sqrt();
    if norm < 1e-12 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn atomic_write(path: &Path, data: &[u8]) -> AppResult<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Cosine similarity over raw (not necessarily normalised) vectors, used by
/// the Retriever's brute-force fallback.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = dot(a, a).sqrt() * dot(b, b).sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot(a, b) / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let v = dir.path().join("vec.bin");
        let m = dir.path().join("meta.json");
        (dir, v, m)
    }

    #[test]
    fn build_normalises_rows_to_unit_norm() {
        let (_dir, v, m) = paths();
        let mut idx = VectorIndex::new(3, v, m);
        idx.build(vec![(1, "a.md".into(), 0, vec![3.0, 4.0, 0.0])]).unwrap();
        let norm = idx.row_norm(0);
        assert!((norm - 1.0).abs() < 1e-5, "norm was {norm}");
    }

    #[test]
    fn build_rejects_dimension_mismatch() {
        let (_dir, v, m) = paths();
        let mut idx = VectorIndex::new(3, v, m);
        let err = idx.build(vec![(1, "a.md".into(), 0, vec![1.0, 2.0])]).unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { .. }));
    }

    #[test]
    fn exists_false_until_build_persists() {
        let (_dir, v, m) = paths();
        let idx = VectorIndex::new(3, v, m);
        assert!(!idx.exists());
    }

    #[test]
    fn load_roundtrips_build() {
        let (_dir, v, m) = paths();
        let mut idx = VectorIndex::new(2, v.clone(), m.clone());
        idx.build(vec![
            (1, "a.md".into(), 0, vec![1.0, 0.0]),
            (2, "b.md".into(), 0, vec![0.0, 1.0]),
        ])
        .unwrap();

        let loaded = VectorIndex::load(2, v, m).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn load_returns_none_when_snapshot_missing() {
        let (_dir, v, m) = paths();
        let loaded = VectorIndex::load(2, v, m).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn search_over_fetches_by_factor() {
        let (_dir, v, m) = paths();
        let mut idx = VectorIndex::new(2, v, m);
        idx.build(vec![
            (1, "a.md".into(), 0, vec![1.0, 0.0]),
            (2, "a.md".into(), 1, vec![0.9, 0.1]),
            (3, "b.md".into(), 0, vec![0.0, 1.0]),
            (4, "b.md".into(), 1, vec![-1.0, 0.0]),
        ])
        .unwrap();

        let results = idx.search(&[1.0, 0.0], 1, 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn search_rejects_query_dimension_mismatch() {
        let (_dir, v, m) = paths();
        let mut idx = VectorIndex::new(2, v, m);
        idx.build(vec![(1, "a.md".into(), 0, vec![1.0, 0.0])]).unwrap();
        let err = idx.search(&[1.0, 0.0, 0.0], 1, 2).unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { .. }));
    }
}
