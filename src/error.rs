use thiserror::Error;

/// Error kinds surfaced by the indexing and retrieval pipelines.
///
/// Indexing absorbs per-item variants (`EmbedUnavailable`, `EmbedBadResponse`,
/// `DimensionMismatch`, per-file `IoError`) to keep making progress; retrieval
/// treats embedding failures as fatal since a query that cannot be embedded
/// cannot be searched.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("embedding service unavailable: {0}")]
    EmbedUnavailable(String),

    #[error("embedding service returned a bad response: {0}")]
    EmbedBadResponse(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("corpus is empty")]
    EmptyCorpus,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::StoreError(e.to_string())
    }
}

impl From<r2d2::Error> for AppError {
    fn from(e: r2d2::Error) -> Self {
        AppError::StoreError(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
