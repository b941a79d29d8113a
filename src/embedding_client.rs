//! Thin HTTP client for the external embedding service.
//!
//! `POST {base}/api/embeddings` with `{"model": ..., "prompt": text}`,
//! expecting `{"embedding": [f32, ...]}` back. Mirrors the wire contract of
//! a local Ollama-style embedding endpoint.

use crate::error::AppError;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Option<Vec<f32>>,
}

pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    batch_size: usize,
}

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build embedding HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            batch_size: crate::config::EMBED_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Embeds a single piece of text. Transport failures map to
    /// `EmbedUnavailable`; a response missing or mis-shaping the `embedding`
    /// field maps to `EmbedBadResponse`.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let payload = json!({ "model": self.model, "prompt": text });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::EmbedUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::EmbedUnavailable(format!(
                "embedding service returned status {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AppError::EmbedBadResponse(e.to_string()))?;

        parsed
            .embedding
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::EmbedBadResponse("response missing `embedding` field".into()))
    }

    /// Sequentially pipelines `embed` in batches of `batch_size`, converting
    /// per-text failures into `None` slots rather than aborting the whole
    /// batch.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            for text in batch {
                match self.embed(text).await {
                    Ok(v) => results.push(Some(v)),
                    Err(e) => {
                        warn!(error = %e, "embedding failed for one chunk, skipping");
                        results.push(None);
                    }
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_override_is_stored() {
        let client = EmbeddingClient::new("http://localhost:11434", "nomic-embed-text", 30)
            .with_batch_size(8);
        assert_eq!(client.batch_size, 8);
    }
}
