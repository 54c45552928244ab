use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::MemoryError;

/// Texts per embedding API request.
pub const EMBED_BATCH_SIZE: usize = 100;

/// Maps batches of text to fixed-dimension vectors.
///
/// An embedder yielding an empty vector is valid and degrades the index to
/// lexical-only operation; chunks left without embeddings are retried on a
/// later sync once a real backend is configured.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts` in order. May return fewer vectors than inputs only by
    /// returning none at all (no backend); a partial response is an error.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError>;

    /// Whether this embedder can produce vectors at all. Disabled embedders
    /// never cause re-index churn for embedding-less chunks.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Embedder with no backend: yields nothing, index stays lexical-only.
pub struct NoopEmbedder;

#[async_trait]
impl Embedder for NoopEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Ok(Vec::new())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// OpenAI embeddings API client (text-embedding-3-small class).
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        debug!(count = texts.len(), model = %self.model, "embedding batch");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "embeddings API error");
            return Err(MemoryError::Embedding(format!(
                "embeddings API returned {status}: {text}"
            )));
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;

        let mut data = api_resp.data;
        if data.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

// OpenAI API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}
