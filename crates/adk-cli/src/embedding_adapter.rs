//! An OpenAI-compatible embeddings HTTP client implementing
//! `adk_core::interfaces::EmbeddingProvider`.
//!
//! The teacher has no embedding HTTP client of its own (its retrieval layer
//! is text/tag based), so this is built fresh in `LlmClient`'s style:
//! a small `reqwest::Client`, a bearer header, a JSON body, and
//! status-then-parse error handling. The request pins `dimensions` to
//! [`adk_core::model::EMBEDDING_DIM`] so every returned vector satisfies
//! `Embedding::new`'s exact-length requirement regardless of which
//! OpenAI-compatible model answers it.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use adk_core::error::{AdkError, Result};
use adk_core::interfaces::EmbeddingProvider;
use adk_core::model::{Embedding, EmbeddingTaskType, EMBEDDING_DIM};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl OpenAiEmbeddingConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: model.into(),
        }
    }
}

pub struct OpenAiEmbeddingProvider {
    config: OpenAiEmbeddingConfig,
    http: reqwest::Client,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: OpenAiEmbeddingConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AdkError::EmbedUnavailable(
                "embedding provider is missing an API key".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| AdkError::EmbedUnavailable(format!("invalid API key: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .map_err(|e| AdkError::EmbedUnavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, http })
    }

    async fn request_embeddings(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.config.model,
            "input": inputs,
            "dimensions": EMBEDDING_DIM,
        });

        let resp = self
            .http
            .post(format!("{}/embeddings", self.config.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AdkError::EmbedUnavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AdkError::EmbedUnavailable(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(AdkError::EmbedUnavailable(format!(
                "embeddings API returned {status}: {text}"
            )));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| AdkError::EmbedUnavailable(format!("invalid JSON response: {e}")))?;

        let data = parsed
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| AdkError::EmbedUnavailable("response missing `data` array".to_string()))?;

        data.iter()
            .map(|entry| {
                entry
                    .get("embedding")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_f64)
                            .map(|v| v as f32)
                            .collect::<Vec<f32>>()
                    })
                    .ok_or_else(|| {
                        AdkError::EmbedUnavailable("response entry missing `embedding` array".to_string())
                    })
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed_one(&self, text: &str, _task_type: EmbeddingTaskType) -> Result<Embedding> {
        let mut vectors = self.request_embeddings(vec![text.to_string()]).await?;
        let values = vectors
            .pop()
            .ok_or_else(|| AdkError::EmbedUnavailable("embeddings API returned no vectors".to_string()))?;
        Embedding::new(values)
            .ok_or_else(|| AdkError::EmbedUnavailable(format!("embedding dimension mismatch, expected {EMBEDDING_DIM}")))
    }

    async fn embed_many(&self, texts: &[String], _task_type: EmbeddingTaskType) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request_embeddings(texts.to_vec()).await?;
        vectors
            .into_iter()
            .map(|values| {
                Embedding::new(values).ok_or_else(|| {
                    AdkError::EmbedUnavailable(format!("embedding dimension mismatch, expected {EMBEDDING_DIM}"))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_api_key() {
        let err = OpenAiEmbeddingProvider::new(OpenAiEmbeddingConfig::new("", "text-embedding-3-small"))
            .unwrap_err();
        assert_eq!(err.kind(), "ERR_EMBED_UNAVAILABLE");
    }
}
