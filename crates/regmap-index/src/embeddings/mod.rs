//! Embedding provider trait and an OpenAI-compatible HTTP implementation.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default embedding model.
pub const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// Dimensions of [`DEFAULT_MODEL`].
pub const DEFAULT_DIMENSIONS: usize = 1536;

/// Default endpoint for the embeddings API.
pub const DEFAULT_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed ({status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited after {0} retries")]
    RateLimited(u32),

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts in a batch
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embedding provider for any OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddings {
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl HttpEmbeddings {
    /// Create a provider with the default model and endpoint.
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            client: Client::new(),
            base_url: DEFAULT_EMBEDDINGS_URL.to_string(),
            max_retries: 3,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, dimensions: usize) -> Self {
        self.model = model.into();
        self.dimensions = dimensions;
        self
    }

    /// Set a custom base URL (useful for testing or proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Send embedding request with retry logic for rate limits.
    async fn send_request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let request_body = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let mut retry_count = 0;
        let mut backoff_secs = 1u64;

        loop {
            debug!(
                "Sending embedding request for {} texts to {}",
                expected, self.base_url
            );

            let mut request = self.client.post(&self.base_url).json(&request_body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

            let status = response.status();

            if status.is_success() {
                let embedding_response: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

                // Sort by index to ensure correct order
                let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
                    .data
                    .into_iter()
                    .map(|d| (d.index, d.embedding))
                    .collect();
                embeddings.sort_by_key(|(idx, _)| *idx);

                if embeddings.len() != expected {
                    return Err(EmbeddingError::InvalidResponse(format!(
                        "expected {} embeddings, got {}",
                        expected,
                        embeddings.len()
                    ))
                    .into());
                }

                return Ok(embeddings.into_iter().map(|(_, emb)| emb).collect());
            }

            if status.as_u16() == 429 {
                retry_count += 1;
                if retry_count > self.max_retries {
                    return Err(EmbeddingError::RateLimited(self.max_retries).into());
                }

                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                warn!(
                    "Rate limited, retrying after {} seconds (attempt {}/{})",
                    retry_after, retry_count, self.max_retries
                );

                tokio::time::sleep(tokio::time::Duration::from_secs(retry_after)).await;
                backoff_secs *= 2;
                continue;
            }

            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::ApiError {
                status: status.as_u16(),
                body,
            }
            .into());
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()).into())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Embedding batch of {} texts", texts.len());
        self.send_request(texts.to_vec()).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
