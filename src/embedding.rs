//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`** (feature `local-embeddings`): runs models in-process via fastembed.
//!
//! Also provides [`cosine_similarity`] and [`check_batch`], the dimensionality
//! guard every snapshot build goes through.
//!
//! # Retry Strategy
//!
//! Network providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// A text embedding backend.
///
/// `embed_batch` returns one vector per input text, in input order, all of
/// the same length.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed `texts` in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed_batch(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Reject a response whose length does not match the request or whose
/// vectors disagree on dimensionality.
pub fn check_batch(expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        bail!(
            "Embedding service returned {} vectors for {} inputs",
            vectors.len(),
            expected
        );
    }
    if let Some(first) = vectors.first() {
        let dims = first.len();
        if let Some(bad) = vectors.iter().position(|v| v.len() != dims) {
            bail!(
                "Embedding vector {} has {} dims, expected {}",
                bad,
                vectors[bad].len(),
                dims
            );
        }
    }
    Ok(())
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST {url}/v1/embeddings` (default `https://api.openai.com`).
/// Requires the `OPENAI_API_KEY` environment variable to be set. Inputs are
/// sent in `batch_size` slices and reassembled in order.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for slice in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": slice,
            });
            let request = self
                .client
                .post(format!("{}/v1/embeddings", self.url.trim_end_matches('/')))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body);
            let json = send_with_retry(request, self.max_retries, "OpenAI").await?;
            all.extend(parse_openai_response(&json)?);
        }
        Ok(all)
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts the `data[].embedding` arrays, ordered by their `index` field.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body);
        let json = send_with_retry(request, self.max_retries, "Ollama")
            .await
            .with_context(|| format!("is Ollama running at {}?", self.url))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());

    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

// ============ Local Provider (fastembed) ============

/// Embedding provider running a model in-process.
///
/// Models are downloaded on first use from Hugging Face and cached; after
/// that no network calls are made.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Fail fast on names fastembed does not know.
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(384),
            batch_size: config.batch_size,
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Use all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, or nomic-embed-text-v1.5.",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = config_to_fastembed_model(&self.model_name)?;
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model).with_show_download_progress(true),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await
        .context("Local embedding task panicked")?
    }
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// POST a prepared request, retrying 429/5xx and transport errors with
/// exponential backoff. Returns the parsed JSON body.
pub(crate) async fn send_with_retry(
    request: reqwest::RequestBuilder,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(service, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let Some(req) = request.try_clone() else {
            bail!("{} request body cannot be retried", service);
        };

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        service,
                        status,
                        body_text
                    ));
                    continue;
                }

                bail!("{} API error {}: {}", service, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error: {}", service, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", service)))
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` when either vector has zero
/// norm, the vectors are empty, or their lengths differ.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm() {
        let zero = vec![0.0, 0.0, 0.0];
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_check_batch() {
        assert!(check_batch(2, &[vec![1.0, 0.0], vec![0.0, 1.0]]).is_ok());
        assert!(check_batch(0, &[]).is_ok());
        assert!(check_batch(3, &[vec![1.0], vec![1.0]]).is_err());
        assert!(check_batch(2, &[vec![1.0, 0.0], vec![1.0]]).is_err());
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.5], [1.0, 0.0]]});
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        assert!(embed_query(provider.as_ref(), "hello").await.is_err());
    }
}
