//! Embedding provider implementations.
//!
//! Every provider implements [`grounding_core::embedding::Embedder`]:
//! - **[`DisabledEmbedder`]**: returns errors; used when embeddings are switched off.
//! - **`hashing`**: [`HashingEmbedder`], deterministic and offline.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings` with batching, retry, and backoff.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: fastembed, behind the `local-embeddings-fastembed` feature.
//!
//! # Retry Strategy
//!
//! The HTTP providers share one policy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... up to `embedding.max_retries` retries

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use grounding_core::embedding::Embedder;
pub use grounding_core::embedding::HashingEmbedder;

use crate::config::EmbeddingConfig;
use crate::retry::{retry_with, Backoff, RetryPolicy};

// ============ Disabled ============

/// An embedder that always fails. Ingestion and queries report the error
/// per request instead of refusing to start.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.")
    }
}

// ============ Shared HTTP plumbing ============

/// Outcome of one HTTP attempt.
enum CallError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

impl CallError {
    fn is_retryable(&self) -> bool {
        matches!(self, CallError::Retryable(_))
    }

    fn into_inner(self) -> anyhow::Error {
        match self {
            CallError::Retryable(e) | CallError::Fatal(e) => e,
        }
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    label: &str,
) -> Result<serde_json::Value, CallError> {
    let mut req = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(body);
    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {}", key));
    }

    let response = req
        .send()
        .await
        .map_err(|e| CallError::Retryable(anyhow!("{} connection error ({}): {}", label, url, e)))?;
    let status = response.status();

    if status.is_success() {
        return response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| CallError::Retryable(anyhow!("{} returned invalid JSON: {}", label, e)));
    }

    let body_text = response.text().await.unwrap_or_default();
    let err = anyhow!("{} API error {}: {}", label, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(CallError::Retryable(err))
    } else {
        Err(CallError::Fatal(err))
    }
}

fn http_retry_policy(config: &EmbeddingConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.max_retries,
        base_delay: Duration::from_secs(1),
        backoff: Backoff::Exponential,
    }
}

fn check_dims(vectors: &[Vec<f32>], expected: usize, expected_count: usize) -> Result<()> {
    if vectors.len() != expected_count {
        bail!(
            "Embedding response has {} vectors for {} inputs",
            vectors.len(),
            expected_count
        );
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != expected) {
        bail!(
            "Embedding dimension mismatch: expected {}, got {}",
            expected,
            v.len()
        );
    }
    Ok(())
}

fn parse_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("embedding is not an array"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI ============

/// Embedder backed by the OpenAI embeddings API.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    retry: RetryPolicy,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            model,
            dims,
            batch_size: config.batch_size.max(1),
            retry: http_retry_policy(config),
        })
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = retry_with(&self.retry, CallError::is_retryable, |_| {
                post_json(&self.client, &url, Some(&self.api_key), &body, "OpenAI")
            })
            .await
            .map_err(CallError::into_inner)?;
            let vectors = parse_openai_response(&json)?;
            check_dims(&vectors, self.dims, batch.len())?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    retry: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
            dims,
            batch_size: config.batch_size.max(1),
            retry: http_retry_policy(config),
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(parse_vector)
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = retry_with(&self.retry, CallError::is_retryable, |_| {
                post_json(&self.client, &url, None, &body, "Ollama")
            })
            .await
            .map_err(CallError::into_inner)?;
            let vectors = parse_ollama_response(&json)?;
            check_dims(&vectors, self.dims, batch.len())?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

// ============ Local (fastembed) ============

/// Local ONNX inference via fastembed. The model is downloaded on first
/// use and kept loaded afterwards.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Validate the name up front.
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size.max(1),
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1, \
             nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let count = texts.len();
        let name = self.model_name.clone();
        let batch_size = self.batch_size;
        let slot = self.model.clone();

        let vectors = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(config_to_fastembed_model(&name)?)
                        .with_show_download_progress(true),
                )
                .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model not loaded"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await??;

        check_dims(&vectors, self.dims, count)?;
        Ok(vectors)
    }
}

/// Create the [`Embedder`] named by `[embedding].provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"hashing"` | [`HashingEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (needs `--features local-embeddings-fastembed`) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims.unwrap_or(384)))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
