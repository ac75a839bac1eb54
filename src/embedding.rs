//! Text and image embedding capabilities.
//!
//! Defines the [`TextEmbedder`] and [`ImageEmbedder`] traits and their
//! implementations:
//! - **[`DisabledTextEmbedder`]** / **[`DisabledImageEmbedder`]**: always fail; used when
//!   a provider is not configured. The pipeline logs the failure and carries on.
//! - **[`OpenAiTextEmbedder`]**: calls the OpenAI embeddings API in batches.
//! - **`LocalTextEmbedder`** / **`LocalImageEmbedder`**: run fastembed models in-process
//!   (feature `local-embeddings-fastembed`). The CLIP pair shares one 512-dim space so
//!   text queries can hit image vectors.
//!
//! Also provides the vector utilities used by the SQLite stores:
//! [`vec_to_blob`], [`blob_to_vec`] and [`cosine_similarity`].
//!
//! No call is retried. A failed batch fails the whole `encode` call.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, ImageEmbeddingConfig};

#[async_trait]
pub trait TextEmbedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// One vector per input, in input order.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Verify the backend is usable before a run starts.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    fn model_name(&self) -> &str;

    async fn encode_image(&self, path: &Path) -> Result<Vec<f32>>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn TextEmbedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .encode(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

// ============ Disabled ============

pub struct DisabledTextEmbedder;

#[async_trait]
impl TextEmbedder for DisabledTextEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn encode(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

pub struct DisabledImageEmbedder;

#[async_trait]
impl ImageEmbedder for DisabledImageEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn encode_image(&self, _path: &Path) -> Result<Vec<f32>> {
        bail!("Image embedding provider is disabled")
    }
}

// ============ OpenAI ============

/// Calls `POST https://api.openai.com/v1/embeddings`. Requires `OPENAI_API_KEY`.
///
/// `dims` is sent as the `dimensions` parameter so the `text-embedding-3-*`
/// models return vectors matching the store schema.
pub struct OpenAiTextEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiTextEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            api_key,
            client,
        })
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_openai_response(&json)
    }
}

#[async_trait]
impl TextEmbedder for OpenAiTextEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.encode_batch(batch).await?);
        }
        Ok(out)
    }

    async fn health_check(&self) -> Result<()> {
        self.encode_batch(&["ping".to_string()]).await.map(|_| ())
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
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
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "clip-vit-b-32" => Ok(fastembed::EmbeddingModel::ClipVitB32),
        "bge-small-zh-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallZHV15),
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             clip-vit-b-32, bge-small-zh-v1.5, all-minilm-l6-v2, bge-small-en-v1.5, \
             bge-base-en-v1.5, multilingual-e5-small",
            other
        ),
    }
}

/// In-process text embedding. The model is loaded on first use (downloaded
/// from Hugging Face and cached) and reused for every later call.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalTextEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalTextEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "clip-vit-b-32".to_string());
        // Reject unknown names at startup rather than on first file.
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl TextEmbedder for LocalTextEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let model_name = self.model_name.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(config_to_fastembed_model(&model_name)?)
                        .with_show_download_progress(false),
                )
                .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(loaded);
            }
            let Some(model) = guard.as_mut() else {
                bail!("local embedding model unavailable");
            };
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// In-process CLIP image embedding (`ClipVitB32`, 512 dims).
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalImageEmbedder {
    model: Arc<std::sync::Mutex<Option<fastembed::ImageEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalImageEmbedder {
    pub fn new(config: &ImageEmbeddingConfig) -> Result<Self> {
        match config.model.as_deref() {
            None | Some("clip-vit-b-32") => {}
            Some(other) => bail!(
                "Unknown local image model: '{}'. Supported models: clip-vit-b-32",
                other
            ),
        }
        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl ImageEmbedder for LocalImageEmbedder {
    fn model_name(&self) -> &str {
        "clip-vit-b-32"
    }

    async fn encode_image(&self, path: &Path) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow::anyhow!("image embedding model lock poisoned"))?;
            if guard.is_none() {
                let loaded = fastembed::ImageEmbedding::try_new(
                    fastembed::ImageInitOptions::new(fastembed::ImageEmbeddingModel::ClipVitB32)
                        .with_show_download_progress(false),
                )
                .map_err(|e| anyhow::anyhow!("Failed to initialize image model: {}", e))?;
                *guard = Some(loaded);
            }
            let Some(model) = guard.as_mut() else {
                bail!("image embedding model unavailable");
            };
            model
                .embed(vec![path], None)
                .map_err(|e| anyhow::anyhow!("Image embedding failed: {}", e))?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("Empty image embedding response"))
        })
        .await?
    }
}

/// Build the configured text embedder.
pub fn create_text_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn TextEmbedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledTextEmbedder)),
        "openai" => Ok(Arc::new(OpenAiTextEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalTextEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Build the configured image embedder.
pub fn create_image_embedder(config: &ImageEmbeddingConfig) -> Result<Arc<dyn ImageEmbedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledImageEmbedder)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalImageEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local image embedding requires --features local-embeddings-fastembed"),
        other => bail!("Unknown image_embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverses [`vec_to_blob`]. Trailing bytes that do not form a full f32 are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
