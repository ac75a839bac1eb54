//! Audio transcription and PDF page rasterization.
//!
//! Both capabilities are optional. Their `Disabled*` variants fail every
//! call, which the extractor and pipeline treat as a recoverable per-file
//! degradation.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::config::{RasterizerConfig, TranscriptionConfig};

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, path: &Path) -> Result<String>;
}

pub struct DisabledTranscriber;

#[async_trait]
impl Transcriber for DisabledTranscriber {
    async fn transcribe(&self, _path: &Path) -> Result<String> {
        bail!("Transcription provider is disabled")
    }
}

/// Posts the file as multipart form data to an OpenAI-compatible
/// `/v1/audio/transcriptions` endpoint and returns the `text` field.
///
/// `OPENAI_API_KEY` is sent as a bearer token when set; self-hosted
/// servers usually do not need it.
pub struct HttpTranscriber {
    url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(config: &TranscriptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            client,
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, path: &Path) -> Result<String> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part(
                "file",
                reqwest::multipart::Part::bytes(data).file_name(filename),
            );

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Transcription API error {}: {}", status, body);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid transcription response: missing text"))
    }
}

/// Page images produced by a [`PageRasterizer`]. The backing directory is
/// removed when this value is dropped.
pub struct RasterizedPages {
    _dir: TempDir,
    pub pages: Vec<PathBuf>,
}

impl RasterizedPages {
    pub fn new(dir: TempDir, pages: Vec<PathBuf>) -> Self {
        Self { _dir: dir, pages }
    }
}

#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Render every page of `pdf` to an image, in page order.
    async fn rasterize(&self, pdf: &Path) -> Result<RasterizedPages>;
}

pub struct DisabledRasterizer;

#[async_trait]
impl PageRasterizer for DisabledRasterizer {
    async fn rasterize(&self, _pdf: &Path) -> Result<RasterizedPages> {
        bail!("PDF rasterizer is disabled")
    }
}

/// Shells out to poppler's `pdftoppm`.
pub struct PdftoppmRasterizer {
    dpi: u32,
}

impl PdftoppmRasterizer {
    pub fn new(config: &RasterizerConfig) -> Self {
        Self { dpi: config.dpi }
    }

    /// `pdftoppm -v` exits non-zero on some builds; spawning is enough.
    pub async fn is_available() -> bool {
        tokio::process::Command::new("pdftoppm")
            .arg("-v")
            .output()
            .await
            .is_ok()
    }
}

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn rasterize(&self, pdf: &Path) -> Result<RasterizedPages> {
        let dir = tempfile::Builder::new()
            .prefix("lake-pages-")
            .tempdir()
            .context("Failed to create page directory")?;

        let output = tokio::process::Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(pdf)
            .arg(dir.path().join("page"))
            .output()
            .await
            .context("Failed to run pdftoppm")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("pdftoppm error: {}", stderr.trim());
        }

        let pages = collect_pages(dir.path())?;
        if pages.is_empty() {
            bail!("pdftoppm produced no images");
        }
        Ok(RasterizedPages::new(dir, pages))
    }
}

/// PNG files in `dir`, sorted. pdftoppm zero-pads page numbers, so lexical
/// order is page order.
fn collect_pages(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
        .collect();
    pages.sort();
    Ok(pages)
}

pub fn create_transcriber(config: &TranscriptionConfig) -> Result<Arc<dyn Transcriber>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledTranscriber)),
        "openai" => Ok(Arc::new(HttpTranscriber::new(config)?)),
        other => bail!("Unknown transcription provider: {}", other),
    }
}

pub fn create_rasterizer(config: &RasterizerConfig) -> Result<Arc<dyn PageRasterizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledRasterizer)),
        "pdftoppm" => Ok(Arc::new(PdftoppmRasterizer::new(config))),
        other => bail!("Unknown rasterizer provider: {}", other),
    }
}
