use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub image_embedding: ImageEmbeddingConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub rasterizer: RasterizerConfig,
    #[serde(default)]
    pub entities: EntitiesConfig,
    #[serde(default)]
    pub sftp: Option<SftpConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// S3-compatible object store for original file bytes.
///
/// Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
/// optionally `AWS_SESSION_TOKEN`.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub endpoint_url: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    pub raw_bucket: String,
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_upload_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_extract_dir")]
    pub extract_dir: PathBuf,
    #[serde(default = "default_max_archive_depth")]
    pub max_archive_depth: u32,
    #[serde(default = "default_content_extensions")]
    pub content_extensions: Vec<String>,
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_file_size_mb: default_max_file_size_mb(),
            concurrency: default_concurrency(),
            temp_dir: default_temp_dir(),
            extract_dir: default_extract_dir(),
            max_archive_depth: default_max_archive_depth(),
            content_extensions: default_content_extensions(),
            image_extensions: default_image_extensions(),
            archive_extensions: default_archive_extensions(),
        }
    }
}

impl IngestConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn is_content(&self, ext: &str) -> bool {
        listed(&self.content_extensions, ext)
    }

    pub fn is_image(&self, ext: &str) -> bool {
        listed(&self.image_extensions, ext)
    }

    pub fn is_archive(&self, ext: &str) -> bool {
        listed(&self.archive_extensions, ext)
    }
}

/// Configured entries may be written `PDF` or `.pdf`.
fn listed(extensions: &[String], ext: &str) -> bool {
    extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_max_file_size_mb() -> u64 {
    100
}
fn default_concurrency() -> usize {
    3
}
fn default_temp_dir() -> PathBuf {
    PathBuf::from("./data/tmp/uploads")
}
fn default_extract_dir() -> PathBuf {
    PathBuf::from("./data/tmp/extracted")
}
fn default_max_archive_depth() -> u32 {
    16
}
fn default_content_extensions() -> Vec<String> {
    [
        "txt", "md", "docx", "pdf", "pptx", "log", "csv", "xlsx", "xls", "py", "sh", "js", "json",
        "sql", "mp3", "wav", "mp4", "avi", "mov", "m4a",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "bmp", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_archive_extensions() -> Vec<String> {
    ["zip", "tar", "gz", "tgz"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    512
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageEmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for ImageEmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
        }
    }
}

/// Speech-to-text for audio and video files.
///
/// The `openai` provider talks to any server exposing the OpenAI
/// `/v1/audio/transcriptions` endpoint (including self-hosted Whisper).
#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_transcription_url")]
    pub url: String,
    #[serde(default = "default_transcription_model")]
    pub model: String,
    #[serde(default = "default_transcription_timeout")]
    pub timeout_secs: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_transcription_url(),
            model: default_transcription_model(),
            timeout_secs: default_transcription_timeout(),
        }
    }
}

fn default_transcription_url() -> String {
    "http://127.0.0.1:8000/v1/audio/transcriptions".to_string()
}
fn default_transcription_model() -> String {
    "whisper-1".to_string()
}
fn default_transcription_timeout() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RasterizerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
}

impl Default for RasterizerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            dpi: default_dpi(),
        }
    }
}

fn default_dpi() -> u32 {
    100
}

/// Optional LLM entity extraction. The API key is read from `LAKE_ENTITIES_API_KEY`.
#[derive(Debug, Deserialize, Clone)]
pub struct EntitiesConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_entities_base_url")]
    pub base_url: String,
    #[serde(default = "default_entities_model")]
    pub model: String,
    #[serde(default = "default_entities_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_entities_timeout")]
    pub timeout_secs: u64,
}

impl Default for EntitiesConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_entities_base_url(),
            model: default_entities_model(),
            max_chars: default_entities_max_chars(),
            timeout_secs: default_entities_timeout(),
        }
    }
}

fn default_entities_base_url() -> String {
    "https://api.deepseek.com".to_string()
}
fn default_entities_model() -> String {
    "deepseek-chat".to_string()
}
fn default_entities_max_chars() -> usize {
    3000
}
fn default_entities_timeout() -> u64 {
    30
}

/// Defaults for `lake sftp`. The password is never read from the file; use
/// `--password` or `LAKE_SFTP_PASSWORD`.
#[derive(Debug, Deserialize, Clone)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
}

fn default_sftp_port() -> u16 {
    22
}
fn default_remote_path() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate ingest
    if config.ingest.chunk_size == 0 {
        anyhow::bail!("ingest.chunk_size must be > 0");
    }
    if config.ingest.chunk_overlap >= config.ingest.chunk_size {
        anyhow::bail!("ingest.chunk_overlap must be smaller than ingest.chunk_size");
    }
    if config.ingest.concurrency == 0 {
        anyhow::bail!("ingest.concurrency must be >= 1");
    }

    // Validate embedding
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or local.",
            other
        ),
    }
    match config.image_embedding.provider.as_str() {
        "disabled" | "local" => {}
        other => anyhow::bail!(
            "Unknown image_embedding provider: '{}'. Must be disabled or local.",
            other
        ),
    }
    match config.transcription.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown transcription provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    match config.rasterizer.provider.as_str() {
        "disabled" | "pdftoppm" => {}
        other => anyhow::bail!(
            "Unknown rasterizer provider: '{}'. Must be disabled or pdftoppm.",
            other
        ),
    }
    match config.entities.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown entities provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown logging.format: '{}'. Must be text or json.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/lake.sqlite\"\n").unwrap();
        assert_eq!(config.ingest.chunk_size, 500);
        assert_eq!(config.ingest.chunk_overlap, 50);
        assert_eq!(config.ingest.concurrency, 3);
        assert_eq!(config.ingest.max_file_size_bytes(), 100 * 1024 * 1024);
        assert!(config.ingest.is_content("pdf"));
        assert!(config.ingest.is_image("webp"));
        assert!(config.ingest.is_archive("tgz"));
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.embedding.dims, 512);
        assert!(config.storage.is_none());
        assert!(config.sftp.is_none());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let err = parse("[db]\npath = \"x\"\n[ingest]\nchunk_size = 50\nchunk_overlap = 50\n")
            .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[ingest]\nconcurrency = 0\n").is_err());
    }

    #[test]
    fn sftp_section_defaults() {
        let config = parse(
            "[db]\npath = \"x\"\n[sftp]\nhost = \"files.example\"\nusername = \"ingest\"\n",
        )
        .unwrap();
        let sftp = config.sftp.unwrap();
        assert_eq!(sftp.port, 22);
        assert_eq!(sftp.remote_path, ".");
    }

    #[test]
    fn example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/lake.example.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.rasterizer.provider, "pdftoppm");
        assert_eq!(config.ingest.max_archive_depth, 16);
    }

    #[test]
    fn extension_lists_ignore_case_and_dot() {
        let config = parse(
            "[db]\npath = \"x\"\n[ingest]\ncontent_extensions = [\"PDF\", \".Md\"]\n",
        )
        .unwrap();
        assert!(config.ingest.is_content("pdf"));
        assert!(config.ingest.is_content("md"));
        assert!(!config.ingest.is_content("txt"));
    }

    #[test]
    fn huge_size_ceiling_saturates() {
        let config = parse(&format!(
            "[db]\npath = \"x\"\n[ingest]\nmax_file_size_mb = {}\n",
            i64::MAX
        ))
        .unwrap();
        assert_eq!(config.ingest.max_file_size_bytes(), u64::MAX);
    }
}
