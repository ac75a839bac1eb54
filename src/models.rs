//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent the jobs that flow into the orchestrator, the rows
//! written to the three data stores, and the per-job and per-batch results
//! reported back to callers.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Lower-case hex SHA-256 digest of a file's full byte content.
///
/// The dedup key and the only join key between the raw-file, text-chunk and
/// image-vector stores and the metadata registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an already-computed hex digest.
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where an [`IngestionJob`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOrigin {
    /// Submitted directly by a source adapter.
    SingleFile,
    /// Produced by expanding an archive. `depth` is 1 for members of a
    /// top-level archive, 2 for members of an archive nested inside it, etc.
    ArchiveMember { parent: String, depth: u32 },
}

/// A single file to run through the pipeline. Consumed exactly once, never persisted.
#[derive(Debug, Clone)]
pub struct IngestionJob {
    pub source_path: PathBuf,
    /// The user-facing file name; the extension is resolved from this, not
    /// from `source_path` (staged temp files carry random prefixes).
    pub original_name: String,
    pub origin: JobOrigin,
}

impl IngestionJob {
    pub fn new(source_path: impl Into<PathBuf>, original_name: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            original_name: original_name.into(),
            origin: JobOrigin::SingleFile,
        }
    }

    /// Build a job for a file that was unpacked from `parent`.
    pub fn archive_member(
        source_path: impl Into<PathBuf>,
        original_name: impl Into<String>,
        parent: impl Into<String>,
        depth: u32,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            original_name: original_name.into(),
            origin: JobOrigin::ArchiveMember {
                parent: parent.into(),
                depth,
            },
        }
    }

    /// Nesting depth: 0 for a top-level file.
    pub fn depth(&self) -> u32 {
        match &self.origin {
            JobOrigin::SingleFile => 0,
            JobOrigin::ArchiveMember { depth, .. } => *depth,
        }
    }

    /// Lower-cased extension of the declared name, or `""` when there is none.
    pub fn extension(&self) -> String {
        extension_of(&self.original_name)
    }
}

/// Lower-cased text after the last `.` in `name`, or `""` if the name has no
/// extension (including dotfiles such as `.env`).
pub fn extension_of(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    match base.rfind('.') {
        Some(0) | None => String::new(),
        Some(pos) => base[pos + 1..].to_lowercase(),
    }
}

/// Coarse file category, used for object-store key prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileCategory {
    Image,
    Audio,
    Video,
    Text,
    Archive,
    Other,
}

impl FileCategory {
    pub fn for_extension(ext: &str) -> Self {
        match ext {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" => FileCategory::Image,
            "mp3" | "wav" | "m4a" | "flac" | "ogg" => FileCategory::Audio,
            "mp4" | "webm" | "mov" | "avi" | "mkv" => FileCategory::Video,
            "pdf" | "docx" | "pptx" | "txt" | "md" | "csv" | "xlsx" | "xls" | "json" | "log"
            | "sql" | "xml" | "yaml" | "ini" | "py" | "js" | "sh" => FileCategory::Text,
            "zip" | "tar" | "gz" | "tgz" => FileCategory::Archive,
            _ => FileCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Image => "image",
            FileCategory::Audio => "audio",
            FileCategory::Video => "video",
            FileCategory::Text => "text",
            FileCategory::Archive => "archive",
            FileCategory::Other => "other",
        }
    }
}

/// The whole-file record used for preview and download.
///
/// One logical row per hash. `bytes` is empty for files above the size
/// ceiling; `full_text` is filled in after text extraction succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFileRecord {
    pub hash: ContentHash,
    pub name: String,
    pub extension: String,
    pub source_uri: String,
    pub bytes: Vec<u8>,
    pub full_text: String,
}

/// One embedded text chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunkRecord {
    pub id: String,
    pub hash: ContentHash,
    pub vector: Vec<f32>,
    pub text: String,
    pub source_uri: String,
    pub name: String,
    pub extension: String,
}

/// One embedded image: a standalone image file or a rasterized PDF page.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageVectorRecord {
    pub id: String,
    pub hash: ContentHash,
    pub vector: Vec<f32>,
    pub source_uri: String,
    pub name: String,
    /// `"image_file"` for image files, `"Page N"` (1-based) for PDF pages.
    pub meta_info: String,
}

/// Rows that carry an embedding and belong to a content hash.
pub trait VectorRecord: Clone + Send + Sync + 'static {
    fn hash(&self) -> &ContentHash;
    fn vector(&self) -> &[f32];
    /// Extension or meta label used by search filters.
    fn label(&self) -> &str;
}

impl VectorRecord for TextChunkRecord {
    fn hash(&self) -> &ContentHash {
        &self.hash
    }
    fn vector(&self) -> &[f32] {
        &self.vector
    }
    fn label(&self) -> &str {
        &self.extension
    }
}

impl VectorRecord for ImageVectorRecord {
    fn hash(&self) -> &ContentHash {
        &self.hash
    }
    fn vector(&self) -> &[f32] {
        &self.vector
    }
    fn label(&self) -> &str {
        &self.meta_info
    }
}

/// Outcome class of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ok,
    Skipped,
    Error,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Ok => write!(f, "ok"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

/// Result of one [`IngestionJob`].
///
/// `record_count` counts files that produced searchable records: 1 for an
/// ok leaf file, the sum over descendants for an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub message: String,
    pub record_count: u64,
    pub text_chunks: u64,
    pub image_vectors: u64,
}

impl TaskResult {
    pub fn ok(message: impl Into<String>, record_count: u64) -> Self {
        Self {
            status: TaskStatus::Ok,
            message: message.into(),
            record_count,
            text_chunks: 0,
            image_vectors: 0,
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Skipped,
            message: message.into(),
            record_count: 0,
            text_chunks: 0,
            image_vectors: 0,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            message: message.into(),
            record_count: 0,
            text_chunks: 0,
            image_vectors: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == TaskStatus::Ok
    }
}

/// Per-run statistics persisted to the metadata registry for dashboarding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStat {
    /// `"batch"` or `"sftp"`.
    pub task_type: String,
    pub file_count: u64,
    pub success_count: u64,
    pub duration_seconds: f64,
    /// Unix epoch seconds.
    pub timestamp: i64,
}

/// A named entity extracted from a file's text by the optional side-call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntity {
    pub name: String,
    pub entity_type: String,
}
