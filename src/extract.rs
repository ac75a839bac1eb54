//! Per-format text extraction.
//!
//! [`ExtractorRegistry`] maps a [`ContentKind`] to an [`ExtractionStrategy`].
//! [`ExtractorRegistry::extract`] never fails: unsupported formats and
//! strategy errors come back as empty text plus a diagnostic, and the
//! pipeline decides what an empty result means.
//!
//! CPU-bound parsers (PDF, OOXML, spreadsheets) run on the blocking pool.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use calamine::Reader;

use crate::error::ExtractError;
use crate::media::Transcriber;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum rows read per spreadsheet sheet.
const MAX_ROWS_PER_SHEET: usize = 100_000;

/// Extraction family an extension belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    PlainText,
    OfficeDocument,
    Spreadsheet,
    Presentation,
    Pdf,
    AudioVideo,
}

impl ContentKind {
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext {
            "txt" | "md" | "py" | "json" | "log" | "sh" | "js" | "java" | "sql" | "xml"
            | "yaml" | "yml" | "ini" => Some(ContentKind::PlainText),
            "docx" => Some(ContentKind::OfficeDocument),
            "csv" | "xlsx" | "xls" => Some(ContentKind::Spreadsheet),
            "pptx" => Some(ContentKind::Presentation),
            "pdf" => Some(ContentKind::Pdf),
            "mp3" | "wav" | "m4a" | "flac" | "ogg" | "mp4" | "avi" | "mov" | "mkv" | "webm" => {
                Some(ContentKind::AudioVideo)
            }
            _ => None,
        }
    }
}

/// Text pulled from a file, plus why it is empty when it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub diagnostic: Option<String>,
}

impl Extraction {
    fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            diagnostic: Some(diagnostic.into()),
        }
    }

    /// True when the text has any non-whitespace content.
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    async fn extract(&self, path: &Path, extension: &str) -> Result<String, ExtractError>;
}

/// Run a synchronous parser over `path` on the blocking pool.
async fn blocking<F>(path: &Path, parse: F) -> Result<String, ExtractError>
where
    F: FnOnce(PathBuf) -> Result<String, ExtractError> + Send + 'static,
{
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || parse(path))
        .await
        .map_err(|e| ExtractError::Backend(format!("extraction task failed: {}", e)))?
}

pub struct PlainTextStrategy;

#[async_trait]
impl ExtractionStrategy for PlainTextStrategy {
    async fn extract(&self, path: &Path, _extension: &str) -> Result<String, ExtractError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub struct PdfStrategy;

#[async_trait]
impl ExtractionStrategy for PdfStrategy {
    async fn extract(&self, path: &Path, _extension: &str) -> Result<String, ExtractError> {
        blocking(path, |path| {
            let bytes = std::fs::read(&path)?;
            pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| ExtractError::Malformed(format!("PDF: {}", e)))
        })
        .await
    }
}

pub struct OfficeDocumentStrategy;

#[async_trait]
impl ExtractionStrategy for OfficeDocumentStrategy {
    async fn extract(&self, path: &Path, _extension: &str) -> Result<String, ExtractError> {
        blocking(path, |path| extract_docx(&std::fs::read(&path)?)).await
    }
}

pub struct PresentationStrategy;

#[async_trait]
impl ExtractionStrategy for PresentationStrategy {
    async fn extract(&self, path: &Path, _extension: &str) -> Result<String, ExtractError> {
        blocking(path, |path| extract_pptx(&std::fs::read(&path)?)).await
    }
}

/// `csv` via the csv crate; `xlsx`/`xls` via calamine.
pub struct SpreadsheetStrategy;

#[async_trait]
impl ExtractionStrategy for SpreadsheetStrategy {
    async fn extract(&self, path: &Path, extension: &str) -> Result<String, ExtractError> {
        if extension == "csv" {
            blocking(path, |path| extract_csv(&path)).await
        } else {
            blocking(path, |path| extract_workbook(&path)).await
        }
    }
}

/// Audio and video go through the injected transcription capability.
pub struct TranscriptionStrategy {
    transcriber: Arc<dyn Transcriber>,
}

impl TranscriptionStrategy {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }
}

#[async_trait]
impl ExtractionStrategy for TranscriptionStrategy {
    async fn extract(&self, path: &Path, _extension: &str) -> Result<String, ExtractError> {
        Ok(self.transcriber.transcribe(path).await?)
    }
}

/// Category-keyed strategy table.
pub struct ExtractorRegistry {
    strategies: HashMap<ContentKind, Arc<dyn ExtractionStrategy>>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// All built-in strategies, with audio/video routed to `transcriber`.
    pub fn with_defaults(transcriber: Arc<dyn Transcriber>) -> Self {
        let mut registry = Self::empty();
        registry.register(ContentKind::PlainText, Arc::new(PlainTextStrategy));
        registry.register(ContentKind::OfficeDocument, Arc::new(OfficeDocumentStrategy));
        registry.register(ContentKind::Spreadsheet, Arc::new(SpreadsheetStrategy));
        registry.register(ContentKind::Presentation, Arc::new(PresentationStrategy));
        registry.register(ContentKind::Pdf, Arc::new(PdfStrategy));
        registry.register(
            ContentKind::AudioVideo,
            Arc::new(TranscriptionStrategy::new(transcriber)),
        );
        registry
    }

    pub fn register(&mut self, kind: ContentKind, strategy: Arc<dyn ExtractionStrategy>) {
        self.strategies.insert(kind, strategy);
    }

    pub async fn extract(&self, path: &Path, extension: &str) -> Extraction {
        let Some(kind) = ContentKind::for_extension(extension) else {
            return Extraction::failed(format!("unsupported extension: {}", extension));
        };
        let Some(strategy) = self.strategies.get(&kind) else {
            return Extraction::failed(format!("no extractor registered for {:?}", kind));
        };
        match strategy.extract(path, extension).await {
            Ok(text) => {
                let diagnostic = text
                    .trim()
                    .is_empty()
                    .then(|| "extraction produced no text".to_string());
                Extraction { text, diagnostic }
            }
            Err(e) => Extraction::failed(e.to_string()),
        }
    }
}

fn extract_csv(path: &Path) -> Result<String, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| ExtractError::Malformed(format!("CSV: {}", e)))?;
    let mut out = String::new();
    for record in reader.records().take(MAX_ROWS_PER_SHEET) {
        let record = record.map_err(|e| ExtractError::Malformed(format!("CSV: {}", e)))?;
        let line: Vec<&str> = record.iter().collect();
        out.push_str(&line.join(", "));
        out.push('\n');
    }
    Ok(out)
}

fn extract_workbook(path: &Path) -> Result<String, ExtractError> {
    let mut workbook = calamine::open_workbook_auto(path)
        .map_err(|e| ExtractError::Malformed(format!("workbook: {}", e)))?;
    let mut out = String::new();
    for name in workbook.sheet_names().to_owned() {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                tracing::debug!(sheet = %name, error = %e, "skipping unreadable sheet");
                continue;
            }
        };
        out.push_str(&format!("## {}\n", name));
        for row in range.rows().take(MAX_ROWS_PER_SHEET) {
            let cells: Vec<String> = row.iter().map(|cell| cell.to_string()).collect();
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
    }
    Ok(out)
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Malformed(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Malformed(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn open_ooxml(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Malformed(format!("OOXML: {}", e)))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_ooxml(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml, b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_ooxml(bytes)?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    let mut out = String::new();
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = collect_text_runs(&xml, b"p")?;
        if !text.trim().is_empty() {
            out.push_str(text.trim_end());
            out.push_str("\n\n");
        }
    }
    Ok(out)
}

/// Concatenate every `<*:t>` text run, ending a line at each closing
/// `block` element (`w:p` in Word, `a:p` in DrawingML).
fn collect_text_runs(xml: &[u8], block: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == block && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Malformed(format!("OOXML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
