//! The per-file commit algorithm.
//!
//! [`Pipeline::process`] takes one [`IngestionJob`] through hashing,
//! registration, durable upload, the raw-file write and then whichever of
//! text chunking, image embedding and PDF page rasterization apply to its
//! extension. Archives are unpacked and their members fed back through the
//! same routine.
//!
//! Only three failures make a job an `error`: the hash cannot be computed,
//! the file cannot be read, or the raw record cannot be written. Everything
//! after the raw write degrades the job (logged, possibly `skipped`) but
//! never fails it. Work on one content hash is serialized through
//! [`crate::context::HashLocks`] so two copies of the same bytes cannot
//! interleave their delete-then-insert sequences.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive;
use crate::chunk::TextSplitter;
use crate::context::IngestContext;
use crate::error::IngestError;
use crate::hash::compute_hash;
use crate::models::{
    ContentHash, FileCategory, ImageVectorRecord, IngestionJob, RawFileRecord, TaskResult,
    TaskStatus, TextChunkRecord,
};
use crate::object_store::{local_uri, object_key};

/// `meta_info` of the vector for a standalone image file.
pub const IMAGE_FILE_META: &str = "image_file";

type JobFuture<'a> = Pin<Box<dyn Future<Output = TaskResult> + Send + 'a>>;

pub struct Pipeline {
    ctx: Arc<IngestContext>,
    splitter: TextSplitter,
}

/// Outcome of [`Pipeline::delete_by_hash`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub text_chunks: u64,
    pub image_vectors: u64,
    pub raw_files: u64,
    /// `(store, error)` for every delete that failed.
    pub failures: Vec<(String, String)>,
}

impl DeleteReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_stores(&self) -> Vec<&str> {
        self.failures.iter().map(|(s, _)| s.as_str()).collect()
    }
}

/// What steps 6 to 8 produced for one file.
#[derive(Default)]
struct Indexed {
    text_chunks: u64,
    image_vectors: u64,
    diagnostic: Option<String>,
}

impl Pipeline {
    pub fn new(ctx: Arc<IngestContext>) -> Self {
        let splitter = TextSplitter::new(ctx.settings.chunk_size, ctx.settings.chunk_overlap);
        Self { ctx, splitter }
    }

    pub fn context(&self) -> &Arc<IngestContext> {
        &self.ctx
    }

    /// Run one job to completion. Never returns `Err`: every failure is
    /// classified into the returned [`TaskResult`].
    pub async fn process(&self, job: IngestionJob) -> TaskResult {
        self.process_job(job).await
    }

    /// [`Pipeline::process`] on its own task, so a panic anywhere in the job
    /// becomes an `error` result instead of unwinding into the caller.
    pub async fn process_isolated(self: &Arc<Self>, job: IngestionJob) -> TaskResult {
        let pipeline = Arc::clone(self);
        let name = job.original_name.clone();
        match tokio::spawn(async move { pipeline.process(job).await }).await {
            Ok(result) => result,
            Err(e) => {
                let message = join_error_message(e);
                warn!(name = %name, error = %message, "job aborted");
                TaskResult::error(format!("{}: {}", name, message))
            }
        }
    }

    // Boxed so archive members can recurse through it.
    fn process_job(&self, job: IngestionJob) -> JobFuture<'_> {
        Box::pin(async move {
            let ext = job.extension();
            if self.ctx.settings.is_archive(&ext) {
                return self.process_archive(&job).await;
            }
            match self.process_file(&job, &ext).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(name = %job.original_name, error = %e, "job failed");
                    TaskResult::error(e.to_string())
                }
            }
        })
    }

    async fn process_archive(&self, job: &IngestionJob) -> TaskResult {
        let name = &job.original_name;
        let depth = job.depth();
        let limit = self.ctx.settings.max_archive_depth;
        if depth >= limit {
            let e = IngestError::DepthExceeded {
                name: name.clone(),
                limit,
            };
            warn!(name = %name, depth, "archive not expanded");
            return TaskResult::error(e.to_string());
        }

        let workspace =
            match archive::unpack_async(&job.source_path, name, &self.ctx.settings.extract_dir)
                .await
            {
                Ok(ws) => ws,
                Err(e) => {
                    let e = IngestError::Archive {
                        name: name.clone(),
                        reason: format!("{:#}", e),
                    };
                    warn!(name = %name, error = %e, "archive unpack failed");
                    return TaskResult::error(e.to_string());
                }
            };

        let members = workspace.members();
        info!(name = %name, depth, members = members.len(), "expanding archive");

        let (mut ok, mut skipped, mut failed) = (0u64, 0u64, 0u64);
        let mut records = 0u64;
        let mut text_chunks = 0u64;
        let mut image_vectors = 0u64;
        for member in members {
            let child = IngestionJob::archive_member(member.path, member.name, name, depth + 1);
            let result = self.process_job(child).await;
            match result.status {
                TaskStatus::Ok => ok += 1,
                TaskStatus::Skipped => skipped += 1,
                TaskStatus::Error => failed += 1,
            }
            records += result.record_count;
            text_chunks += result.text_chunks;
            image_vectors += result.image_vectors;
        }
        drop(workspace);

        let message = format!(
            "{}: {} files indexed ({} ok, {} skipped, {} failed)",
            name, records, ok, skipped, failed
        );
        if records > 0 {
            TaskResult {
                text_chunks,
                image_vectors,
                ..TaskResult::ok(message, records)
            }
        } else {
            TaskResult::skipped(message)
        }
    }

    async fn process_file(&self, job: &IngestionJob, ext: &str) -> Result<TaskResult, IngestError> {
        let ctx = &self.ctx;
        let name = job.original_name.as_str();
        let path = job.source_path.as_path();

        let hash = compute_hash(path).await.map_err(|e| IngestError::Hash {
            path: path.display().to_string(),
            source: e,
        })?;
        let _guard = ctx.hash_locks.lock(&hash).await;

        let registered = match ctx.registry.exists(&hash).await {
            Ok(found) => found,
            Err(e) => {
                warn!(hash = %hash.short(), error = %e, "registry lookup failed; treating as re-ingestion");
                true
            }
        };
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| IngestError::Read {
                path: path.display().to_string(),
                source: e,
            })?
            .len();
        if let Err(e) = ctx.registry.register(&hash, name, size).await {
            warn!(hash = %hash.short(), error = %e, "registry insert failed");
        }
        debug!(hash = %hash.short(), name = %name, size, registered, "hashed");

        let source_uri = self.durable_uri(path, name, ext).await;

        let bytes = if size > ctx.settings.max_file_size_bytes() {
            info!(name = %name, size, "over size ceiling; storing metadata only");
            Vec::new()
        } else {
            let bytes = tokio::fs::read(path).await.map_err(|e| IngestError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            if bytes.is_empty() {
                return Err(IngestError::EmptyRead(name.to_string()));
            }
            bytes
        };

        // Cleared whatever the registry says; the two can drift apart.
        let overwrite = match ctx.raw_files.delete_by_hash(&hash).await {
            Ok(removed) => registered || removed > 0,
            Err(e) => {
                warn!(hash = %hash.short(), error = %e, "failed to delete previous raw record");
                registered
            }
        };
        if overwrite && !registered {
            info!(hash = %hash.short(), name = %name, "raw record without registry entry; replacing");
        }
        let raw = RawFileRecord {
            hash: hash.clone(),
            name: name.to_string(),
            extension: ext.to_string(),
            source_uri: source_uri.clone(),
            bytes,
            full_text: String::new(),
        };
        ctx.raw_files
            .add(&raw)
            .await
            .map_err(|e| IngestError::RawWrite {
                hash: hash.to_string(),
                reason: format!("{:#}", e),
            })?;
        drop(raw);

        let mut indexed = Indexed::default();
        if ctx.settings.is_content(ext) {
            self.index_text(&mut indexed, path, name, ext, &hash, &source_uri, overwrite)
                .await;
        }
        if ctx.settings.is_image(ext) {
            self.index_image(&mut indexed, path, name, &hash, &source_uri, overwrite)
                .await;
        }
        if ext == "pdf" {
            self.index_pdf_pages(&mut indexed, path, name, &hash, &source_uri, overwrite)
                .await;
        }

        if indexed.text_chunks + indexed.image_vectors > 0 {
            info!(
                hash = %hash.short(),
                name = %name,
                chunks = indexed.text_chunks,
                images = indexed.image_vectors,
                "indexed"
            );
            Ok(TaskResult {
                text_chunks: indexed.text_chunks,
                image_vectors: indexed.image_vectors,
                ..TaskResult::ok(
                    format!(
                        "{}: {} text chunks, {} image vectors",
                        name, indexed.text_chunks, indexed.image_vectors
                    ),
                    1,
                )
            })
        } else {
            let reason = if ctx.settings.is_content(ext) || ctx.settings.is_image(ext) {
                indexed
                    .diagnostic
                    .unwrap_or_else(|| "no searchable content".to_string())
            } else if ext.is_empty() {
                "no extension".to_string()
            } else {
                format!("unsupported extension .{}", ext)
            };
            info!(hash = %hash.short(), name = %name, reason = %reason, "stored without index");
            Ok(TaskResult::skipped(format!("{}: {}", name, reason)))
        }
    }

    /// Upload to the raw bucket, or fall back to a `local://` reference.
    async fn durable_uri(&self, path: &Path, name: &str, ext: &str) -> String {
        let Some(bucket) = self.ctx.object_store.raw_bucket() else {
            return local_uri(name);
        };
        let key = object_key(name, FileCategory::for_extension(ext), Utc::now());
        match self.ctx.object_store.put_file(bucket, &key, path).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(name = %name, error = %format!("{:#}", e), "upload failed; using local reference");
                local_uri(name)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn index_text(
        &self,
        indexed: &mut Indexed,
        path: &Path,
        name: &str,
        ext: &str,
        hash: &ContentHash,
        source_uri: &str,
        overwrite: bool,
    ) {
        let ctx = &self.ctx;
        let extraction = ctx.extractors.extract(path, ext).await;
        if !extraction.has_text() {
            debug!(name = %name, diagnostic = ?extraction.diagnostic, "no text extracted");
            indexed.diagnostic = extraction
                .diagnostic
                .or_else(|| Some("no text extracted".to_string()));
            return;
        }

        if overwrite {
            if let Err(e) = ctx.text_chunks.delete_by_hash(hash).await {
                warn!(hash = %hash.short(), error = %e, "failed to delete previous chunks");
            }
        }

        let chunks = self.splitter.split(&extraction.text);
        match ctx.text_embedder.encode(&chunks).await {
            Ok(vectors) if vectors.len() == chunks.len() => {
                let rows: Vec<TextChunkRecord> = chunks
                    .into_iter()
                    .zip(vectors)
                    .map(|(text, vector)| TextChunkRecord {
                        id: Uuid::new_v4().to_string(),
                        hash: hash.clone(),
                        vector,
                        text,
                        source_uri: source_uri.to_string(),
                        name: name.to_string(),
                        extension: ext.to_string(),
                    })
                    .collect();
                match ctx.text_chunks.add(&rows).await {
                    Ok(()) => indexed.text_chunks = rows.len() as u64,
                    Err(e) => {
                        warn!(hash = %hash.short(), error = %e, "chunk write failed");
                        indexed.diagnostic = Some(format!("chunk write failed: {:#}", e));
                    }
                }
            }
            Ok(vectors) => {
                warn!(
                    name = %name,
                    expected = chunks.len(),
                    got = vectors.len(),
                    "embedder returned wrong number of vectors"
                );
                indexed.diagnostic = Some("embedding count mismatch".to_string());
            }
            Err(e) => {
                warn!(name = %name, error = %format!("{:#}", e), "text embedding failed");
                indexed.diagnostic = Some(format!("text embedding failed: {:#}", e));
            }
        }

        if let Err(e) = ctx.raw_files.update_full_text(hash, &extraction.text).await {
            warn!(hash = %hash.short(), error = %e, "failed to store full text");
        }

        if indexed.text_chunks > 0 {
            self.record_entities(hash, &extraction.text).await;
        }
    }

    async fn record_entities(&self, hash: &ContentHash, text: &str) {
        let Some(ref extractor) = self.ctx.entities else {
            return;
        };
        match extractor.extract(text).await {
            Ok(entities) => {
                if let Err(e) = self.ctx.registry.replace_entities(hash, &entities).await {
                    warn!(hash = %hash.short(), error = %e, "failed to store entities");
                } else {
                    debug!(hash = %hash.short(), count = entities.len(), "entities recorded");
                }
            }
            Err(e) => warn!(hash = %hash.short(), error = %format!("{:#}", e), "entity extraction failed"),
        }
    }

    async fn index_image(
        &self,
        indexed: &mut Indexed,
        path: &Path,
        name: &str,
        hash: &ContentHash,
        source_uri: &str,
        overwrite: bool,
    ) {
        let ctx = &self.ctx;
        if overwrite {
            if let Err(e) = ctx.image_vectors.delete_by_hash(hash).await {
                warn!(hash = %hash.short(), error = %e, "failed to delete previous image vectors");
            }
        }
        let vector = match ctx.image_embedder.encode_image(path).await {
            Ok(v) => v,
            Err(e) => {
                warn!(name = %name, error = %format!("{:#}", e), "image embedding failed");
                indexed.diagnostic = Some(format!("image embedding failed: {:#}", e));
                return;
            }
        };
        let row = ImageVectorRecord {
            id: Uuid::new_v4().to_string(),
            hash: hash.clone(),
            vector,
            source_uri: source_uri.to_string(),
            name: name.to_string(),
            meta_info: IMAGE_FILE_META.to_string(),
        };
        match ctx.image_vectors.add(std::slice::from_ref(&row)).await {
            Ok(()) => indexed.image_vectors += 1,
            Err(e) => warn!(hash = %hash.short(), error = %e, "image vector write failed"),
        }
    }

    async fn index_pdf_pages(
        &self,
        indexed: &mut Indexed,
        path: &Path,
        name: &str,
        hash: &ContentHash,
        source_uri: &str,
        overwrite: bool,
    ) {
        let ctx = &self.ctx;
        if overwrite {
            if let Err(e) = ctx.image_vectors.delete_by_hash(hash).await {
                warn!(hash = %hash.short(), error = %e, "failed to delete previous page vectors");
            }
        }
        let pages = match ctx.rasterizer.rasterize(path).await {
            Ok(pages) => pages,
            Err(e) => {
                debug!(name = %name, error = %format!("{:#}", e), "pdf pages not rasterized");
                return;
            }
        };

        let mut rows = Vec::with_capacity(pages.pages.len());
        for (i, page) in pages.pages.iter().enumerate() {
            match ctx.image_embedder.encode_image(page).await {
                Ok(vector) => rows.push(ImageVectorRecord {
                    id: Uuid::new_v4().to_string(),
                    hash: hash.clone(),
                    vector,
                    source_uri: source_uri.to_string(),
                    name: name.to_string(),
                    meta_info: format!("Page {}", i + 1),
                }),
                Err(e) => {
                    warn!(name = %name, page = i + 1, error = %format!("{:#}", e), "page embedding failed")
                }
            }
        }
        if rows.is_empty() {
            return;
        }
        match ctx.image_vectors.add(&rows).await {
            Ok(()) => indexed.image_vectors += rows.len() as u64,
            Err(e) => warn!(hash = %hash.short(), error = %e, "page vector write failed"),
        }
    }

    /// Remove every record for `hash` from the four stores. Each delete is
    /// attempted even when an earlier one fails; nothing is retried.
    pub async fn delete_by_hash(&self, hash: &ContentHash) -> DeleteReport {
        let ctx = &self.ctx;
        let _guard = ctx.hash_locks.lock(hash).await;
        let mut report = DeleteReport::default();

        match ctx.text_chunks.delete_by_hash(hash).await {
            Ok(n) => report.text_chunks = n,
            Err(e) => report
                .failures
                .push(("text_chunks".to_string(), format!("{:#}", e))),
        }
        match ctx.image_vectors.delete_by_hash(hash).await {
            Ok(n) => report.image_vectors = n,
            Err(e) => report
                .failures
                .push(("image_vectors".to_string(), format!("{:#}", e))),
        }
        match ctx.raw_files.delete_by_hash(hash).await {
            Ok(n) => report.raw_files = n,
            Err(e) => report
                .failures
                .push(("raw_files".to_string(), format!("{:#}", e))),
        }
        if let Err(e) = ctx.registry.remove(hash).await {
            report
                .failures
                .push(("registry".to_string(), format!("{:#}", e)));
        }

        if report.is_success() {
            info!(
                hash = %hash.short(),
                chunks = report.text_chunks,
                images = report.image_vectors,
                raw = report.raw_files,
                "deleted"
            );
        } else {
            warn!(hash = %hash.short(), failed = ?report.failed_stores(), "partial delete");
        }
        report
    }
}

/// Human-readable reason a spawned job did not return.
pub(crate) fn join_error_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "job cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
