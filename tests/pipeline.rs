//! End-to-end tests for the ingestion pipeline, scheduler and delete path,
//! run against in-memory stores with deterministic fake models.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use lake_ingest::config::IngestConfig;
use lake_ingest::context::{IngestContext, IngestContextBuilder};
use lake_ingest::embedding::{ImageEmbedder, TextEmbedder};
use lake_ingest::entities::EntityExtractor;
use lake_ingest::hash::compute_hash;
use lake_ingest::media::{PageRasterizer, RasterizedPages};
use lake_ingest::models::{
    ContentHash, FileEntity, IngestionJob, TaskStatus, TextChunkRecord,
};
use lake_ingest::object_store::ObjectStore;
use lake_ingest::pipeline::Pipeline;
use lake_ingest::progress::{spawn_observer, Phase, ProgressEvent, ProgressReporter};
use lake_ingest::scheduler::{BatchItem, BatchScheduler};
use lake_ingest::store::{MemoryVectorStore, SearchFilter, SearchHit, VectorStore};

// ============ Fakes ============

struct FakeTextEmbedder;

#[async_trait]
impl TextEmbedder for FakeTextEmbedder {
    fn model_name(&self) -> &str {
        "fake-text"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let sum: u32 = t.bytes().map(u32::from).sum();
                vec![t.len() as f32, (sum % 97) as f32, 1.0]
            })
            .collect())
    }
}

struct FakeImageEmbedder;

#[async_trait]
impl ImageEmbedder for FakeImageEmbedder {
    fn model_name(&self) -> &str {
        "fake-image"
    }
    async fn encode_image(&self, path: &Path) -> Result<Vec<f32>> {
        let len = std::fs::metadata(path)?.len();
        Ok(vec![len as f32, 0.5, 1.0])
    }
}

/// Produces `pages` blank page files for any input.
struct FakeRasterizer {
    pages: usize,
}

#[async_trait]
impl PageRasterizer for FakeRasterizer {
    async fn rasterize(&self, _pdf: &Path) -> Result<RasterizedPages> {
        let dir = tempfile::tempdir()?;
        let mut pages = Vec::new();
        for i in 1..=self.pages {
            let page = dir.path().join(format!("page-{}.png", i));
            std::fs::write(&page, vec![0u8; i * 10])?;
            pages.push(page);
        }
        Ok(RasterizedPages::new(dir, pages))
    }
}

struct FixedEntities;

#[async_trait]
impl EntityExtractor for FixedEntities {
    async fn extract(&self, _text: &str) -> Result<Vec<FileEntity>> {
        Ok(vec![FileEntity {
            name: "Acme".to_string(),
            entity_type: "ORG".to_string(),
        }])
    }
}

struct FailingEntities;

#[async_trait]
impl EntityExtractor for FailingEntities {
    async fn extract(&self, _text: &str) -> Result<Vec<FileEntity>> {
        bail!("model offline")
    }
}

/// Text-chunk store whose deletes always fail.
struct UndeletableChunks(MemoryVectorStore<TextChunkRecord>);

#[async_trait]
impl VectorStore<TextChunkRecord> for UndeletableChunks {
    async fn add(&self, rows: &[TextChunkRecord]) -> Result<()> {
        self.0.add(rows).await
    }
    async fn delete_by_hash(&self, _hash: &ContentHash) -> Result<u64> {
        bail!("store is read-only")
    }
    async fn count_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        self.0.count_by_hash(hash).await
    }
    async fn scan(&self) -> Result<Vec<TextChunkRecord>> {
        self.0.scan().await
    }
    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit<TextChunkRecord>>> {
        self.0.search(query, filter, limit).await
    }
}

struct Collect(Arc<Mutex<Vec<ProgressEvent>>>);

impl ProgressReporter for Collect {
    fn report(&self, event: &ProgressEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

/// Accepts every upload into the `lake-raw` bucket.
struct BucketStore;

#[async_trait]
impl ObjectStore for BucketStore {
    fn raw_bucket(&self) -> Option<&str> {
        Some("lake-raw")
    }

    async fn put(&self, bucket: &str, key: &str, _bytes: Vec<u8>) -> Result<String> {
        Ok(format!("s3://{}/{}", bucket, key))
    }
}

/// Configured with a bucket that cannot be reached.
struct UnreachableBucket;

#[async_trait]
impl ObjectStore for UnreachableBucket {
    fn raw_bucket(&self) -> Option<&str> {
        Some("lake-raw")
    }

    async fn put(&self, _bucket: &str, _key: &str, _bytes: Vec<u8>) -> Result<String> {
        bail!("connection refused")
    }
}

// ============ Helpers ============

struct Harness {
    dir: TempDir,
    pipeline: Arc<Pipeline>,
}

fn settings(dir: &Path) -> IngestConfig {
    IngestConfig {
        temp_dir: dir.join("uploads"),
        extract_dir: dir.join("extracted"),
        ..IngestConfig::default()
    }
}

fn harness() -> Harness {
    harness_with(|b| b)
}

fn harness_with(
    customize: impl FnOnce(IngestContextBuilder) -> IngestContextBuilder,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let builder = IngestContext::builder(settings(dir.path()))
        .text_embedder(Arc::new(FakeTextEmbedder))
        .image_embedder(Arc::new(FakeImageEmbedder));
    let ctx = customize(builder).build();
    Harness {
        dir,
        pipeline: Arc::new(Pipeline::new(Arc::new(ctx))),
    }
}

impl Harness {
    fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn ctx(&self) -> &IngestContext {
        self.pipeline.context()
    }
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = zip::write::SimpleFileOptions::default();
    for (name, body) in entries {
        zip.start_file(*name, opts).unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn ten_kb_text() -> String {
    let sentence = "The quarterly report covers revenue, hiring and the new warehouse. ";
    let mut text = String::new();
    let mut paragraph = 0;
    while text.len() < 10 * 1024 {
        text.push_str(sentence);
        paragraph += 1;
        if paragraph % 5 == 0 {
            text.push_str("\n\n");
        }
    }
    text
}

// ============ Tests ============

#[tokio::test]
async fn reingesting_identical_bytes_replaces_records() {
    let h = harness();
    let text = ten_kb_text();
    let first = h.write("report.txt", text.as_bytes());
    let second = h.write("report-copy.txt", text.as_bytes());

    let a = h.pipeline.process(IngestionJob::new(&first, "report.txt")).await;
    let b = h
        .pipeline
        .process(IngestionJob::new(&second, "report-copy.txt"))
        .await;

    assert_eq!(a.status, TaskStatus::Ok, "{}", a.message);
    assert_eq!(b.status, TaskStatus::Ok, "{}", b.message);
    assert!(a.text_chunks > 1);
    assert_eq!(a.text_chunks, b.text_chunks);

    let hash = compute_hash(&first).await.unwrap();
    let raw = h.ctx().raw_files.scan().await.unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].name, "report-copy.txt");
    assert_eq!(
        h.ctx().text_chunks.count_by_hash(&hash).await.unwrap(),
        b.text_chunks
    );
    assert_eq!(h.ctx().registry.count_registered(None).await.unwrap(), 1);
}

#[tokio::test]
async fn reingest_after_registry_loss_replaces_raw_row() {
    let h = harness();
    let text = h.write("a.txt", ten_kb_text().as_bytes());
    let image = h.write("a.png", b"png-ish bytes");

    for (path, name) in [(&text, "a.txt"), (&image, "a.png")] {
        let first = h.pipeline.process(IngestionJob::new(path, name)).await;
        assert_eq!(first.status, TaskStatus::Ok, "{}", first.message);
        let hash = compute_hash(path).await.unwrap();
        // Registry row gone, every other store still populated.
        h.ctx().registry.remove(&hash).await.unwrap();

        let again = h.pipeline.process(IngestionJob::new(path, name)).await;
        assert_eq!(again.status, TaskStatus::Ok, "{}", again.message);
        assert!(h.ctx().registry.exists(&hash).await.unwrap());
        assert!(h.ctx().raw_files.get(&hash).await.unwrap().is_some());
        assert_eq!(
            h.ctx().text_chunks.count_by_hash(&hash).await.unwrap(),
            again.text_chunks
        );
        assert_eq!(
            h.ctx().image_vectors.count_by_hash(&hash).await.unwrap(),
            again.image_vectors
        );
    }
    assert_eq!(h.ctx().raw_files.scan().await.unwrap().len(), 2);
    assert_eq!(
        h.ctx().image_vectors.scan().await.unwrap().len(),
        1,
        "image vector duplicated"
    );
}

#[tokio::test]
async fn bucket_uri_reaches_every_store() {
    let h = harness_with(|b| b.object_store(Arc::new(BucketStore)));
    let text = h.write("notes.txt", b"meeting notes for tuesday");
    let image = h.write("photo.png", b"png-ish bytes");
    h.pipeline.process(IngestionJob::new(&text, "notes.txt")).await;
    h.pipeline.process(IngestionJob::new(&image, "photo.png")).await;

    let raw = h.ctx().raw_files.scan().await.unwrap();
    assert_eq!(raw.len(), 2);
    for record in &raw {
        assert!(record.source_uri.starts_with("s3://lake-raw/raw/"), "{}", record.source_uri);
        assert!(record.source_uri.ends_with(&record.name), "{}", record.source_uri);
    }
    let chunks = h.ctx().text_chunks.scan().await.unwrap();
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert!(chunk.source_uri.starts_with("s3://lake-raw/raw/"));
        assert!(chunk.source_uri.ends_with("_notes.txt"));
    }
    let images = h.ctx().image_vectors.scan().await.unwrap();
    assert_eq!(images.len(), 1);
    assert!(images[0].source_uri.starts_with("s3://lake-raw/raw/"));
    assert!(images[0].source_uri.ends_with("_photo.png"));
}

#[tokio::test]
async fn failed_upload_falls_back_to_local_uri() {
    let h = harness_with(|b| b.object_store(Arc::new(UnreachableBucket)));
    let text = h.write("notes.txt", b"meeting notes for tuesday");
    let image = h.write("photo.png", b"png-ish bytes");
    let a = h.pipeline.process(IngestionJob::new(&text, "notes.txt")).await;
    let b = h.pipeline.process(IngestionJob::new(&image, "photo.png")).await;
    assert_eq!(a.status, TaskStatus::Ok, "{}", a.message);
    assert_eq!(b.status, TaskStatus::Ok, "{}", b.message);

    for record in h.ctx().raw_files.scan().await.unwrap() {
        assert_eq!(record.source_uri, format!("local://{}", record.name));
    }
    let chunks = h.ctx().text_chunks.scan().await.unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.source_uri == "local://notes.txt"));
    let images = h.ctx().image_vectors.scan().await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].source_uri, "local://photo.png");
}

#[tokio::test]
async fn concurrent_identical_uploads_do_not_duplicate() {
    let h = harness();
    let text = ten_kb_text().into_bytes();
    let items = (0..4)
        .map(|i| BatchItem::Upload {
            name: format!("dup-{}.txt", i),
            bytes: text.clone(),
        })
        .collect();

    let summary = BatchScheduler::new(Arc::clone(&h.pipeline))
        .with_concurrency(4)
        .run(items)
        .await;

    assert_eq!(summary.success_count, 4);
    let raw = h.ctx().raw_files.scan().await.unwrap();
    assert_eq!(raw.len(), 1);
    let chunks = h.ctx().text_chunks.scan().await.unwrap();
    assert_eq!(chunks.len() as u64, summary.results[0].1.text_chunks);
}

#[tokio::test]
async fn nested_archive_expands_to_members() {
    let h = harness();
    let inner = zip_bytes(&[("c.txt", b"inner text file".as_slice())]);
    let outer = zip_bytes(&[
        ("a.txt", b"top level text".as_slice()),
        ("b.jpg", b"\xff\xd8\xff fake jpeg body".as_slice()),
        ("inner.zip", inner.as_slice()),
        (".DS_Store", b"junk".as_slice()),
    ]);
    let path = h.write("bundle.zip", &outer);

    let result = h.pipeline.process(IngestionJob::new(&path, "bundle.zip")).await;
    assert_eq!(result.status, TaskStatus::Ok, "{}", result.message);
    assert_eq!(result.record_count, 3);
    assert!(result.message.contains("0 skipped"));

    let raw = h.ctx().raw_files.scan().await.unwrap();
    let mut names: Vec<&str> = raw.iter().map(|r| r.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.jpg", "c.txt"]);

    let images = h.ctx().image_vectors.scan().await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].meta_info, "image_file");

    let leftovers = std::fs::read_dir(h.dir.path().join("extracted"))
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn archive_with_only_unsupported_members_is_skipped() {
    let h = harness();
    let path = h.write("blobs.zip", &zip_bytes(&[("x.bin", b"opaque".as_slice())]));
    let result = h.pipeline.process(IngestionJob::new(&path, "blobs.zip")).await;
    assert_eq!(result.status, TaskStatus::Skipped);
    assert_eq!(h.ctx().raw_files.scan().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unsupported_extension_is_stored_but_skipped() {
    let h = harness();
    let path = h.write("firmware.bin", b"\x00\x01\x02");
    let result = h
        .pipeline
        .process(IngestionJob::new(&path, "firmware.bin"))
        .await;

    assert_eq!(result.status, TaskStatus::Skipped);
    assert!(result.message.contains("unsupported extension .bin"));
    let raw = h.ctx().raw_files.scan().await.unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].bytes, vec![0u8, 1, 2]);
    assert!(h.ctx().text_chunks.scan().await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_file_keeps_metadata_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = settings(dir.path());
    s.max_file_size_mb = 0;
    let ctx = IngestContext::builder(s)
        .text_embedder(Arc::new(FakeTextEmbedder))
        .build();
    let pipeline = Pipeline::new(Arc::new(ctx));
    let path = dir.path().join("big.txt");
    std::fs::write(&path, "words that would be indexed").unwrap();

    let result = pipeline.process(IngestionJob::new(&path, "big.txt")).await;
    assert_ne!(result.status, TaskStatus::Error);
    let raw = pipeline.context().raw_files.scan().await.unwrap();
    assert_eq!(raw.len(), 1);
    assert!(raw[0].bytes.is_empty());
}

#[tokio::test]
async fn pdf_pages_become_image_vectors() {
    let h = harness_with(|b| b.rasterizer(Arc::new(FakeRasterizer { pages: 3 })));
    // Not a parseable PDF: text extraction fails, page vectors still land.
    let path = h.write("scan.pdf", b"%PDF-1.4 garbage");

    let result = h.pipeline.process(IngestionJob::new(&path, "scan.pdf")).await;
    assert_eq!(result.status, TaskStatus::Ok, "{}", result.message);
    assert_eq!(result.image_vectors, 3);

    let mut labels: Vec<String> = h
        .ctx()
        .image_vectors
        .scan()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.meta_info)
        .collect();
    labels.sort();
    assert_eq!(labels, vec!["Page 1", "Page 2", "Page 3"]);

    // Re-ingestion replaces, never accumulates, page vectors.
    h.pipeline.process(IngestionJob::new(&path, "scan.pdf")).await;
    assert_eq!(h.ctx().image_vectors.scan().await.unwrap().len(), 3);
}

#[tokio::test]
async fn entities_are_recorded_and_failures_ignored() {
    let h = harness_with(|b| b.entities(Arc::new(FixedEntities)));
    let path = h.write("memo.md", b"Acme signed the contract.");
    let result = h.pipeline.process(IngestionJob::new(&path, "memo.md")).await;
    assert_eq!(result.status, TaskStatus::Ok);
    let hash = compute_hash(&path).await.unwrap();
    let entities = h.ctx().registry.list_entities(&hash).await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].name, "Acme");

    let h = harness_with(|b| b.entities(Arc::new(FailingEntities)));
    let path = h.write("memo.md", b"Acme signed the contract.");
    let result = h.pipeline.process(IngestionJob::new(&path, "memo.md")).await;
    assert_eq!(result.status, TaskStatus::Ok);
}

#[tokio::test]
async fn delete_removes_everything() {
    let h = harness();
    let text = h.write("a.txt", b"some text to index");
    let image = h.write("a.png", b"png-ish bytes");
    h.pipeline.process(IngestionJob::new(&text, "a.txt")).await;
    h.pipeline.process(IngestionJob::new(&image, "a.png")).await;

    for path in [&text, &image] {
        let hash = compute_hash(path).await.unwrap();
        let report = h.pipeline.delete_by_hash(&hash).await;
        assert!(report.is_success(), "{:?}", report.failures);
        assert!(!h.ctx().registry.exists(&hash).await.unwrap());
        assert_eq!(h.ctx().text_chunks.count_by_hash(&hash).await.unwrap(), 0);
        assert_eq!(h.ctx().image_vectors.count_by_hash(&hash).await.unwrap(), 0);
        assert!(h.ctx().raw_files.get(&hash).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn partial_delete_names_the_failing_store() {
    let h = harness_with(|b| {
        b.text_chunks(Arc::new(UndeletableChunks(MemoryVectorStore::new())))
    });
    let path = h.write("a.txt", b"text that cannot be removed");
    let result = h.pipeline.process(IngestionJob::new(&path, "a.txt")).await;
    assert_eq!(result.status, TaskStatus::Ok);

    let hash = compute_hash(&path).await.unwrap();
    let report = h.pipeline.delete_by_hash(&hash).await;
    assert!(!report.is_success());
    assert_eq!(report.failed_stores(), vec!["text_chunks"]);
    // The other stores were still attempted.
    assert_eq!(report.raw_files, 1);
    assert!(!h.ctx().registry.exists(&hash).await.unwrap());
}

#[tokio::test]
async fn progress_covers_every_completion_once() {
    let h = harness();
    let items: Vec<BatchItem> = (0..7)
        .map(|i| BatchItem::Upload {
            name: format!("note-{}.txt", i),
            bytes: format!("note number {}", i).into_bytes(),
        })
        .collect();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (sink, observer) = spawn_observer(Box::new(Collect(Arc::clone(&seen))));
    let summary = BatchScheduler::new(Arc::clone(&h.pipeline))
        .with_concurrency(3)
        .with_progress(sink)
        .run(items)
        .await;
    observer.await.unwrap();

    assert_eq!(summary.total, 7);
    assert_eq!(summary.success_count, 7);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 7);
    let mut indexes: Vec<u64> = seen.iter().map(|e| e.completed).collect();
    indexes.sort();
    assert_eq!(indexes, (1..=7).collect::<Vec<u64>>());
    assert!(seen.iter().all(|e| e.total == 7 && e.phase == Phase::Processing));

    // Staged uploads are gone.
    assert_eq!(
        std::fs::read_dir(h.dir.path().join("uploads")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn one_failure_does_not_abort_the_batch() {
    let h = harness();
    let good = h.write("good.txt", b"fine content");
    let items = vec![
        BatchItem::Path {
            path: good.clone(),
            name: "good.txt".to_string(),
        },
        BatchItem::Path {
            path: h.dir.path().join("missing.txt"),
            name: "missing.txt".to_string(),
        },
        BatchItem::Upload {
            name: "empty.txt".to_string(),
            bytes: Vec::new(),
        },
    ];
    let summary = BatchScheduler::new(Arc::clone(&h.pipeline)).run(items).await;
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.error_count, 2);
    // Caller-owned inputs are left alone.
    assert!(good.exists());
}
