//! The explicit runtime context shared by the pipeline, scheduler and adapters.
//!
//! Built once at startup by [`IngestContext::from_config`] (or assembled by
//! hand with [`IngestContextBuilder`], which is what the tests do) and passed
//! around by `Arc`. There are no lazily initialized globals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::OwnedMutexGuard;
use tracing::info;

use crate::config::{Config, IngestConfig};
use crate::embedding::{
    create_image_embedder, create_text_embedder, DisabledImageEmbedder, DisabledTextEmbedder,
    ImageEmbedder, TextEmbedder,
};
use crate::entities::{create_entity_extractor, EntityExtractor};
use crate::error::ConnectivityError;
use crate::extract::ExtractorRegistry;
use crate::media::{
    create_rasterizer, create_transcriber, DisabledRasterizer, DisabledTranscriber,
    PageRasterizer, PdftoppmRasterizer, Transcriber,
};
use crate::metadata::{MemoryRegistry, MetadataRegistry, SqliteRegistry};
use crate::models::{ContentHash, ImageVectorRecord, TextChunkRecord};
use crate::object_store::{DisabledObjectStore, ObjectStore, S3ObjectStore};
use crate::store::{
    MemoryRawFileStore, MemoryVectorStore, RawFileStore, SqliteImageVectorStore,
    SqliteRawFileStore, SqliteTextChunkStore, VectorStore,
};
use crate::{db, migrate};

/// Per-content-hash async mutexes.
///
/// Entries are created on demand and pruned when the last holder releases,
/// so the map only ever holds hashes that are in flight.
#[derive(Default)]
pub struct HashLocks {
    inner: Mutex<HashMap<ContentHash, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct HashGuard<'a> {
    locks: &'a HashLocks,
    hash: ContentHash,
    guard: Option<OwnedMutexGuard<()>>,
}

impl HashLocks {
    pub async fn lock(&self, hash: &ContentHash) -> HashGuard<'_> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(hash.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        HashGuard {
            locks: self,
            hash: hash.clone(),
            guard: Some(guard),
        }
    }

    /// Number of hashes currently locked or waited on.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for HashGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        // Only the map's own reference left: nobody holds or awaits this hash.
        if map
            .get(&self.hash)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            map.remove(&self.hash);
        }
    }
}

pub struct IngestContext {
    pub settings: IngestConfig,
    pub registry: Arc<dyn MetadataRegistry>,
    pub raw_files: Arc<dyn RawFileStore>,
    pub text_chunks: Arc<dyn VectorStore<TextChunkRecord>>,
    pub image_vectors: Arc<dyn VectorStore<ImageVectorRecord>>,
    pub object_store: Arc<dyn ObjectStore>,
    pub text_embedder: Arc<dyn TextEmbedder>,
    pub image_embedder: Arc<dyn ImageEmbedder>,
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub extractors: ExtractorRegistry,
    pub entities: Option<Arc<dyn EntityExtractor>>,
    pub hash_locks: HashLocks,
    pool: Option<SqlitePool>,
    check_pdftoppm: bool,
}

impl IngestContext {
    /// Open the database (running migrations), build every configured adapter.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let object_store: Arc<dyn ObjectStore> = match config.storage {
            Some(ref storage) => Arc::new(S3ObjectStore::new(storage)?),
            None => Arc::new(DisabledObjectStore),
        };
        let transcriber = create_transcriber(&config.transcription)?;

        info!(
            db = %config.db.path.display(),
            embedding = %config.embedding.provider,
            image_embedding = %config.image_embedding.provider,
            transcription = %config.transcription.provider,
            rasterizer = %config.rasterizer.provider,
            storage = config.storage.is_some(),
            "ingest context ready"
        );

        Ok(Self {
            settings: config.ingest.clone(),
            registry: Arc::new(SqliteRegistry::new(pool.clone())),
            raw_files: Arc::new(SqliteRawFileStore::new(pool.clone())),
            text_chunks: Arc::new(SqliteTextChunkStore::new(pool.clone())),
            image_vectors: Arc::new(SqliteImageVectorStore::new(pool.clone())),
            object_store,
            text_embedder: create_text_embedder(&config.embedding)?,
            image_embedder: create_image_embedder(&config.image_embedding)?,
            rasterizer: create_rasterizer(&config.rasterizer)?,
            extractors: ExtractorRegistry::with_defaults(transcriber),
            entities: create_entity_extractor(&config.entities)?,
            hash_locks: HashLocks::default(),
            pool: Some(pool),
            check_pdftoppm: config.rasterizer.provider == "pdftoppm",
        })
    }

    pub fn builder(settings: IngestConfig) -> IngestContextBuilder {
        IngestContextBuilder::new(settings)
    }

    /// Probe every backing service once. The first unreachable one is
    /// reported; nothing is retried.
    pub async fn check_connectivity(&self) -> std::result::Result<(), ConnectivityError> {
        self.registry
            .ping()
            .await
            .map_err(|e| ConnectivityError::new("metadata registry", e))?;
        self.raw_files
            .ping()
            .await
            .map_err(|e| ConnectivityError::new("raw file store", e))?;
        self.text_chunks
            .ping()
            .await
            .map_err(|e| ConnectivityError::new("text chunk store", e))?;
        self.image_vectors
            .ping()
            .await
            .map_err(|e| ConnectivityError::new("image vector store", e))?;
        if self.object_store.raw_bucket().is_some() {
            self.object_store
                .ping()
                .await
                .map_err(|e| ConnectivityError::new("object store", e))?;
        }
        self.text_embedder
            .health_check()
            .await
            .map_err(|e| ConnectivityError::new("text embedding backend", e))?;
        self.image_embedder
            .health_check()
            .await
            .map_err(|e| ConnectivityError::new("image embedding backend", e))?;
        if self.check_pdftoppm && !PdftoppmRasterizer::is_available().await {
            return Err(ConnectivityError::new(
                "pdftoppm",
                "executable not found on PATH",
            ));
        }
        Ok(())
    }

    /// Close the database pool, if any.
    pub async fn shutdown(&self) {
        if let Some(ref pool) = self.pool {
            pool.close().await;
        }
    }
}

/// Assemble a context piece by piece. Anything not set defaults to an
/// in-memory store or a disabled capability.
pub struct IngestContextBuilder {
    settings: IngestConfig,
    registry: Option<Arc<dyn MetadataRegistry>>,
    raw_files: Option<Arc<dyn RawFileStore>>,
    text_chunks: Option<Arc<dyn VectorStore<TextChunkRecord>>>,
    image_vectors: Option<Arc<dyn VectorStore<ImageVectorRecord>>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    text_embedder: Option<Arc<dyn TextEmbedder>>,
    image_embedder: Option<Arc<dyn ImageEmbedder>>,
    rasterizer: Option<Arc<dyn PageRasterizer>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    entities: Option<Arc<dyn EntityExtractor>>,
}

impl IngestContextBuilder {
    pub fn new(settings: IngestConfig) -> Self {
        Self {
            settings,
            registry: None,
            raw_files: None,
            text_chunks: None,
            image_vectors: None,
            object_store: None,
            text_embedder: None,
            image_embedder: None,
            rasterizer: None,
            transcriber: None,
            entities: None,
        }
    }

    pub fn registry(mut self, registry: Arc<dyn MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn raw_files(mut self, store: Arc<dyn RawFileStore>) -> Self {
        self.raw_files = Some(store);
        self
    }

    pub fn text_chunks(mut self, store: Arc<dyn VectorStore<TextChunkRecord>>) -> Self {
        self.text_chunks = Some(store);
        self
    }

    pub fn image_vectors(mut self, store: Arc<dyn VectorStore<ImageVectorRecord>>) -> Self {
        self.image_vectors = Some(store);
        self
    }

    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn text_embedder(mut self, embedder: Arc<dyn TextEmbedder>) -> Self {
        self.text_embedder = Some(embedder);
        self
    }

    pub fn image_embedder(mut self, embedder: Arc<dyn ImageEmbedder>) -> Self {
        self.image_embedder = Some(embedder);
        self
    }

    pub fn rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn entities(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.entities = Some(extractor);
        self
    }

    pub fn build(self) -> IngestContext {
        let transcriber = self
            .transcriber
            .unwrap_or_else(|| Arc::new(DisabledTranscriber));
        IngestContext {
            settings: self.settings,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(MemoryRegistry::new())),
            raw_files: self
                .raw_files
                .unwrap_or_else(|| Arc::new(MemoryRawFileStore::new())),
            text_chunks: self
                .text_chunks
                .unwrap_or_else(|| Arc::new(MemoryVectorStore::<TextChunkRecord>::new())),
            image_vectors: self
                .image_vectors
                .unwrap_or_else(|| Arc::new(MemoryVectorStore::<ImageVectorRecord>::new())),
            object_store: self
                .object_store
                .unwrap_or_else(|| Arc::new(DisabledObjectStore)),
            text_embedder: self
                .text_embedder
                .unwrap_or_else(|| Arc::new(DisabledTextEmbedder)),
            image_embedder: self
                .image_embedder
                .unwrap_or_else(|| Arc::new(DisabledImageEmbedder)),
            rasterizer: self
                .rasterizer
                .unwrap_or_else(|| Arc::new(DisabledRasterizer)),
            extractors: ExtractorRegistry::with_defaults(transcriber),
            entities: self.entities,
            hash_locks: HashLocks::default(),
            pool: None,
            check_pdftoppm: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn hash_lock_serializes_same_hash() {
        let locks = Arc::new(HashLocks::default());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let hash = hash_bytes(b"same");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (locks, active, max_seen, hash) = (
                Arc::clone(&locks),
                Arc::clone(&active),
                Arc::clone(&max_seen),
                hash.clone(),
            );
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&hash).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_hashes_do_not_block() {
        let locks = HashLocks::default();
        let a = locks.lock(&hash_bytes(b"a")).await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock(&hash_bytes(b"b")))
            .await
            .expect("second hash should lock immediately");
        assert_eq!(locks.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn builder_context_is_reachable() {
        let ctx = IngestContext::builder(IngestConfig::default()).build();
        ctx.check_connectivity().await.unwrap();
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn sqlite_context_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            "[db]\npath = \"{}\"\n",
            dir.path().join("lake.sqlite").display()
        ))
        .unwrap();
        let ctx = IngestContext::from_config(&config).await.unwrap();
        ctx.check_connectivity().await.unwrap();
        ctx.shutdown().await;
    }
}
