//! Storage abstraction for the three independently queried data stores.
//!
//! - [`RawFileStore`]: one whole-file record per content hash, for preview and download.
//! - [`VectorStore`]: embedded rows keyed by content hash, with nearest-neighbor
//!   search. Instantiated for [`TextChunkRecord`] and [`ImageVectorRecord`].
//!
//! Stores are individually safe for concurrent add/delete. Nothing spans
//! stores transactionally; the pipeline replaces records by hash on a
//! best-effort basis.
//!
//! [`TextChunkRecord`]: crate::models::TextChunkRecord
//! [`ImageVectorRecord`]: crate::models::ImageVectorRecord

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{ContentHash, RawFileRecord, VectorRecord};

pub use memory::{MemoryRawFileStore, MemoryVectorStore};
pub use sqlite::{SqliteImageVectorStore, SqliteRawFileStore, SqliteTextChunkStore};

#[async_trait]
pub trait RawFileStore: Send + Sync {
    /// Insert a record. Fails if a record for the hash already exists.
    async fn add(&self, record: &RawFileRecord) -> Result<()>;

    /// Remove the record for `hash`. Returns rows removed (0 or 1).
    async fn delete_by_hash(&self, hash: &ContentHash) -> Result<u64>;

    async fn update_full_text(&self, hash: &ContentHash, text: &str) -> Result<()>;

    async fn get(&self, hash: &ContentHash) -> Result<Option<RawFileRecord>>;

    async fn scan(&self) -> Result<Vec<RawFileRecord>>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Optional restrictions on a nearest-neighbor search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub hash: Option<ContentHash>,
    /// Matches [`VectorRecord::label`]: the extension for text chunks,
    /// the meta info (`image_file`, `Page N`) for image vectors.
    pub label: Option<String>,
}

impl SearchFilter {
    pub fn matches<R: VectorRecord>(&self, row: &R) -> bool {
        self.hash.as_ref().map_or(true, |h| row.hash() == h)
            && self.label.as_deref().map_or(true, |l| row.label() == l)
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit<R> {
    pub record: R,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

#[async_trait]
pub trait VectorStore<R: VectorRecord>: Send + Sync {
    async fn add(&self, rows: &[R]) -> Result<()>;

    /// Remove every row for `hash`. Returns rows removed.
    async fn delete_by_hash(&self, hash: &ContentHash) -> Result<u64>;

    async fn count_by_hash(&self, hash: &ContentHash) -> Result<u64>;

    async fn scan(&self) -> Result<Vec<R>>;

    /// Brute-force cosine ranking, best first.
    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit<R>>>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Score `rows` against `query`, keep those passing `filter`, best first.
pub fn rank<R: VectorRecord>(
    rows: impl IntoIterator<Item = R>,
    query: &[f32],
    filter: &SearchFilter,
    limit: usize,
) -> Vec<SearchHit<R>> {
    let mut hits: Vec<SearchHit<R>> = rows
        .into_iter()
        .filter(|r| filter.matches(r))
        .map(|record| SearchHit {
            score: cosine_similarity(query, record.vector()),
            record,
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    hits
}
