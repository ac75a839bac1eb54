//! In-memory stores for tests and dry runs.
//!
//! Rows live in `Vec`/`HashMap` behind `tokio::sync::RwLock`. Search is
//! brute-force cosine similarity over every stored vector.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{ContentHash, RawFileRecord, VectorRecord};

use super::{rank, RawFileStore, SearchFilter, SearchHit, VectorStore};

#[derive(Default)]
pub struct MemoryRawFileStore {
    records: RwLock<HashMap<ContentHash, RawFileRecord>>,
}

impl MemoryRawFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RawFileStore for MemoryRawFileStore {
    async fn add(&self, record: &RawFileRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.hash) {
            bail!("raw record already exists for {}", record.hash);
        }
        records.insert(record.hash.clone(), record.clone());
        Ok(())
    }

    async fn delete_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        Ok(self.records.write().await.remove(hash).map_or(0, |_| 1))
    }

    async fn update_full_text(&self, hash: &ContentHash, text: &str) -> Result<()> {
        match self.records.write().await.get_mut(hash) {
            Some(record) => {
                record.full_text = text.to_string();
                Ok(())
            }
            None => bail!("no raw record for {}", hash),
        }
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<RawFileRecord>> {
        Ok(self.records.read().await.get(hash).cloned())
    }

    async fn scan(&self) -> Result<Vec<RawFileRecord>> {
        let mut all: Vec<RawFileRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(all)
    }
}

pub struct MemoryVectorStore<R> {
    rows: RwLock<Vec<R>>,
}

impl<R> MemoryVectorStore<R> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl<R> Default for MemoryVectorStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: VectorRecord> VectorStore<R> for MemoryVectorStore<R> {
    async fn add(&self, rows: &[R]) -> Result<()> {
        self.rows.write().await.extend(rows.iter().cloned());
        Ok(())
    }

    async fn delete_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|r| r.hash() != hash);
        Ok((before - rows.len()) as u64)
    }

    async fn count_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|r| r.hash() == hash)
            .count() as u64)
    }

    async fn scan(&self) -> Result<Vec<R>> {
        Ok(self.rows.read().await.clone())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit<R>>> {
        let rows = self.rows.read().await;
        Ok(rank(rows.iter().cloned(), query, filter, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::models::{ImageVectorRecord, TextChunkRecord};

    fn chunk(hash: &ContentHash, id: &str, vector: Vec<f32>, ext: &str) -> TextChunkRecord {
        TextChunkRecord {
            id: id.to_string(),
            hash: hash.clone(),
            vector,
            text: format!("text {}", id),
            source_uri: "local://a".to_string(),
            name: "a".to_string(),
            extension: ext.to_string(),
        }
    }

    fn raw(hash: &ContentHash) -> RawFileRecord {
        RawFileRecord {
            hash: hash.clone(),
            name: "a.txt".to_string(),
            extension: "txt".to_string(),
            source_uri: "local://a.txt".to_string(),
            bytes: b"abc".to_vec(),
            full_text: String::new(),
        }
    }

    #[tokio::test]
    async fn raw_store_rejects_duplicates_until_deleted() {
        let store = MemoryRawFileStore::new();
        let h = hash_bytes(b"abc");
        store.add(&raw(&h)).await.unwrap();
        assert!(store.add(&raw(&h)).await.is_err());
        assert_eq!(store.delete_by_hash(&h).await.unwrap(), 1);
        store.add(&raw(&h)).await.unwrap();
        store.update_full_text(&h, "abc").await.unwrap();
        assert_eq!(store.get(&h).await.unwrap().unwrap().full_text, "abc");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn update_full_text_missing_row_fails() {
        let store = MemoryRawFileStore::new();
        assert!(store
            .update_full_text(&hash_bytes(b"nope"), "x")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn vector_delete_only_touches_hash() {
        let store = MemoryVectorStore::<TextChunkRecord>::new();
        let (a, b) = (hash_bytes(b"a"), hash_bytes(b"b"));
        store
            .add(&[
                chunk(&a, "1", vec![1.0, 0.0], "txt"),
                chunk(&a, "2", vec![0.0, 1.0], "txt"),
                chunk(&b, "3", vec![1.0, 1.0], "md"),
            ])
            .await
            .unwrap();
        assert_eq!(store.delete_by_hash(&a).await.unwrap(), 2);
        assert_eq!(store.count_by_hash(&a).await.unwrap(), 0);
        assert_eq!(store.count_by_hash(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_ranks_and_filters() {
        let store = MemoryVectorStore::<TextChunkRecord>::new();
        let h = hash_bytes(b"a");
        store
            .add(&[
                chunk(&h, "x", vec![1.0, 0.0], "txt"),
                chunk(&h, "y", vec![0.7, 0.7], "md"),
                chunk(&h, "z", vec![0.0, 1.0], "txt"),
            ])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], &SearchFilter::default(), 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, "x");
        assert_eq!(hits[1].record.id, "y");

        let filter = SearchFilter {
            label: Some("txt".to_string()),
            ..Default::default()
        };
        let hits = store.search(&[0.0, 1.0], &filter, 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "x"]);
    }

    #[tokio::test]
    async fn image_label_is_meta_info() {
        let store = MemoryVectorStore::<ImageVectorRecord>::new();
        let h = hash_bytes(b"pdf");
        let page = |n: u32| ImageVectorRecord {
            id: format!("p{}", n),
            hash: h.clone(),
            vector: vec![1.0, n as f32],
            source_uri: "local://doc.pdf".to_string(),
            name: "doc.pdf".to_string(),
            meta_info: format!("Page {}", n),
        };
        store.add(&[page(1), page(2)]).await.unwrap();
        let filter = SearchFilter {
            label: Some("Page 2".to_string()),
            ..Default::default()
        };
        let hits = store.search(&[1.0, 1.0], &filter, 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "p2");
    }
}
