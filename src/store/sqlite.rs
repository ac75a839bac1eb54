//! SQLite-backed stores.
//!
//! Vectors are stored as little-endian f32 BLOBs and searched by loading
//! candidate rows and ranking them with cosine similarity in process.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{ContentHash, ImageVectorRecord, RawFileRecord, TextChunkRecord};

use super::{rank, RawFileStore, SearchFilter, SearchHit, VectorStore};

pub struct SqliteRawFileStore {
    pool: SqlitePool,
}

impl SqliteRawFileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_raw(row: &SqliteRow) -> RawFileRecord {
    RawFileRecord {
        hash: ContentHash::new(row.get::<String, _>("hash")),
        name: row.get("name"),
        extension: row.get("extension"),
        source_uri: row.get("source_uri"),
        bytes: row.get("bytes"),
        full_text: row.get("full_text"),
    }
}

#[async_trait]
impl RawFileStore for SqliteRawFileStore {
    async fn add(&self, record: &RawFileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_files (hash, name, extension, source_uri, bytes, full_text)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.hash.as_str())
        .bind(&record.name)
        .bind(&record.extension)
        .bind(&record.source_uri)
        .bind(&record.bytes)
        .bind(&record.full_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        let result = sqlx::query("DELETE FROM raw_files WHERE hash = ?")
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_full_text(&self, hash: &ContentHash, text: &str) -> Result<()> {
        let result = sqlx::query("UPDATE raw_files SET full_text = ? WHERE hash = ?")
            .bind(text)
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("no raw record for {}", hash);
        }
        Ok(())
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<RawFileRecord>> {
        let row = sqlx::query(
            "SELECT hash, name, extension, source_uri, bytes, full_text FROM raw_files WHERE hash = ?",
        )
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_raw))
    }

    async fn scan(&self) -> Result<Vec<RawFileRecord>> {
        let rows = sqlx::query(
            "SELECT hash, name, extension, source_uri, bytes, full_text FROM raw_files ORDER BY hash",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_raw).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1 FROM raw_files LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct SqliteTextChunkStore {
    pool: SqlitePool,
}

impl SqliteTextChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(&self, filter: &SearchFilter) -> Result<Vec<TextChunkRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, hash, vector, text, source_uri, name, extension
            FROM text_chunks
            WHERE (?1 IS NULL OR hash = ?1) AND (?2 IS NULL OR extension = ?2)
            ORDER BY rowid
            "#,
        )
        .bind(filter.hash.as_ref().map(|h| h.as_str().to_string()))
        .bind(filter.label.clone())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }
}

fn row_to_chunk(row: &SqliteRow) -> TextChunkRecord {
    let blob: Vec<u8> = row.get("vector");
    TextChunkRecord {
        id: row.get("id"),
        hash: ContentHash::new(row.get::<String, _>("hash")),
        vector: blob_to_vec(&blob),
        text: row.get("text"),
        source_uri: row.get("source_uri"),
        name: row.get("name"),
        extension: row.get("extension"),
    }
}

#[async_trait]
impl VectorStore<TextChunkRecord> for SqliteTextChunkStore {
    async fn add(&self, rows: &[TextChunkRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO text_chunks (id, hash, vector, text, source_uri, name, extension)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(row.hash.as_str())
            .bind(vec_to_blob(&row.vector))
            .bind(&row.text)
            .bind(&row.source_uri)
            .bind(&row.name)
            .bind(&row.extension)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        let result = sqlx::query("DELETE FROM text_chunks WHERE hash = ?")
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM text_chunks WHERE hash = ?")
            .bind(hash.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn scan(&self) -> Result<Vec<TextChunkRecord>> {
        self.load(&SearchFilter::default()).await
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit<TextChunkRecord>>> {
        let rows = self.load(filter).await?;
        Ok(rank(rows, query, filter, limit))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1 FROM text_chunks LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct SqliteImageVectorStore {
    pool: SqlitePool,
}

impl SqliteImageVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(&self, filter: &SearchFilter) -> Result<Vec<ImageVectorRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, hash, vector, source_uri, name, meta_info
            FROM image_vectors
            WHERE (?1 IS NULL OR hash = ?1) AND (?2 IS NULL OR meta_info = ?2)
            ORDER BY rowid
            "#,
        )
        .bind(filter.hash.as_ref().map(|h| h.as_str().to_string()))
        .bind(filter.label.clone())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_image).collect())
    }
}

fn row_to_image(row: &SqliteRow) -> ImageVectorRecord {
    let blob: Vec<u8> = row.get("vector");
    ImageVectorRecord {
        id: row.get("id"),
        hash: ContentHash::new(row.get::<String, _>("hash")),
        vector: blob_to_vec(&blob),
        source_uri: row.get("source_uri"),
        name: row.get("name"),
        meta_info: row.get("meta_info"),
    }
}

#[async_trait]
impl VectorStore<ImageVectorRecord> for SqliteImageVectorStore {
    async fn add(&self, rows: &[ImageVectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO image_vectors (id, hash, vector, source_uri, name, meta_info)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(row.hash.as_str())
            .bind(vec_to_blob(&row.vector))
            .bind(&row.source_uri)
            .bind(&row.name)
            .bind(&row.meta_info)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        let result = sqlx::query("DELETE FROM image_vectors WHERE hash = ?")
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_hash(&self, hash: &ContentHash) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM image_vectors WHERE hash = ?")
            .bind(hash.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn scan(&self) -> Result<Vec<ImageVectorRecord>> {
        self.load(&SearchFilter::default()).await
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit<ImageVectorRecord>>> {
        let rows = self.load(filter).await?;
        Ok(rank(rows, query, filter, limit))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1 FROM image_vectors LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    async fn pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("lake.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn raw_roundtrip_and_duplicate_insert_fails() {
        let (_dir, pool) = pool().await;
        let store = SqliteRawFileStore::new(pool);
        let hash = hash_bytes(b"hello");
        let record = RawFileRecord {
            hash: hash.clone(),
            name: "hello.txt".to_string(),
            extension: "txt".to_string(),
            source_uri: "local://hello.txt".to_string(),
            bytes: b"hello".to_vec(),
            full_text: String::new(),
        };
        store.add(&record).await.unwrap();
        assert!(store.add(&record).await.is_err());

        store.update_full_text(&hash, "hello").await.unwrap();
        let fetched = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(fetched.bytes, b"hello");
        assert_eq!(fetched.full_text, "hello");

        assert_eq!(store.delete_by_hash(&hash).await.unwrap(), 1);
        assert!(store.get(&hash).await.unwrap().is_none());
        assert!(store.update_full_text(&hash, "x").await.is_err());
    }

    #[tokio::test]
    async fn text_chunks_search_with_filter() {
        let (_dir, pool) = pool().await;
        let store = SqliteTextChunkStore::new(pool);
        let (a, b) = (hash_bytes(b"a"), hash_bytes(b"b"));
        let row = |id: &str, hash: &ContentHash, v: Vec<f32>, ext: &str| TextChunkRecord {
            id: id.to_string(),
            hash: hash.clone(),
            vector: v,
            text: id.to_string(),
            source_uri: "local://x".to_string(),
            name: "x".to_string(),
            extension: ext.to_string(),
        };
        store
            .add(&[
                row("a1", &a, vec![1.0, 0.0], "txt"),
                row("a2", &a, vec![0.0, 1.0], "txt"),
                row("b1", &b, vec![0.9, 0.1], "md"),
            ])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], &SearchFilter::default(), 2)
            .await
            .unwrap();
        assert_eq!(hits[0].record.id, "a1");
        assert_eq!(hits[1].record.id, "b1");
        assert_eq!(hits[0].record.vector, vec![1.0, 0.0]);

        let only_a = SearchFilter {
            hash: Some(a.clone()),
            ..Default::default()
        };
        let hits = store.search(&[1.0, 0.0], &only_a, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        assert_eq!(store.delete_by_hash(&a).await.unwrap(), 2);
        assert_eq!(store.count_by_hash(&b).await.unwrap(), 1);
        assert_eq!(store.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn image_vectors_roundtrip() {
        let (_dir, pool) = pool().await;
        let store = SqliteImageVectorStore::new(pool);
        let h = hash_bytes(b"img");
        store
            .add(&[ImageVectorRecord {
                id: "i1".to_string(),
                hash: h.clone(),
                vector: vec![0.5, 0.5],
                source_uri: "local://a.png".to_string(),
                name: "a.png".to_string(),
                meta_info: "image_file".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(store.count_by_hash(&h).await.unwrap(), 1);
        store.ping().await.unwrap();
        assert_eq!(store.delete_by_hash(&h).await.unwrap(), 1);
    }
}
