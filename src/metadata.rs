//! Metadata registry: the relational record of which content hashes exist,
//! per-run task statistics and extracted entities.
//!
//! [`MetadataRegistry::register`] is idempotent; registering a hash twice is
//! a no-op success. The pipeline uses [`MetadataRegistry::exists`] to decide
//! whether a file is a re-ingestion that must replace existing records.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{ContentHash, FileEntity, TaskStat};

#[async_trait]
pub trait MetadataRegistry: Send + Sync {
    async fn exists(&self, hash: &ContentHash) -> Result<bool>;

    /// Record a hash. Duplicate registration succeeds without changing the row.
    async fn register(&self, hash: &ContentHash, name: &str, size: u64) -> Result<()>;

    /// Remove the registry row and any entities recorded for the hash.
    async fn remove(&self, hash: &ContentHash) -> Result<()>;

    async fn insert_task_stat(&self, stat: &TaskStat) -> Result<()>;

    /// Most recent first.
    async fn list_recent_task_stats(&self, limit: usize) -> Result<Vec<TaskStat>>;

    /// Task stats with `timestamp >= since`, oldest first.
    async fn task_stats_since(&self, since: i64) -> Result<Vec<TaskStat>>;

    /// Number of registered hashes, optionally only those first seen at or after `since`.
    async fn count_registered(&self, since: Option<i64>) -> Result<u64>;

    /// Replace every entity recorded for `hash` with `entities`.
    async fn replace_entities(&self, hash: &ContentHash, entities: &[FileEntity]) -> Result<()>;

    async fn list_entities(&self, hash: &ContentHash) -> Result<Vec<FileEntity>>;

    /// Cheap round-trip used by connectivity checks.
    async fn ping(&self) -> Result<()>;
}

/// Registry backed by the `file_registry`, `task_stats` and `file_entities` tables.
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_stat(row: &sqlx::sqlite::SqliteRow) -> TaskStat {
    TaskStat {
        task_type: row.get("task_type"),
        file_count: row.get::<i64, _>("file_count").max(0) as u64,
        success_count: row.get::<i64, _>("success_count").max(0) as u64,
        duration_seconds: row.get("duration_seconds"),
        timestamp: row.get("timestamp"),
    }
}

#[async_trait]
impl MetadataRegistry for SqliteRegistry {
    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        let found: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM file_registry WHERE hash = ?")
                .bind(hash.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn register(&self, hash: &ContentHash, name: &str, size: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_registry (hash, name, size, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(hash) DO NOTHING
            "#,
        )
        .bind(hash.as_str())
        .bind(name)
        .bind(size as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, hash: &ContentHash) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM file_entities WHERE hash = ?")
            .bind(hash.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_registry WHERE hash = ?")
            .bind(hash.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_task_stat(&self, stat: &TaskStat) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_stats (task_type, file_count, success_count, duration_seconds, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stat.task_type)
        .bind(stat.file_count as i64)
        .bind(stat.success_count as i64)
        .bind(stat.duration_seconds)
        .bind(stat.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_recent_task_stats(&self, limit: usize) -> Result<Vec<TaskStat>> {
        let rows = sqlx::query(
            r#"
            SELECT task_type, file_count, success_count, duration_seconds, timestamp
            FROM task_stats
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_stat).collect())
    }

    async fn task_stats_since(&self, since: i64) -> Result<Vec<TaskStat>> {
        let rows = sqlx::query(
            r#"
            SELECT task_type, file_count, success_count, duration_seconds, timestamp
            FROM task_stats
            WHERE timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_stat).collect())
    }

    async fn count_registered(&self, since: Option<i64>) -> Result<u64> {
        let count: i64 = match since {
            Some(ts) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM file_registry WHERE created_at >= ?")
                    .bind(ts)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM file_registry")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count.max(0) as u64)
    }

    async fn replace_entities(&self, hash: &ContentHash, entities: &[FileEntity]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM file_entities WHERE hash = ?")
            .bind(hash.as_str())
            .execute(&mut *tx)
            .await?;
        for entity in entities {
            sqlx::query("INSERT INTO file_entities (hash, name, entity_type) VALUES (?, ?, ?)")
                .bind(hash.as_str())
                .bind(&entity.name)
                .bind(&entity.entity_type)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_entities(&self, hash: &ContentHash) -> Result<Vec<FileEntity>> {
        let rows =
            sqlx::query("SELECT name, entity_type FROM file_entities WHERE hash = ? ORDER BY id")
                .bind(hash.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| FileEntity {
                name: row.get("name"),
                entity_type: row.get("entity_type"),
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct Registration {
    created_at: i64,
}

/// In-memory registry for tests and dry runs.
#[derive(Default)]
pub struct MemoryRegistry {
    files: RwLock<HashMap<ContentHash, Registration>>,
    stats: RwLock<Vec<TaskStat>>,
    entities: RwLock<HashMap<ContentHash, Vec<FileEntity>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataRegistry for MemoryRegistry {
    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.files.read().await.contains_key(hash))
    }

    async fn register(&self, hash: &ContentHash, _name: &str, _size: u64) -> Result<()> {
        self.files
            .write()
            .await
            .entry(hash.clone())
            .or_insert_with(|| Registration {
                created_at: chrono::Utc::now().timestamp(),
            });
        Ok(())
    }

    async fn remove(&self, hash: &ContentHash) -> Result<()> {
        self.entities.write().await.remove(hash);
        self.files.write().await.remove(hash);
        Ok(())
    }

    async fn insert_task_stat(&self, stat: &TaskStat) -> Result<()> {
        self.stats.write().await.push(stat.clone());
        Ok(())
    }

    async fn list_recent_task_stats(&self, limit: usize) -> Result<Vec<TaskStat>> {
        let stats = self.stats.read().await;
        let mut recent: Vec<TaskStat> = stats.iter().rev().cloned().collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn task_stats_since(&self, since: i64) -> Result<Vec<TaskStat>> {
        let stats = self.stats.read().await;
        let mut out: Vec<TaskStat> = stats
            .iter()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }

    async fn count_registered(&self, since: Option<i64>) -> Result<u64> {
        let files = self.files.read().await;
        let count = match since {
            Some(ts) => files.values().filter(|r| r.created_at >= ts).count(),
            None => files.len(),
        };
        Ok(count as u64)
    }

    async fn replace_entities(&self, hash: &ContentHash, entities: &[FileEntity]) -> Result<()> {
        self.entities
            .write()
            .await
            .insert(hash.clone(), entities.to_vec());
        Ok(())
    }

    async fn list_entities(&self, hash: &ContentHash) -> Result<Vec<FileEntity>> {
        Ok(self
            .entities
            .read()
            .await
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    async fn sqlite_registry() -> (tempfile::TempDir, SqliteRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("lake.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        (dir, SqliteRegistry::new(pool))
    }

    fn entity(name: &str, kind: &str) -> FileEntity {
        FileEntity {
            name: name.to_string(),
            entity_type: kind.to_string(),
        }
    }

    async fn exercise(registry: &dyn MetadataRegistry) {
        let hash = hash_bytes(b"registry");
        assert!(!registry.exists(&hash).await.unwrap());

        registry.register(&hash, "a.txt", 8).await.unwrap();
        // duplicate registration is a benign success
        registry.register(&hash, "b.txt", 8).await.unwrap();
        assert!(registry.exists(&hash).await.unwrap());
        assert_eq!(registry.count_registered(None).await.unwrap(), 1);

        registry
            .replace_entities(&hash, &[entity("Acme", "ORG"), entity("Paris", "LOC")])
            .await
            .unwrap();
        registry
            .replace_entities(&hash, &[entity("Acme", "ORG")])
            .await
            .unwrap();
        assert_eq!(registry.list_entities(&hash).await.unwrap().len(), 1);

        registry.remove(&hash).await.unwrap();
        assert!(!registry.exists(&hash).await.unwrap());
        assert!(registry.list_entities(&hash).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_registry_lifecycle() {
        exercise(&MemoryRegistry::new()).await;
    }

    #[tokio::test]
    async fn sqlite_registry_lifecycle() {
        let (_dir, registry) = sqlite_registry().await;
        exercise(&registry).await;
        registry.ping().await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_task_stats_most_recent_first() {
        let (_dir, registry) = sqlite_registry().await;
        for (i, ts) in [100_i64, 300, 200].iter().enumerate() {
            registry
                .insert_task_stat(&TaskStat {
                    task_type: "batch".to_string(),
                    file_count: i as u64 + 1,
                    success_count: i as u64,
                    duration_seconds: 1.5,
                    timestamp: *ts,
                })
                .await
                .unwrap();
        }
        let recent = registry.list_recent_task_stats(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, 300);
        assert_eq!(recent[1].timestamp, 200);

        let since = registry.task_stats_since(150).await.unwrap();
        assert_eq!(
            since.iter().map(|s| s.timestamp).collect::<Vec<_>>(),
            vec![200, 300]
        );
    }
}
