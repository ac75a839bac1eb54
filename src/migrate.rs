use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to call repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Registry of every content hash that has been seen
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_registry (
            hash TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            size INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_type TEXT NOT NULL,
            file_count INTEGER NOT NULL,
            success_count INTEGER NOT NULL,
            duration_seconds REAL NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash TEXT NOT NULL,
            name TEXT NOT NULL,
            entity_type TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Whole-file records, one per hash
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_files (
            hash TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            extension TEXT NOT NULL,
            source_uri TEXT NOT NULL,
            bytes BLOB NOT NULL,
            full_text TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS text_chunks (
            id TEXT PRIMARY KEY,
            hash TEXT NOT NULL,
            vector BLOB NOT NULL,
            text TEXT NOT NULL,
            source_uri TEXT NOT NULL,
            name TEXT NOT NULL,
            extension TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_vectors (
            id TEXT PRIMARY KEY,
            hash TEXT NOT NULL,
            vector BLOB NOT NULL,
            source_uri TEXT NOT NULL,
            name TEXT NOT NULL,
            meta_info TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_text_chunks_hash ON text_chunks(hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_image_vectors_hash ON image_vectors(hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_entities_hash ON file_entities(hash)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_stats_timestamp ON task_stats(timestamp DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_registry_created_at ON file_registry(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
