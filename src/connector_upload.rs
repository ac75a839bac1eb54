//! Local-upload entry points.
//!
//! Files already on disk go to the scheduler as path items and stay owned by
//! the caller. In-memory uploads are staged by the scheduler itself and
//! removed when their job finishes.

use crate::connector_fs::LocalFile;
use crate::scheduler::{BatchItem, BatchScheduler, BatchSummary};

/// Ingest files that are already on disk.
pub async fn ingest_local(scheduler: &BatchScheduler, files: Vec<LocalFile>) -> BatchSummary {
    let items = files
        .into_iter()
        .map(|f| BatchItem::Path {
            path: f.path,
            name: f.name,
        })
        .collect();
    scheduler.run(items).await
}

/// Ingest `(name, bytes)` buffers received from a client.
pub async fn ingest_uploads(
    scheduler: &BatchScheduler,
    uploads: Vec<(String, Vec<u8>)>,
) -> BatchSummary {
    let items = uploads
        .into_iter()
        .map(|(name, bytes)| BatchItem::Upload { name, bytes })
        .collect();
    scheduler.run(items).await
}

/// Result lines printed after a batch.
pub fn summary_lines(summary: &BatchSummary) -> Vec<String> {
    let mut lines = vec![format!(
        "processed {} inputs in {:.1}s",
        summary.total,
        summary.duration.as_secs_f64()
    )];
    lines.push(format!("  indexed files: {}", summary.success_count));
    lines.push(format!("  skipped: {}", summary.skipped_count));
    lines.push(format!("  errors: {}", summary.error_count));
    if !summary.skipped_names.is_empty() {
        lines.push(format!("  skipped files: {}", summary.skipped_names.join(", ")));
    }
    for (name, result) in &summary.results {
        if result.status == crate::models::TaskStatus::Error {
            lines.push(format!("  error {}: {}", name, result.message));
        }
    }
    lines
}
