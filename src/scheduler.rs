//! Bounded worker pool over a batch of inputs.
//!
//! A fixed number of workers pull from one shared queue. Each job runs on
//! its own task through [`Pipeline::process_isolated`], so a panicking job
//! becomes an `error` result and the worker moves on. Every completed job
//! emits exactly one [`ProgressEvent`] whose index is its position in
//! completion order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::models::{IngestionJob, TaskResult, TaskStat, TaskStatus};
use crate::pipeline::Pipeline;
use crate::progress::{ProgressEvent, ProgressSink};

/// One input to a batch.
#[derive(Debug, Clone)]
pub enum BatchItem {
    /// A file already on disk. The caller owns it; it is never deleted here.
    Path { path: PathBuf, name: String },
    /// Bytes received in memory. Staged under `ingest.temp_dir` for the job
    /// and removed afterwards whatever the outcome.
    Upload { name: String, bytes: Vec<u8> },
}

impl BatchItem {
    pub fn name(&self) -> &str {
        match self {
            BatchItem::Path { name, .. } | BatchItem::Upload { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    /// Files that produced searchable records, archive members included.
    pub success_count: u64,
    pub skipped_count: usize,
    pub error_count: usize,
    pub duration: Duration,
    pub skipped_names: Vec<String>,
    /// `(name, result)` in completion order.
    pub results: Vec<(String, TaskResult)>,
}

pub struct BatchScheduler {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
    progress: ProgressSink,
}

impl BatchScheduler {
    /// Worker count comes from `ingest.concurrency`.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let concurrency = pipeline.context().settings.concurrency.max(1);
        Self {
            pipeline,
            concurrency,
            progress: ProgressSink::disabled(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Process every item and persist one `batch` task stat.
    pub async fn run(&self, items: Vec<BatchItem>) -> BatchSummary {
        let started = Instant::now();
        let total = items.len();
        info!(total, workers = self.concurrency, "batch started");

        let queue = Arc::new(Mutex::new(items.into_iter().collect::<VecDeque<_>>()));
        let completed = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency.min(total.max(1)) {
            let queue = Arc::clone(&queue);
            let completed = Arc::clone(&completed);
            let pipeline = Arc::clone(&self.pipeline);
            let progress = self.progress.clone();
            workers.push(tokio::spawn(async move {
                let mut done = Vec::new();
                loop {
                    let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    let Some(item) = next else { break };
                    let name = item.name().to_string();
                    let result = run_item(&pipeline, item).await;
                    let index = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(worker_id, index, name = %name, status = %result.status, "job done");
                    progress.send(ProgressEvent::processing(
                        index,
                        total as u64,
                        result.message.clone(),
                    ));
                    done.push((name, result));
                }
                done
            }));
        }

        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };
        for worker in workers {
            match worker.await {
                Ok(done) => summary.results.extend(done),
                Err(e) => warn!(error = %e, "batch worker aborted"),
            }
        }
        for (name, result) in &summary.results {
            match result.status {
                TaskStatus::Ok => summary.success_count += result.record_count,
                TaskStatus::Skipped => {
                    summary.skipped_count += 1;
                    summary.skipped_names.push(name.clone());
                }
                TaskStatus::Error => summary.error_count += 1,
            }
        }
        summary.duration = started.elapsed();

        info!(
            total,
            success = summary.success_count,
            skipped = summary.skipped_count,
            errors = summary.error_count,
            seconds = summary.duration.as_secs_f64(),
            "batch finished"
        );

        let stat = TaskStat {
            task_type: "batch".to_string(),
            file_count: total as u64,
            success_count: summary.success_count,
            duration_seconds: summary.duration.as_secs_f64(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = self
            .pipeline
            .context()
            .registry
            .insert_task_stat(&stat)
            .await
        {
            warn!(error = %e, "failed to persist batch stat");
        }
        summary
    }
}

async fn run_item(pipeline: &Arc<Pipeline>, item: BatchItem) -> TaskResult {
    match item {
        BatchItem::Path { path, name } => {
            pipeline
                .process_isolated(IngestionJob::new(path, name))
                .await
        }
        BatchItem::Upload { name, bytes } => {
            let temp_dir = &pipeline.context().settings.temp_dir;
            let staged = match stage_upload(temp_dir, &name, &bytes).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to stage upload");
                    return TaskResult::error(format!("{}: failed to stage upload: {}", name, e));
                }
            };
            let result = pipeline
                .process_isolated(IngestionJob::new(staged.clone(), name))
                .await;
            if let Err(e) = tokio::fs::remove_file(&staged).await {
                warn!(path = %staged.display(), error = %e, "failed to remove staged upload");
            }
            result
        }
    }
}

/// Write `bytes` to `<temp_dir>/<8-hex>_<name>`.
pub async fn stage_upload(
    temp_dir: &std::path::Path,
    name: &str,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(temp_dir).await?;
    let base = std::path::Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let short_id = &uuid::Uuid::new_v4().simple().to_string()[..8];
    let path = temp_dir.join(format!("{}_{}", short_id, base));
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}
