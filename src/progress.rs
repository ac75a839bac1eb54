//! Ingestion progress reporting.
//!
//! The scheduler and the SFTP adapter emit one [`ProgressEvent`] per
//! completed job (and per download for SFTP). Events travel over a channel
//! to a single observer task that hands them to a [`ProgressReporter`], so
//! workers never block on terminal output. Reporters write to **stderr** so
//! stdout stays parseable for scripts.

use std::io::Write;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Stage a progress event belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// SFTP transfer of remote files to local temp copies.
    Downloading,
    /// A job finished in the pipeline.
    Processing,
}

/// `completed` is 1-based and follows completion order, not submission order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub completed: u64,
    pub total: u64,
    pub message: String,
}

impl ProgressEvent {
    pub fn processing(completed: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            phase: Phase::Processing,
            completed,
            total,
            message: message.into(),
        }
    }

    pub fn downloading(completed: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            phase: Phase::Downloading,
            completed,
            total,
            message: message.into(),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// "ingest  processing  12 / 1,500  report.pdf: 3 text chunks, 0 image vectors"
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let phase = match event.phase {
            Phase::Downloading => "downloading",
            Phase::Processing => "processing",
        };
        let line = format!(
            "ingest  {}  {} / {}  {}\n",
            phase,
            format_number(event.completed),
            format_number(event.total),
            event.message
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": event.phase,
            "n": event.completed,
            "total": event.total,
            "message": event.message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Sending half handed to workers. Sends never block and never fail the job.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: ProgressEvent) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Spawn the observer task. It runs until every clone of the returned sink
/// is dropped; await the handle to flush the remaining events.
pub fn spawn_observer(reporter: Box<dyn ProgressReporter>) -> (ProgressSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            reporter.report(&event);
        }
    });
    (ProgressSink { tx: Some(tx) }, handle)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// `--progress` values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
