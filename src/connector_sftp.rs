//! SFTP source: pull every file from one remote directory and ingest it.
//!
//! Unlike the batch scheduler this adapter is strictly sequential. The
//! remote directory is listed once (non-recursively, dotfiles and
//! subdirectories skipped), each file is downloaded in turn into
//! `ingest.temp_dir`, and then each local copy is run through the pipeline
//! one at a time and deleted straight after. The caller gets back a list of
//! human-readable log lines; connection and listing failures end up there
//! too instead of being returned as errors.

use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ssh2::{Session, Sftp};
use tracing::{info, warn};

use crate::models::{IngestionJob, TaskStat, TaskStatus};
use crate::pipeline::Pipeline;
use crate::progress::{ProgressEvent, ProgressSink};

const SSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking access to one remote directory.
pub trait RemoteDirectory {
    /// Names of the regular files directly inside the directory.
    fn list(&mut self) -> Result<Vec<String>>;

    fn download(&mut self, name: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SftpTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub remote_path: String,
}

/// [`RemoteDirectory`] over an `ssh2` SFTP channel with password auth.
pub struct Ssh2Directory {
    // Keeps the transport alive for as long as the channel is used.
    _session: Session,
    sftp: Sftp,
    remote_path: PathBuf,
}

impl Ssh2Directory {
    pub fn connect(target: &SftpTarget) -> Result<Self> {
        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .with_context(|| format!("Failed to connect to {}:{}", target.host, target.port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(SSH_TIMEOUT.as_millis() as u32);
        session.handshake().context("SSH handshake failed")?;
        session
            .userauth_password(&target.username, &target.password)
            .with_context(|| format!("Authentication failed for {}", target.username))?;
        if !session.authenticated() {
            bail!("Authentication failed for {}", target.username);
        }
        let sftp = session.sftp().context("Failed to open SFTP channel")?;
        Ok(Self {
            _session: session,
            sftp,
            remote_path: PathBuf::from(&target.remote_path),
        })
    }
}

impl RemoteDirectory for Ssh2Directory {
    fn list(&mut self) -> Result<Vec<String>> {
        let entries = self
            .sftp
            .readdir(&self.remote_path)
            .with_context(|| format!("Failed to list {}", self.remote_path.display()))?;
        let mut names: Vec<String> = entries
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, _)| path.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn download(&mut self, name: &str, dest: &Path) -> Result<()> {
        let remote = self.remote_path.join(name);
        let mut source = self
            .sftp
            .open(&remote)
            .with_context(|| format!("Failed to open {}", remote.display()))?;
        let mut file = std::fs::File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        io::copy(&mut source, &mut file)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SftpReport {
    pub logs: Vec<String>,
    pub skipped_names: Vec<String>,
    /// Files that produced searchable records.
    pub success_count: u64,
    pub downloaded: usize,
}

/// Opens the remote directory. Runs on the blocking pool.
pub type Connector = Box<dyn FnOnce() -> Result<Box<dyn RemoteDirectory>> + Send>;

/// Ingest `target` over a real SSH connection.
pub async fn run_sftp(
    pipeline: &Arc<Pipeline>,
    target: SftpTarget,
    progress: &ProgressSink,
) -> SftpReport {
    info!(host = %target.host, port = target.port, path = %target.remote_path, "sftp task started");
    let connect: Connector = Box::new(move || {
        let dir: Box<dyn RemoteDirectory> = Box::new(Ssh2Directory::connect(&target)?);
        Ok(dir)
    });
    run_sftp_task(pipeline, connect, progress).await
}

/// Download phase on the blocking pool, then sequential processing.
pub async fn run_sftp_task(
    pipeline: &Arc<Pipeline>,
    connect: Connector,
    progress: &ProgressSink,
) -> SftpReport {
    let started = Instant::now();
    let temp_dir = pipeline.context().settings.temp_dir.clone();
    let sink = progress.clone();

    let download = tokio::task::spawn_blocking(move || download_all(connect, &temp_dir, &sink));
    let Downloaded {
        mut logs,
        files: local_files,
        connected,
    } = match download.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "sftp download task aborted");
            return SftpReport {
                logs: vec![format!("download task failed: {}", e)],
                ..Default::default()
            };
        }
    };

    if !connected {
        return SftpReport {
            logs,
            ..Default::default()
        };
    }

    let mut report = SftpReport {
        downloaded: local_files.len(),
        ..Default::default()
    };
    let total = local_files.len() as u64;
    for (i, (path, name)) in local_files.into_iter().enumerate() {
        let result = pipeline
            .process_isolated(IngestionJob::new(path.clone(), name.clone()))
            .await;
        match result.status {
            TaskStatus::Ok => report.success_count += result.record_count,
            TaskStatus::Skipped => report.skipped_names.push(name.clone()),
            TaskStatus::Error => logs.push(format!("failed {}: {}", name, result.message)),
        }
        progress.send(ProgressEvent::processing(
            i as u64 + 1,
            total,
            format!("process: {}", name),
        ));
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to remove downloaded copy");
        }
    }

    logs.push(format!("stored {} files", report.success_count));
    if !report.skipped_names.is_empty() {
        logs.push(format!(
            "skipped {} files: {}",
            report.skipped_names.len(),
            report.skipped_names.join(", ")
        ));
    }

    let duration = started.elapsed();
    let stat = TaskStat {
        task_type: "sftp".to_string(),
        file_count: report.downloaded as u64,
        success_count: report.success_count,
        duration_seconds: duration.as_secs_f64(),
        timestamp: chrono::Utc::now().timestamp(),
    };
    if let Err(e) = pipeline.context().registry.insert_task_stat(&stat).await {
        warn!(error = %e, "failed to persist sftp stat");
    }
    info!(
        downloaded = report.downloaded,
        success = report.success_count,
        skipped = report.skipped_names.len(),
        seconds = duration.as_secs_f64(),
        "sftp task finished"
    );

    report.logs = logs;
    report
}

struct Downloaded {
    logs: Vec<String>,
    /// `(local path, remote name)` of every file that made it to disk.
    files: Vec<(PathBuf, String)>,
    connected: bool,
}

impl Downloaded {
    fn failed(line: String) -> Self {
        Self {
            logs: vec![line],
            files: Vec::new(),
            connected: false,
        }
    }
}

/// Connect, list and download sequentially.
fn download_all(connect: Connector, temp_dir: &Path, progress: &ProgressSink) -> Downloaded {
    let mut remote = match connect() {
        Ok(remote) => remote,
        Err(e) => {
            warn!(error = %format!("{:#}", e), "sftp connection failed");
            return Downloaded::failed(format!("connection failed: {:#}", e));
        }
    };
    let names: Vec<String> = match remote.list() {
        Ok(names) => names.into_iter().filter(|n| !n.starts_with('.')).collect(),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "sftp listing failed");
            return Downloaded::failed(format!("listing failed: {:#}", e));
        }
    };
    if let Err(e) = std::fs::create_dir_all(temp_dir) {
        return Downloaded::failed(format!("cannot create {}: {}", temp_dir.display(), e));
    }
    let mut logs = vec![format!("found {} files", names.len())];

    let total = names.len() as u64;
    let mut local = Vec::new();
    for (i, name) in names.into_iter().enumerate() {
        let short_id = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let dest = temp_dir.join(format!("{}_{}", short_id, name));
        match remote.download(&name, &dest) {
            Ok(()) => local.push((dest, name.clone())),
            Err(e) => {
                warn!(name = %name, error = %format!("{:#}", e), "sftp download failed");
                logs.push(format!("download failed {}: {:#}", name, e));
                let _ = std::fs::remove_file(&dest);
            }
        }
        progress.send(ProgressEvent::downloading(
            i as u64 + 1,
            total,
            format!("download: {}", name),
        ));
    }
    Downloaded {
        logs,
        files: local,
        connected: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::context::IngestContext;
    use std::collections::BTreeMap;

    struct FakeRemote {
        files: BTreeMap<String, Vec<u8>>,
        broken: Vec<String>,
    }

    impl RemoteDirectory for FakeRemote {
        fn list(&mut self) -> Result<Vec<String>> {
            Ok(self.files.keys().cloned().collect())
        }

        fn download(&mut self, name: &str, dest: &Path) -> Result<()> {
            if self.broken.iter().any(|b| b == name) {
                bail!("permission denied");
            }
            std::fs::write(dest, &self.files[name])?;
            Ok(())
        }
    }

    fn pipeline(temp_dir: PathBuf) -> Arc<Pipeline> {
        let settings = IngestConfig {
            temp_dir,
            ..IngestConfig::default()
        };
        Arc::new(Pipeline::new(Arc::new(
            IngestContext::builder(settings).build(),
        )))
    }

    #[tokio::test]
    async fn downloads_skip_dotfiles_and_clean_up() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("tmp");
        let p = pipeline(temp.clone());

        let mut files = BTreeMap::new();
        files.insert(".hidden".to_string(), b"x".to_vec());
        files.insert("a.bin".to_string(), b"aaa".to_vec());
        files.insert("b.bin".to_string(), b"bbb".to_vec());
        files.insert("c.bin".to_string(), b"ccc".to_vec());
        let remote = FakeRemote {
            files,
            broken: vec!["c.bin".to_string()],
        };

        let report = run_sftp_task(
            &p,
            Box::new(move || -> Result<Box<dyn RemoteDirectory>> { Ok(Box::new(remote)) }),
            &ProgressSink::disabled(),
        )
        .await;

        assert_eq!(report.downloaded, 2);
        assert_eq!(report.skipped_names, vec!["a.bin", "b.bin"]);
        assert!(report.logs.iter().any(|l| l == "found 3 files"));
        assert!(report.logs.iter().any(|l| l.starts_with("download failed c.bin")));
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);

        let stats = p.context().registry.list_recent_task_stats(1).await.unwrap();
        assert_eq!(stats[0].task_type, "sftp");
        assert_eq!(stats[0].file_count, 2);
    }

    #[tokio::test]
    async fn connection_failure_is_a_log_line() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path().to_path_buf());
        let report = run_sftp_task(
            &p,
            Box::new(|| -> Result<Box<dyn RemoteDirectory>> { bail!("connection refused") }),
            &ProgressSink::disabled(),
        )
        .await;
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.logs, vec!["connection failed: connection refused"]);
    }

    struct UnlistableRemote;

    impl RemoteDirectory for UnlistableRemote {
        fn list(&mut self) -> Result<Vec<String>> {
            bail!("no such directory")
        }

        fn download(&mut self, _name: &str, _dest: &Path) -> Result<()> {
            bail!("download attempted after a failed listing")
        }
    }

    #[tokio::test]
    async fn listing_failure_is_a_log_line() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("tmp");
        let p = pipeline(temp.clone());
        let report = run_sftp_task(
            &p,
            Box::new(|| -> Result<Box<dyn RemoteDirectory>> { Ok(Box::new(UnlistableRemote)) }),
            &ProgressSink::disabled(),
        )
        .await;

        assert_eq!(report.logs, vec!["listing failed: no such directory"]);
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.success_count, 0);
        assert!(!temp.exists());
        let stats = p.context().registry.list_recent_task_stats(10).await.unwrap();
        assert!(stats.is_empty());
    }
}
