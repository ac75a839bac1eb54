//! # Lake Ingest CLI (`lake`)
//!
//! Feeds local files, directory trees and SFTP directories into the data
//! lake, and offers a few read-side commands for checking what landed.
//!
//! ## Usage
//!
//! ```bash
//! lake --config ./config/lake.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lake init` | Create the SQLite database and run schema migrations |
//! | `lake ingest <paths...>` | Ingest files and directory trees through the worker pool |
//! | `lake sftp` | Download and ingest every file in a remote SFTP directory |
//! | `lake delete <hash>` | Remove all records for a content hash |
//! | `lake search "<query>"` | Nearest-neighbor search over text chunks or images |
//! | `lake tasks` | Recent batch and SFTP runs |
//! | `lake stats` | Dashboard totals and daily trend |
//!
//! ## Examples
//!
//! ```bash
//! lake init
//! lake ingest ./inbox --exclude '**/*.tmp' --progress human
//! lake sftp --host files.internal --user etl --path /outgoing
//! lake search "quarterly revenue" --type pdf --limit 5
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::error;

use lake_ingest::config::{self, Config};
use lake_ingest::connector_fs::{self, WalkOptions};
use lake_ingest::connector_sftp::{self, SftpTarget};
use lake_ingest::connector_upload;
use lake_ingest::context::IngestContext;
use lake_ingest::logging;
use lake_ingest::migrate;
use lake_ingest::models::ContentHash;
use lake_ingest::pipeline::Pipeline;
use lake_ingest::progress::{self, ProgressMode};
use lake_ingest::scheduler::BatchScheduler;
use lake_ingest::search::{self, SearchOptions};
use lake_ingest::stats;
use lake_ingest::store::SearchFilter;

/// Lake Ingest: content-addressed ingestion of documents, media and
/// archives into a searchable file lake.
#[derive(Parser)]
#[command(name = "lake", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lake.toml")]
    config: PathBuf,

    /// Log at debug level regardless of `[logging].level`.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest local files and directory trees.
    ///
    /// Directories are walked recursively. Archives (zip, tar, gz, tgz) are
    /// expanded and their members ingested individually.
    Ingest {
        /// Files or directories.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Only take files under directories that match this glob (repeatable).
        #[arg(long)]
        include: Vec<String>,

        /// Skip files under directories that match this glob (repeatable).
        #[arg(long)]
        exclude: Vec<String>,

        /// Worker count. Defaults to `[ingest].concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Ingest every file in a remote SFTP directory, one at a time.
    ///
    /// Missing options fall back to the `[sftp]` config section. The password
    /// may also come from `LAKE_SFTP_PASSWORD`.
    Sftp {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        password: Option<String>,

        /// Remote directory.
        #[arg(long)]
        path: Option<String>,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Delete every record for a content hash from all stores.
    Delete {
        /// Hex SHA-256 content hash.
        hash: String,
    },

    /// Search indexed content.
    Search {
        query: String,

        /// Search image vectors (image files and PDF pages) instead of text chunks.
        #[arg(long)]
        images: bool,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Text: restrict to an extension (`pdf`). Images: restrict to a
        /// meta label (`image_file`, `Page 1`).
        #[arg(long = "type")]
        label: Option<String>,

        /// Restrict to one content hash.
        #[arg(long)]
        hash: Option<String>,
    },

    /// Show recent ingestion runs.
    Tasks {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Dashboard totals and per-day trend.
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "lake", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging, cli.verbose)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ingest {
            paths,
            include,
            exclude,
            concurrency,
            progress: progress_mode,
        } => {
            let files = connector_fs::collect_files(
                &paths,
                &WalkOptions {
                    include_globs: include,
                    exclude_globs: exclude,
                    follow_symlinks: false,
                },
            )?;
            let Some(ctx) = connected_context(&cfg).await? else {
                return Ok(ExitCode::FAILURE);
            };
            let pipeline = Arc::new(Pipeline::new(Arc::clone(&ctx)));
            let mode = progress_mode.unwrap_or_else(ProgressMode::default_for_tty);
            let (sink, observer) = progress::spawn_observer(mode.reporter());

            let mut scheduler = BatchScheduler::new(pipeline).with_progress(sink);
            if let Some(n) = concurrency {
                scheduler = scheduler.with_concurrency(n);
            }
            let summary = connector_upload::ingest_local(&scheduler, files).await;
            drop(scheduler);
            let _ = observer.await;

            for line in connector_upload::summary_lines(&summary) {
                println!("{}", line);
            }
            ctx.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sftp {
            host,
            port,
            user,
            password,
            path,
            progress: progress_mode,
        } => {
            let target = sftp_target(&cfg, host, port, user, password, path)?;
            let Some(ctx) = connected_context(&cfg).await? else {
                return Ok(ExitCode::FAILURE);
            };
            let pipeline = Arc::new(Pipeline::new(Arc::clone(&ctx)));
            let mode = progress_mode.unwrap_or_else(ProgressMode::default_for_tty);
            let (sink, observer) = progress::spawn_observer(mode.reporter());

            let report = connector_sftp::run_sftp(&pipeline, target, &sink).await;
            drop(sink);
            let _ = observer.await;

            for line in &report.logs {
                println!("{}", line);
            }
            ctx.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { hash } => {
            let ctx = Arc::new(IngestContext::from_config(&cfg).await?);
            let pipeline = Pipeline::new(Arc::clone(&ctx));
            let report = pipeline.delete_by_hash(&ContentHash::new(hash.trim().to_lowercase())).await;
            ctx.shutdown().await;
            if report.is_success() {
                println!("deleted {}", hash);
                println!("  text chunks: {}", report.text_chunks);
                println!("  image vectors: {}", report.image_vectors);
                println!("  raw files: {}", report.raw_files);
                Ok(ExitCode::SUCCESS)
            } else {
                println!("partial delete of {}", hash);
                for (store, reason) in &report.failures {
                    println!("  {} failed: {}", store, reason);
                }
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Search {
            query,
            images,
            limit,
            label,
            hash,
        } => {
            let ctx = IngestContext::from_config(&cfg).await?;
            let options = SearchOptions {
                images,
                limit,
                filter: SearchFilter {
                    hash: hash.map(|h| ContentHash::new(h.trim().to_lowercase())),
                    label: label.map(|l| if images { l } else { l.to_lowercase() }),
                },
            };
            let result = search::run_search(&ctx, &query, &options).await;
            ctx.shutdown().await;
            result?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tasks { limit } => {
            let ctx = IngestContext::from_config(&cfg).await?;
            let rows = ctx.registry.list_recent_task_stats(limit).await?;
            ctx.shutdown().await;
            if rows.is_empty() {
                println!("No tasks recorded.");
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "{:<20} {:<6} {:>7} {:>7} {:>9}",
                "TIME", "TYPE", "FILES", "OK", "SECONDS"
            );
            for row in rows {
                let when = chrono::DateTime::from_timestamp(row.timestamp, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!(
                    "{:<20} {:<6} {:>7} {:>7} {:>9.2}",
                    when, row.task_type, row.file_count, row.success_count, row.duration_seconds
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats { days } => {
            let ctx = IngestContext::from_config(&cfg).await?;
            let now = chrono::Utc::now();
            let dashboard = stats::dashboard(ctx.registry.as_ref(), now).await?;
            let trend = stats::task_trend(ctx.registry.as_ref(), days, now).await?;
            ctx.shutdown().await;
            stats::print_dashboard(&dashboard, &trend);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

/// Build the context and check every backing service. Prints the failure
/// and returns `None` when something is unreachable.
async fn connected_context(cfg: &Config) -> Result<Option<Arc<IngestContext>>> {
    let ctx = IngestContext::from_config(cfg).await?;
    if let Err(e) = ctx.check_connectivity().await {
        error!(component = %e.component, reason = %e.reason, "connectivity check failed");
        eprintln!("Error: {}", e);
        ctx.shutdown().await;
        return Ok(None);
    }
    Ok(Some(Arc::new(ctx)))
}

fn sftp_target(
    cfg: &Config,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    path: Option<String>,
) -> Result<SftpTarget> {
    let defaults = cfg.sftp.as_ref();
    let host = host
        .or_else(|| defaults.map(|d| d.host.clone()))
        .context("--host is required when [sftp] is not configured")?;
    let username = user
        .or_else(|| defaults.map(|d| d.username.clone()))
        .context("--user is required when [sftp] is not configured")?;
    let password = password
        .or_else(|| std::env::var("LAKE_SFTP_PASSWORD").ok())
        .context("--password or LAKE_SFTP_PASSWORD is required")?;
    Ok(SftpTarget {
        host,
        port: port.or_else(|| defaults.map(|d| d.port)).unwrap_or(22),
        username,
        password,
        remote_path: path
            .or_else(|| defaults.map(|d| d.remote_path.clone()))
            .unwrap_or_else(|| ".".to_string()),
    })
}
