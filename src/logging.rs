//! Tracing subscriber setup.
//!
//! All diagnostics go to stderr so that command output on stdout (search
//! hits, JSON summaries) stays machine-readable. `RUST_LOG` overrides the
//! configured level when set, e.g. `RUST_LOG=lake_ingest=debug,sqlx=warn`.

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

pub fn parse_level(s: &str) -> Result<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
    }
}

/// Build the filter: `RUST_LOG` when present, otherwise the configured level
/// with noisy dependencies turned down.
fn build_filter(level: Level) -> Result<EnvFilter> {
    if std::env::var("RUST_LOG").is_ok() {
        return Ok(EnvFilter::from_default_env());
    }
    let mut filter = EnvFilter::new(level.to_string().to_lowercase());
    for directive in ["sqlx=warn", "hyper=warn", "reqwest=warn", "ort=warn"] {
        filter = filter.add_directive(
            directive
                .parse()
                .context("Failed to parse filter directive")?,
        );
    }
    Ok(filter)
}

/// Install the global subscriber. Call once at startup.
///
/// `verbose` bumps the level to `debug` regardless of config.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        parse_level(&config.level)?
    };
    let format: LogFormat = config.format.parse()?;
    let filter = build_filter(level)?;

    match format {
        LogFormat::Text => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .context("Failed to initialize logging")?;
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .context("Failed to initialize logging")?;
        }
    }
    Ok(())
}
