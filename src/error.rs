//! Typed errors at the library boundary.
//!
//! Adapters and CLI code use `anyhow`; these enums name the failures the
//! pipeline classifies on.

use thiserror::Error;

/// Causes that make a single job fail outright.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to hash {path}: {source}")]
    Hash {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file is empty: {0}")]
    EmptyRead(String),

    #[error("raw record write failed for {hash}: {reason}")]
    RawWrite { hash: String, reason: String },

    #[error("failed to unpack archive {name}: {reason}")]
    Archive { name: String, reason: String },

    #[error("archive nesting deeper than {limit} at {name}")]
    DepthExceeded { name: String, limit: u32 },
}

/// A backing service could not be reached before ingestion started.
#[derive(Error, Debug)]
#[error("{component} unreachable: {reason}")]
pub struct ConnectivityError {
    pub component: String,
    pub reason: String,
}

impl ConnectivityError {
    pub fn new(component: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            component: component.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure inside one extraction strategy. Turned into a diagnostic by
/// [`crate::extract::ExtractorRegistry::extract`] and never returned to callers.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("{0}")]
    Backend(String),
}

impl From<anyhow::Error> for ExtractError {
    fn from(err: anyhow::Error) -> Self {
        ExtractError::Backend(format!("{:#}", err))
    }
}
