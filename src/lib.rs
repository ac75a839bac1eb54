//! # Lake Ingest
//!
//! A content-addressed ingestion pipeline for a searchable file lake.
//!
//! Files arrive from local paths, in-memory uploads or an SFTP directory.
//! Each one is hashed (SHA-256), registered, copied to object storage, and
//! written to three independently queried stores: whole raw files, embedded
//! text chunks, and embedded images (image files and rasterized PDF pages).
//! Re-ingesting identical bytes replaces the previous records for that hash
//! instead of duplicating them. Archives are unpacked and their members
//! ingested recursively.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌────────────────────┐
//! │   Sources    │──▶│   Scheduler   │──▶│      Pipeline      │
//! │ FS/Upload/   │   │ N workers +   │   │ hash → raw → text/ │
//! │ SFTP         │   │ progress chan │   │ image/page vectors │
//! └──────────────┘   └───────────────┘   └─────────┬──────────┘
//!                                                  │
//!               ┌──────────────┬───────────────────┼──────────────┐
//!               ▼              ▼                   ▼              ▼
//!         ┌──────────┐  ┌────────────┐   ┌──────────────┐  ┌──────────┐
//!         │ Registry │  │ Raw files  │   │ Text chunks  │  │  Images  │
//!         └──────────┘  └────────────┘   └──────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`context`] | Runtime context shared by every component |
//! | [`pipeline`] | Per-file commit algorithm and delete-by-hash |
//! | [`scheduler`] | Bounded worker pool over a batch |
//! | [`extract`] | Per-format text extraction |
//! | [`archive`] | Archive unpacking |
//! | [`chunk`] | Recursive text splitter |
//! | [`embedding`] | Text and image embedding backends |
//! | [`media`] | Transcription and PDF page rasterization |
//! | [`store`] | Raw-file and vector stores |
//! | [`metadata`] | Hash registry, task stats, entities |
//! | [`object_store`] | S3-compatible object storage |
//! | [`connector_fs`], [`connector_upload`], [`connector_sftp`] | Sources |
//! | [`stats`] | Dashboard statistics |

pub mod archive;
pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod connector_sftp;
pub mod connector_upload;
pub mod context;
pub mod db;
pub mod embedding;
pub mod entities;
pub mod error;
pub mod extract;
pub mod hash;
pub mod logging;
pub mod media;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod object_store;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod search;
pub mod stats;
pub mod store;
