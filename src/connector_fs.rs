//! Local filesystem source: turns the paths given on the command line into
//! `(path, name)` inputs for the batch scheduler.
//!
//! Directories are walked recursively. Paths are matched against the
//! include/exclude globs relative to the directory they were found under;
//! files named explicitly are always taken. Dotfiles found while walking
//! are skipped, and version-control and build directories are excluded by
//! default.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A local file to ingest. `name` is the path relative to the walked root
/// (or the bare file name for explicit files) and is what gets recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Empty means every file.
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

pub fn collect_files(paths: &[PathBuf], options: &WalkOptions) -> Result<Vec<LocalFile>> {
    let include_set = if options.include_globs.is_empty() {
        None
    } else {
        Some(build_globset(&options.include_globs)?)
    };

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(options.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            files.push(LocalFile {
                path: root.clone(),
                name: file_name(root),
            });
            continue;
        }
        if !root.is_dir() {
            bail!("Input path does not exist: {}", root.display());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(root).follow_links(options.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if exclude_set.is_match(&rel_str) {
                continue;
            }
            if let Some(ref include) = include_set {
                if !include.is_match(&rel_str) {
                    continue;
                }
            }
            found.push(LocalFile {
                path: path.to_path_buf(),
                name: rel_str,
            });
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        files.extend(found);
    }
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
