//! Archive unpacking.
//!
//! Each archive is unpacked into its own uniquely named workspace directory
//! under `ingest.extract_dir`. The workspace is a [`TempDir`], so it is removed
//! when the [`ExtractionWorkspace`] is dropped, on success, error or panic
//! unwind alike.
//!
//! Supported: `.zip`, `.tar`, `.tar.gz`/`.tgz`, and bare `.gz`. A bare `.gz`
//! whose payload is a tar stream is unpacked as a tarball; otherwise it is
//! decompressed to a single member named after the archive minus `.gz`.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::models::extension_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    Gz,
}

impl ArchiveKind {
    pub fn for_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            return Some(ArchiveKind::TarGz);
        }
        match extension_of(&lower).as_str() {
            "zip" => Some(ArchiveKind::Zip),
            "tar" => Some(ArchiveKind::Tar),
            "gz" => Some(ArchiveKind::Gz),
            _ => None,
        }
    }
}

/// A regular file found inside an unpacked archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub path: PathBuf,
    /// File name without directories; becomes the member job's original name.
    pub name: String,
}

/// Directory holding one archive's unpacked contents.
pub struct ExtractionWorkspace {
    dir: TempDir,
}

impl ExtractionWorkspace {
    fn create(extract_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(extract_root).with_context(|| {
            format!(
                "Failed to create extraction root {}",
                extract_root.display()
            )
        })?;
        let dir = tempfile::Builder::new()
            .prefix("lake-extract-")
            .tempdir_in(extract_root)
            .context("Failed to create extraction workspace")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Regular files under the workspace in path order, skipping dotfiles.
    /// Files inside hidden directories are still members.
    pub fn members(&self) -> Vec<ArchiveMember> {
        let root = self.dir.path();
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && !is_hidden(e.file_name()))
            .map(|e| ArchiveMember {
                name: e.file_name().to_string_lossy().to_string(),
                path: e.into_path(),
            })
            .collect()
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Unpack `archive` (declared as `name`) into a fresh workspace under `extract_root`.
pub fn unpack(archive: &Path, name: &str, extract_root: &Path) -> Result<ExtractionWorkspace> {
    let Some(kind) = ArchiveKind::for_name(name) else {
        bail!("not a supported archive: {}", name);
    };
    let workspace = ExtractionWorkspace::create(extract_root)?;
    let dest = workspace.path();

    match kind {
        ArchiveKind::Zip => {
            let file = File::open(archive)?;
            let mut zip =
                zip::ZipArchive::new(BufReader::new(file)).context("Failed to read zip archive")?;
            zip.extract(dest).context("Failed to extract zip archive")?;
        }
        ArchiveKind::Tar => {
            let file = File::open(archive)?;
            tar::Archive::new(BufReader::new(file))
                .unpack(dest)
                .context("Failed to extract tar archive")?;
        }
        ArchiveKind::TarGz => {
            let file = File::open(archive)?;
            tar::Archive::new(GzDecoder::new(BufReader::new(file)))
                .unpack(dest)
                .context("Failed to extract tar.gz archive")?;
        }
        ArchiveKind::Gz => unpack_gz(archive, name, dest)?,
    }

    Ok(workspace)
}

/// Decompress a bare `.gz`, then unpack it as a tarball if it is one.
fn unpack_gz(archive: &Path, name: &str, dest: &Path) -> Result<()> {
    let inner_name = gz_member_name(name);
    let inner_path = dest.join(&inner_name);
    {
        let file = File::open(archive)?;
        let mut decoder = GzDecoder::new(BufReader::new(file));
        let mut out = File::create(&inner_path)?;
        std::io::copy(&mut decoder, &mut out).context("Failed to decompress gzip stream")?;
    }

    if is_tar_stream(&inner_path)? {
        let staged = dest.join(".staging.tar");
        std::fs::rename(&inner_path, &staged)?;
        tar::Archive::new(BufReader::new(File::open(&staged)?))
            .unpack(dest)
            .context("Failed to extract tar stream inside gzip")?;
        std::fs::remove_file(&staged)?;
    }
    Ok(())
}

fn gz_member_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let stem = if base.to_lowercase().ends_with(".gz") {
        &base[..base.len() - 3]
    } else {
        base.as_str()
    };
    if stem.is_empty() {
        "decompressed".to_string()
    } else {
        stem.to_string()
    }
}

/// POSIX tar headers carry `ustar` at offset 257.
fn is_tar_stream(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 5];
    if file.metadata()?.len() < 262 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(257))?;
    file.read_exact(&mut magic)?;
    Ok(&magic == b"ustar")
}

/// [`unpack`] on the blocking pool.
pub async fn unpack_async(
    archive: &Path,
    name: &str,
    extract_root: &Path,
) -> Result<ExtractionWorkspace> {
    let archive = archive.to_path_buf();
    let name = name.to_string();
    let extract_root = extract_root.to_path_buf();
    tokio::task::spawn_blocking(move || unpack(&archive, &name, &extract_root)).await?
}
