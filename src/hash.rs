//! Content addressing.
//!
//! A file's identity is the SHA-256 of its bytes, read in fixed-size blocks
//! so arbitrarily large files hash in constant memory.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::models::ContentHash;

const BLOCK_SIZE: usize = 64 * 1024;

/// Hash the file at `path`, blocking the current thread.
pub fn compute_hash_blocking(path: &Path) -> io::Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentHash::new(hex::encode(hasher.finalize())))
}

/// Hash the file at `path` on the blocking pool.
pub async fn compute_hash(path: &Path) -> io::Result<ContentHash> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_hash_blocking(&path))
        .await
        .map_err(|e| io::Error::other(format!("hash task failed: {}", e)))?
}

/// Hash an in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    ContentHash::new(hex::encode(Sha256::digest(bytes)))
}
