//! File fingerprints.
//!
//! Both the partial and the whole-file hash are SHA-256 over a byte
//! prefix; they differ only in prefix length. Reads are chunked so large
//! transcripts are never loaded into memory at once.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// SHA-256 (hex) of the first `len` bytes of `path`, or of the whole file
/// if it is shorter.
pub fn hash_prefix(path: &Path, len: u64, chunk_bytes: usize) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = file.take(len);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Partial hash as stored in checkpoints: the first
/// `min(prefix_bytes, file_size)` bytes.
pub fn partial_hash(
    path: &Path,
    prefix_bytes: u64,
    file_size: u64,
    chunk_bytes: usize,
) -> io::Result<String> {
    hash_prefix(path, prefix_bytes.min(file_size), chunk_bytes)
}

/// Whole-file hash over exactly `file_size` bytes.
pub fn content_hash(path: &Path, file_size: u64, chunk_bytes: usize) -> io::Result<String> {
    hash_prefix(path, file_size, chunk_bytes)
}
