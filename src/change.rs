//! Change detection against a file's last checkpoint.
//!
//! Classification is ordered so the common cases stay cheap: a `stat` call
//! decides FULL and TRUNCATE, growth costs one prefix read, and the
//! whole-file hash is only read when sizes collide.

use std::io;
use std::path::Path;

use transcript_harness_core::models::{ChangeKind, Checkpoint};

use crate::fingerprint;

/// Result of classifying one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub kind: ChangeKind,
    /// Size reported by `stat` at detection time.
    pub size: u64,
    /// Whole-file hash, when detection had to compute it.
    pub content_hash: Option<String>,
}

/// Fingerprint settings shared by detection and checkpointing.
#[derive(Debug, Clone, Copy)]
pub struct HashSettings {
    pub partial_hash_bytes: u64,
    pub read_chunk_bytes: usize,
}

/// Classify how `path` changed since `checkpoint`.
pub fn detect_change(
    path: &Path,
    checkpoint: Option<&Checkpoint>,
    settings: HashSettings,
) -> io::Result<Detection> {
    let size = std::fs::metadata(path)?.len();
    let detection = |kind, content_hash| Detection {
        kind,
        size,
        content_hash,
    };

    let cp = match checkpoint {
        Some(cp) => cp,
        None => return Ok(detection(ChangeKind::Full, None)),
    };

    if size < cp.file_size_bytes {
        return Ok(detection(ChangeKind::Truncate, None));
    }

    if size == cp.file_size_bytes {
        let hash = fingerprint::content_hash(path, size, settings.read_chunk_bytes)?;
        let kind = if hash == cp.content_hash {
            ChangeKind::Unchanged
        } else {
            ChangeKind::Rewrite
        };
        return Ok(detection(kind, Some(hash)));
    }

    // Grew. A path whose content belongs to another path's conversation
    // never resumes on its own.
    if cp.duplicate_of.is_some() {
        return Ok(detection(ChangeKind::Rewrite, None));
    }

    let prefix = fingerprint::partial_hash(
        path,
        settings.partial_hash_bytes,
        cp.file_size_bytes,
        settings.read_chunk_bytes,
    )?;
    if prefix == cp.partial_hash {
        Ok(detection(ChangeKind::Append, None))
    } else {
        Ok(detection(ChangeKind::Rewrite, None))
    }
}
