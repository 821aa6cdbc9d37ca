//! Deduplication layers.
//!
//! - **File identity**: a whole-file hash already owned by another path
//!   (looked up through [`Store::find_processed_by_hash`]).
//! - **Logical entity**: the session id embedded in the content, resolved
//!   against stored conversations under a [`DuplicatePolicy`].
//! - **Batch idempotency**: [`BatchCache`] replays the report of a batch id
//!   seen within the TTL.
//!
//! Message-level idempotency (unique sequence numbers) is enforced by the
//! store itself.
//!
//! [`Store::find_processed_by_hash`]: transcript_harness_core::store::Store::find_processed_by_hash

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use transcript_harness_core::models::Conversation;

/// What a full parse does when its session id is already owned by a
/// different source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Leave the stored conversation alone; report a duplicate.
    SkipExisting,
    /// Replace the stored messages; this path becomes the owner.
    ReplaceExisting,
    /// Keep stored messages and add only those past the stored count.
    #[default]
    AppendNew,
}

impl DuplicatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicatePolicy::SkipExisting => "skip-existing",
            DuplicatePolicy::ReplaceExisting => "replace-existing",
            DuplicatePolicy::AppendNew => "append-new",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip-existing" => Ok(DuplicatePolicy::SkipExisting),
            "replace-existing" => Ok(DuplicatePolicy::ReplaceExisting),
            "append-new" => Ok(DuplicatePolicy::AppendNew),
            other => Err(format!(
                "unknown duplicate policy: '{}'. Must be skip-existing, replace-existing, or append-new.",
                other
            )),
        }
    }
}

/// Stable conversation id: the embedded session id, or a path-derived id
/// for formats without one.
pub fn conversation_id(external_id: Option<&str>, path: &str) -> String {
    match external_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => {
            let mut hasher = Sha256::new();
            hasher.update(path.as_bytes());
            let digest = format!("{:x}", hasher.finalize());
            format!("path:{}", &digest[..16])
        }
    }
}

/// Outcome of resolving a fully parsed file against stored conversations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityAction {
    /// New conversation.
    Create,
    /// Replace every stored message.
    Replace,
    /// Add messages past the stored count, keeping the current owner.
    AppendNew { owner: String },
    /// Leave the conversation alone.
    Skip { owner: String },
}

/// Decide how a full parse of `path` applies to `existing`.
///
/// A re-parse of the owning path always replaces; the policy only governs
/// content arriving from a different path.
pub fn resolve_entity(
    existing: Option<&Conversation>,
    path: &str,
    policy: DuplicatePolicy,
) -> EntityAction {
    let conv = match existing {
        Some(c) => c,
        None => return EntityAction::Create,
    };
    if conv.source_path == path {
        return EntityAction::Replace;
    }
    match policy {
        DuplicatePolicy::SkipExisting => EntityAction::Skip {
            owner: conv.source_path.clone(),
        },
        DuplicatePolicy::ReplaceExisting => EntityAction::Replace,
        DuplicatePolicy::AppendNew => EntityAction::AppendNew {
            owner: conv.source_path.clone(),
        },
    }
}

/// TTL cache of batch results keyed by caller-supplied batch id.
pub struct BatchCache<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> BatchCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached result for `batch_id`, if still within the TTL.
    pub fn get(&self, batch_id: &str) -> Option<T> {
        let mut entries = self.entries.lock().ok()?;
        let ttl = self.ttl;
        entries.retain(|_, (at, _)| at.elapsed() < ttl);
        entries.get(batch_id).map(|(_, v)| v.clone())
    }

    pub fn insert(&self, batch_id: impl Into<String>, value: T) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(batch_id.into(), (Instant::now(), value));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
