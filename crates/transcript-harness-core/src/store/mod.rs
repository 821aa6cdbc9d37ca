//! Storage abstraction for Transcript Harness.
//!
//! The [`Store`] trait defines every persistence operation the ingestion
//! pipeline and artifact builder need, enabling pluggable backends (SQLite
//! in the native crate, in-memory for tests).
//!
//! The per-file write path is a single call, [`Store::commit_file`], which
//! upserts the conversation, writes its messages, and moves the file's
//! checkpoint. Implementations must make all three visible atomically.

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CanonicalArtifact, Checkpoint, Conversation, EnrichmentRecord, IngestionOutcome,
    ParsedMessage, SamplingStrategy,
};

/// Conversation fields written on every commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationUpsert {
    pub id: String,
    pub parent_id: Option<String>,
    pub source_path: String,
    pub parser: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// How a commit changes the conversation's message sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageWrite {
    /// Insert after the existing messages; sequence numbers already stored
    /// are rejected.
    Append(Vec<ParsedMessage>),
    /// Drop every stored message and write these instead.
    Replace(Vec<ParsedMessage>),
}

/// One file's worth of writes, applied in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCommit {
    pub conversation: ConversationUpsert,
    pub messages: MessageWrite,
    pub checkpoint: Checkpoint,
    /// Offset of the checkpoint this pass resumed from. The commit is
    /// refused when the stored checkpoint no longer matches it.
    pub resumed_from: Option<u64>,
}

/// Effect of a committed [`FileCommit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    /// Messages rejected because their sequence number already existed.
    pub rejected: usize,
    pub message_count: i64,
    pub revision: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_checkpoint`](Store::get_checkpoint) | Checkpoint for a path |
/// | [`set_checkpoint`](Store::set_checkpoint) | Record a checkpoint without message writes |
/// | [`find_processed_by_hash`](Store::find_processed_by_hash) | File-identity lookup |
/// | [`get_conversation`](Store::get_conversation) | Conversation by id |
/// | [`list_children`](Store::list_children) | Sub-agent conversations of a parent |
/// | [`get_messages`](Store::get_messages) | Ordered messages of a conversation |
/// | [`commit_file`](Store::commit_file) | Upsert + messages + checkpoint, atomically |
/// | [`record_outcome`](Store::record_outcome) | Append to the ingestion ledger |
/// | [`recent_outcomes`](Store::recent_outcomes) | Read the ledger |
/// | [`get_artifact`](Store::get_artifact) / [`put_artifact`](Store::put_artifact) | Artifact cache |
/// | [`put_enrichment`](Store::put_enrichment) | Persist enrichment output verbatim |
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_checkpoint(&self, file_path: &str) -> Result<Option<Checkpoint>>;

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Find a checkpoint at a path other than `exclude_path` whose content
    /// hash matches and which owns a conversation.
    async fn find_processed_by_hash(
        &self,
        content_hash: &str,
        exclude_path: &str,
    ) -> Result<Option<Checkpoint>>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Conversation>>;

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ParsedMessage>>;

    /// Apply one file's writes atomically.
    ///
    /// A `Replace` that moves a conversation to a new source path also marks
    /// the previous owner's checkpoint as a duplicate of the new owner, so
    /// that path is no longer resumed or used as a file-identity match.
    async fn commit_file(&self, commit: FileCommit) -> Result<CommitSummary>;

    async fn record_outcome(&self, outcome: &IngestionOutcome) -> Result<()>;

    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<IngestionOutcome>>;

    async fn get_artifact(
        &self,
        conversation_id: &str,
        canonical_type: &str,
        strategy: SamplingStrategy,
    ) -> Result<Option<CanonicalArtifact>>;

    async fn put_artifact(&self, artifact: &CanonicalArtifact) -> Result<()>;

    async fn put_enrichment(&self, record: &EnrichmentRecord) -> Result<()>;
}

/// Verify that `commit` may be applied on top of `stored`.
///
/// Enforces resume ordering (an incremental pass must start from the last
/// committed checkpoint) and offset monotonicity for resumed appends. Full
/// passes carry no `resumed_from` and may set a new baseline.
pub fn check_checkpoint(stored: Option<&Checkpoint>, commit: &FileCommit) -> Result<()> {
    if let Some(expected) = commit.resumed_from {
        match stored {
            Some(cp) if cp.last_processed_offset == expected => {}
            Some(cp) => bail!(
                "checkpoint for {} moved from offset {} to {} during the pass",
                cp.file_path,
                expected,
                cp.last_processed_offset
            ),
            None => bail!(
                "checkpoint for {} disappeared during the pass",
                commit.checkpoint.file_path
            ),
        }
    }
    if let (MessageWrite::Append(_), Some(cp), Some(_)) =
        (&commit.messages, stored, commit.resumed_from)
    {
        if commit.checkpoint.last_processed_offset < cp.last_processed_offset
            || commit.checkpoint.last_processed_line < cp.last_processed_line
        {
            bail!(
                "refusing to move checkpoint for {} backwards ({} -> {})",
                cp.file_path,
                cp.last_processed_offset,
                commit.checkpoint.last_processed_offset
            );
        }
    }
    Ok(())
}

/// Split appended messages into those to insert and the number rejected
/// as already stored, enforcing gapless sequence numbers.
pub fn plan_append(
    existing_count: i64,
    messages: &[ParsedMessage],
) -> Result<(Vec<&ParsedMessage>, usize)> {
    let mut next = existing_count;
    let mut rejected = 0;
    let mut insert = Vec::new();
    for m in messages {
        if m.seq < existing_count {
            rejected += 1;
            continue;
        }
        if m.seq != next {
            bail!(
                "sequence gap: expected message {} but got {}",
                next,
                m.seq
            );
        }
        insert.push(m);
        next += 1;
    }
    Ok((insert, rejected))
}

/// Verify that replacement messages are numbered `0..n`.
pub fn check_replace(messages: &[ParsedMessage]) -> Result<()> {
    for (i, m) in messages.iter().enumerate() {
        if m.seq != i as i64 {
            bail!("sequence gap: expected message {} but got {}", i, m.seq);
        }
    }
    Ok(())
}
