//! In-memory [`Store`] implementation for testing.
//!
//! All state lives in one struct behind a single `RwLock`, so a
//! [`FileCommit`] becomes visible to readers all at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{
    CanonicalArtifact, Checkpoint, Conversation, EnrichmentRecord, IngestionOutcome,
    ParsedMessage, SamplingStrategy,
};

use super::{
    check_checkpoint, check_replace, plan_append, CommitSummary, FileCommit, MessageWrite, Store,
};

#[derive(Default)]
struct State {
    checkpoints: HashMap<String, Checkpoint>,
    conversations: BTreeMap<String, Conversation>,
    messages: HashMap<String, Vec<ParsedMessage>>,
    outcomes: Vec<IngestionOutcome>,
    artifacts: HashMap<(String, String, SamplingStrategy), CanonicalArtifact>,
    enrichments: Vec<EnrichmentRecord>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("store lock poisoned"))
    }

    /// Number of persisted conversations.
    pub fn conversation_count(&self) -> usize {
        self.read().map(|s| s.conversations.len()).unwrap_or(0)
    }

    /// Stored enrichment records, oldest first.
    pub fn enrichments(&self) -> Vec<EnrichmentRecord> {
        self.read().map(|s| s.enrichments.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_checkpoint(&self, file_path: &str) -> Result<Option<Checkpoint>> {
        Ok(self.read()?.checkpoints.get(file_path).cloned())
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.write()?
            .checkpoints
            .insert(checkpoint.file_path.clone(), checkpoint.clone());
        Ok(())
    }

    async fn find_processed_by_hash(
        &self,
        content_hash: &str,
        exclude_path: &str,
    ) -> Result<Option<Checkpoint>> {
        let state = self.read()?;
        let mut matches: Vec<&Checkpoint> = state
            .checkpoints
            .values()
            .filter(|cp| {
                cp.content_hash == content_hash
                    && cp.file_path != exclude_path
                    && cp.conversation_id.is_some()
                    && cp.duplicate_of.is_none()
            })
            .collect();
        matches.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(matches.first().map(|cp| (*cp).clone()))
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.read()?.conversations.get(id).cloned())
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Conversation>> {
        Ok(self
            .read()?
            .conversations
            .values()
            .filter(|c| c.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ParsedMessage>> {
        Ok(self
            .read()?
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit_file(&self, commit: FileCommit) -> Result<CommitSummary> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        check_checkpoint(state.checkpoints.get(&commit.checkpoint.file_path), &commit)?;

        let conv_id = commit.conversation.id.clone();
        let existing = state.conversations.get(&conv_id).cloned();
        let stored = state.messages.entry(conv_id.clone()).or_default();

        let (inserted, rejected) = match &commit.messages {
            MessageWrite::Append(msgs) => {
                let (insert, rejected) = plan_append(stored.len() as i64, msgs)?;
                let n = insert.len();
                stored.extend(insert.into_iter().cloned());
                (n, rejected)
            }
            MessageWrite::Replace(msgs) => {
                check_replace(msgs)?;
                *stored = msgs.clone();
                (msgs.len(), 0)
            }
        };
        let message_count = stored.len() as i64;
        let changed = inserted > 0 || matches!(commit.messages, MessageWrite::Replace(_));

        let upsert = commit.conversation;
        let revision = existing.as_ref().map(|c| c.revision).unwrap_or(0) + i64::from(changed);
        let conversation = Conversation {
            id: conv_id.clone(),
            parent_id: upsert
                .parent_id
                .or_else(|| existing.as_ref().and_then(|c| c.parent_id.clone())),
            source_path: upsert.source_path,
            parser: upsert.parser,
            started_at: match (&commit.messages, existing.as_ref()) {
                (MessageWrite::Append(_), Some(c)) => c.started_at.or(upsert.started_at),
                _ => upsert.started_at,
            },
            ended_at: upsert
                .ended_at
                .or_else(|| existing.as_ref().and_then(|c| c.ended_at)),
            message_count,
            revision,
            updated_at: Utc::now().timestamp(),
        };
        if let (MessageWrite::Replace(_), Some(prev)) = (&commit.messages, existing.as_ref()) {
            if prev.source_path != conversation.source_path {
                if let Some(cp) = state.checkpoints.get_mut(&prev.source_path) {
                    if cp.conversation_id.as_deref() == Some(conv_id.as_str()) {
                        cp.duplicate_of = Some(conversation.source_path.clone());
                    }
                }
            }
        }
        state.conversations.insert(conv_id, conversation);
        state
            .checkpoints
            .insert(commit.checkpoint.file_path.clone(), commit.checkpoint);

        Ok(CommitSummary {
            inserted,
            rejected,
            message_count,
            revision,
        })
    }

    async fn record_outcome(&self, outcome: &IngestionOutcome) -> Result<()> {
        self.write()?.outcomes.push(outcome.clone());
        Ok(())
    }

    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<IngestionOutcome>> {
        Ok(self
            .read()?
            .outcomes
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_artifact(
        &self,
        conversation_id: &str,
        canonical_type: &str,
        strategy: SamplingStrategy,
    ) -> Result<Option<CanonicalArtifact>> {
        let key = (
            conversation_id.to_string(),
            canonical_type.to_string(),
            strategy,
        );
        Ok(self.read()?.artifacts.get(&key).cloned())
    }

    async fn put_artifact(&self, artifact: &CanonicalArtifact) -> Result<()> {
        let key = (
            artifact.conversation_id.clone(),
            artifact.canonical_type.clone(),
            artifact.strategy,
        );
        self.write()?.artifacts.insert(key, artifact.clone());
        Ok(())
    }

    async fn put_enrichment(&self, record: &EnrichmentRecord) -> Result<()> {
        self.write()?.enrichments.push(record.clone());
        Ok(())
    }
}
