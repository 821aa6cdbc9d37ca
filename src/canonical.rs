//! Cached canonical artifacts.
//!
//! Artifacts are cached per `(conversation, canonical type, strategy)`.
//! A cached entry is reused only while its source revision, budget, and
//! strategy version still match; otherwise it is rebuilt and replaced.

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::debug;

use transcript_harness_core::models::{CanonicalArtifact, Conversation, SamplingStrategy};
use transcript_harness_core::narrative::{build_artifact, Thread, STRATEGY_VERSION};
use transcript_harness_core::store::Store;

use crate::config::Config;

#[derive(Clone)]
pub struct ArtifactService {
    store: Arc<dyn Store>,
    config: Arc<Config>,
}

impl ArtifactService {
    pub fn new(store: Arc<dyn Store>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Return a fresh artifact, building it if the cache is missing or
    /// stale. The flag is true when the cached copy was reused.
    pub async fn get_or_build(
        &self,
        conversation_id: &str,
        canonical_type: &str,
        strategy: SamplingStrategy,
    ) -> Result<(CanonicalArtifact, bool)> {
        let narrative = self.config.narrative(canonical_type, strategy)?;
        let conversation = match self.store.get_conversation(conversation_id).await? {
            Some(c) => c,
            None => bail!("Conversation not found: {}", conversation_id),
        };
        let children = self.store.list_children(conversation_id).await?;
        let revision = combined_revision(&conversation, &children);

        if let Some(cached) = self
            .store
            .get_artifact(conversation_id, canonical_type, strategy)
            .await?
        {
            if cached.is_fresh(revision, narrative.budget, STRATEGY_VERSION) {
                debug!(conversation = conversation_id, canonical_type, "artifact cache hit");
                return Ok((cached, true));
            }
        }

        let messages = self.store.get_messages(conversation_id).await?;
        let mut child_messages = Vec::with_capacity(children.len());
        for child in &children {
            child_messages.push(self.store.get_messages(&child.id).await?);
        }
        let threads: Vec<Thread<'_>> = children
            .iter()
            .zip(&child_messages)
            .map(|(conversation, messages)| Thread {
                conversation,
                messages,
            })
            .collect();

        let mut artifact = build_artifact(
            Thread {
                conversation: &conversation,
                messages: &messages,
            },
            &threads,
            &narrative,
        );
        artifact.source_revision = revision;
        self.store.put_artifact(&artifact).await?;
        debug!(
            conversation = conversation_id,
            canonical_type,
            tokens = artifact.token_count,
            "artifact rebuilt"
        );
        Ok((artifact, false))
    }
}

/// Revision covering a conversation and its sub-agents. Revisions only
/// grow, so any change to any of them changes the sum.
fn combined_revision(conversation: &Conversation, children: &[Conversation]) -> i64 {
    conversation.revision + children.iter().map(|c| c.revision).sum::<i64>()
}
