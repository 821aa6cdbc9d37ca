//! Ingestion pipeline orchestration.
//!
//! Runs each file through detect → select → parse → dedupe → persist →
//! hand off, timing every stage. Files are independent: one file's failure
//! is recorded in the ledger and never touches another file's state.
//!
//! # Concurrency
//!
//! [`Ingestor::ingest_batch`] runs files on a bounded pool (`[ingest]
//! workers`). A per-path async mutex keeps two workers off the same file,
//! so checkpoint updates never race. Parsing and hashing run under
//! `spawn_blocking`.
//!
//! # Resumption
//!
//! An APPEND resumes from the last committed checkpoint when the file's
//! parser supports it for that file. Any resume failure falls back to a
//! full pass. The checkpoint only moves when a commit succeeds.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use transcript_harness_core::models::{
    ChangeKind, Checkpoint, Conversation, IngestionOutcome, IngestionStatus, ParsedMessage,
    Stage, StageTiming,
};
use transcript_harness_core::store::{ConversationUpsert, FileCommit, MessageWrite, Store};

use crate::change::{detect_change, HashSettings};
use crate::config::IngestConfig;
use crate::dedup::{conversation_id, resolve_entity, BatchCache, DuplicatePolicy, EntityAction};
use crate::enrich::EnrichmentQueue;
use crate::error::IngestError;
use crate::fingerprint;
use crate::parser::{
    Capability, ConversationParser, IncrementalResult, ParseOptions, ParserRegistry, Prefilter,
};
use crate::progress::{IngestProgressEvent, IngestProgressReporter, NoProgress};

/// Pipeline settings, usually taken from `[ingest]`.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub prefilter: Prefilter,
    pub hashing: HashSettings,
    pub policy: DuplicatePolicy,
    pub workers: usize,
    pub batch_ttl: Duration,
    pub keep_raw: bool,
}

impl IngestSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            prefilter: Prefilter {
                lines: config.prefilter_lines,
                markers: config.marker_fields.clone(),
                chunk_bytes: config.read_chunk_bytes,
            },
            hashing: HashSettings {
                partial_hash_bytes: config.partial_hash_bytes,
                read_chunk_bytes: config.read_chunk_bytes,
            },
            policy: config.duplicate_policy,
            workers: config.workers,
            batch_ttl: Duration::from_secs(config.batch_ttl_secs),
            keep_raw: config.keep_raw,
        }
    }

    fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            read_chunk_bytes: self.hashing.read_chunk_bytes,
            partial_hash_bytes: self.hashing.partial_hash_bytes,
            keep_raw: self.keep_raw,
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

/// Result of one batch: an outcome per unique path plus counters.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub outcomes: Vec<IngestionOutcome>,
    pub success: usize,
    pub duplicate: usize,
    pub skipped: usize,
    pub failed: usize,
    pub messages_added: usize,
    /// True when this report came from the batch cache.
    pub replayed: bool,
}

impl BatchReport {
    fn from_outcomes(batch_id: String, outcomes: Vec<IngestionOutcome>) -> Self {
        let count = |s: IngestionStatus| outcomes.iter().filter(|o| o.status == s).count();
        Self {
            success: count(IngestionStatus::Success),
            duplicate: count(IngestionStatus::Duplicate),
            skipped: count(IngestionStatus::Skipped),
            failed: count(IngestionStatus::Failed),
            messages_added: outcomes.iter().map(|o| o.messages_added).sum(),
            batch_id,
            outcomes,
            replayed: false,
        }
    }
}

/// One async mutex per canonical path.
#[derive(Default)]
struct PathLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PathLocks {
    fn acquire(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        map.entry(key.to_string()).or_default().clone()
    }
}

/// The ingestion orchestrator. Cheap to clone; clones share locks, the
/// batch cache, and the enrichment queue.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    registry: Arc<ParserRegistry>,
    settings: Arc<IngestSettings>,
    locks: Arc<PathLocks>,
    batches: Arc<BatchCache<BatchReport>>,
    enrichment: Option<EnrichmentQueue>,
    progress: Arc<dyn IngestProgressReporter>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, registry: ParserRegistry, settings: IngestSettings) -> Self {
        let batches = BatchCache::new(settings.batch_ttl);
        Self {
            store,
            registry: Arc::new(registry),
            settings: Arc::new(settings),
            locks: Arc::new(PathLocks::default()),
            batches: Arc::new(batches),
            enrichment: None,
            progress: Arc::new(NoProgress),
        }
    }

    /// Hand committed conversations to this queue.
    pub fn with_enrichment(mut self, queue: EnrichmentQueue) -> Self {
        self.enrichment = Some(queue);
        self
    }

    pub fn with_progress(mut self, reporter: Box<dyn IngestProgressReporter>) -> Self {
        self.progress = Arc::from(reporter);
        self
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    /// Ingest one file and record its outcome.
    pub async fn ingest_file(&self, path: &Path) -> IngestionOutcome {
        self.process(path_key(path), None).await
    }

    /// Ingest a set of files on the worker pool.
    ///
    /// A `batch_id` seen within the TTL returns the cached report without
    /// touching any file. Paths naming the same file are attempted once.
    pub async fn ingest_batch(&self, paths: &[PathBuf], batch_id: Option<&str>) -> BatchReport {
        if let Some(id) = batch_id {
            if let Some(mut cached) = self.batches.get(id) {
                info!(batch = id, "replaying cached batch report");
                cached.replayed = true;
                return cached;
            }
        }
        let id = batch_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut seen = HashSet::new();
        let keys: Vec<String> = paths
            .iter()
            .map(|p| path_key(p))
            .filter(|k| seen.insert(k.clone()))
            .collect();
        let total = keys.len() as u64;

        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut tasks = JoinSet::new();
        for (index, key) in keys.iter().cloned().enumerate() {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let batch = id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, this.process(key, Some(batch)).await)
            });
        }

        let mut slots: Vec<Option<IngestionOutcome>> = vec![None; keys.len()];
        let mut done = 0u64;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    done += 1;
                    self.progress.report(IngestProgressEvent::FileDone {
                        path: outcome.file_path.clone(),
                        status: outcome.status,
                        n: done,
                        total,
                    });
                    slots[index] = Some(outcome);
                }
                Err(e) => warn!(batch = %id, error = %e, "ingest task failed"),
            }
        }

        let mut outcomes = Vec::with_capacity(keys.len());
        for (slot, key) in slots.into_iter().zip(keys) {
            let outcome = match slot {
                Some(o) => o,
                None => {
                    let mut o = IngestionOutcome::new(key)
                        .finish(IngestionStatus::Failed, "worker task aborted");
                    o.batch_id = Some(id.clone());
                    if let Err(e) = self.store.record_outcome(&o).await {
                        warn!(path = %o.file_path, error = %format!("{:#}", e), "failed to record outcome");
                    }
                    o
                }
            };
            outcomes.push(outcome);
        }

        let report = BatchReport::from_outcomes(id, outcomes);
        if batch_id.is_some() {
            self.batches.insert(report.batch_id.clone(), report.clone());
        }
        report
    }

    async fn process(&self, key: String, batch_id: Option<String>) -> IngestionOutcome {
        let lock = self.locks.acquire(&key);
        let _guard = lock.lock().await;

        let mut outcome = IngestionOutcome::new(key.clone());
        outcome.batch_id = batch_id;
        if let Err(e) = self.run(Path::new(&key), &key, &mut outcome).await {
            outcome.status = e.status();
            outcome.reason = e.to_string();
        }

        match outcome.status {
            IngestionStatus::Failed => {
                warn!(path = %key, reason = %outcome.reason, "ingest failed")
            }
            IngestionStatus::Success => info!(
                path = %key,
                change = ?outcome.change,
                parser = ?outcome.parser,
                messages = outcome.messages_added,
                "ingested"
            ),
            status => debug!(path = %key, status = %status, reason = %outcome.reason, "ingest finished"),
        }
        if let Err(e) = self.store.record_outcome(&outcome).await {
            warn!(path = %key, error = %format!("{:#}", e), "failed to record outcome");
        }
        outcome
    }

    async fn run(
        &self,
        path: &Path,
        key: &str,
        outcome: &mut IngestionOutcome,
    ) -> Result<(), IngestError> {
        let started = Instant::now();
        let checkpoint = self
            .store
            .get_checkpoint(key)
            .await
            .map_err(IngestError::Persist)?;
        let detection = {
            let owned = path.to_path_buf();
            let stored = checkpoint.clone();
            let hashing = self.settings.hashing;
            blocking(move || Ok(detect_change(&owned, stored.as_ref(), hashing)?)).await?
        };
        lap(outcome, Stage::Detect, started);
        outcome.change = Some(detection.kind);

        if detection.kind == ChangeKind::Unchanged {
            if let Some(cp) = &checkpoint {
                outcome.parser = Some(cp.parser.clone());
                outcome.conversation_id = cp.conversation_id.clone();
            }
            outcome.status = IngestionStatus::Skipped;
            outcome.reason = "unchanged since last checkpoint".to_string();
            return Ok(());
        }

        // A grown duplicate goes back through dedup rather than extending
        // the owner's conversation directly.
        if detection.kind == ChangeKind::Append {
            if let Some(cp) = checkpoint.as_ref().filter(|cp| cp.duplicate_of.is_none()) {
                if let Some(conv) = self.owned_conversation(cp).await? {
                    if let Some((name, delta)) = self.resume(path, cp, outcome).await? {
                        return self.commit_delta(path, key, cp, conv, name, delta, outcome).await;
                    }
                }
            }
        }

        self.full_pass(path, key, outcome).await
    }

    /// Conversation this checkpoint's appends extend, if the path still
    /// owns it. A conversation taken over by another path is resolved again
    /// by a full pass under the duplicate policy.
    async fn owned_conversation(&self, cp: &Checkpoint) -> Result<Option<Conversation>, IngestError> {
        let id = match &cp.conversation_id {
            Some(id) => id,
            None => return Ok(None),
        };
        let conv = self
            .store
            .get_conversation(id)
            .await
            .map_err(IngestError::Persist)?;
        Ok(conv.filter(|c| c.source_path == cp.file_path))
    }

    /// Try an incremental pass. `None` means fall back to a full pass.
    async fn resume(
        &self,
        path: &Path,
        cp: &Checkpoint,
        outcome: &mut IngestionOutcome,
    ) -> Result<Option<(String, IncrementalResult)>, IngestError> {
        let started = Instant::now();
        let parser = match self.registry.find(&cp.parser) {
            Some(p) if p.metadata().has(Capability::Incremental) => p,
            _ => {
                debug!(path = %path.display(), parser = %cp.parser, "parser cannot resume");
                return Ok(None);
            }
        };
        let name = parser.metadata().name.clone();
        outcome.parser = Some(name.clone());
        lap(outcome, Stage::Select, started);

        let started = Instant::now();
        let opts = self.settings.parse_options();
        let (offset, line) = (cp.last_processed_offset, cp.last_processed_line);
        let owned = path.to_path_buf();
        let result = blocking(move || {
            if !parser.supports_incremental(&owned) {
                return Ok(None);
            }
            Ok(Some(parser.parse_incremental(&owned, offset, line, &opts)))
        })
        .await?;
        lap(outcome, Stage::Parse, started);

        match result {
            Some(Ok(delta)) => Ok(Some((name, delta))),
            Some(Err(e)) => {
                warn!(
                    path = %path.display(),
                    parser = %name,
                    error = %e,
                    "incremental parse failed, falling back to full pass"
                );
                Ok(None)
            }
            None => {
                debug!(path = %path.display(), parser = %name, "file is not append-safe");
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_delta(
        &self,
        path: &Path,
        key: &str,
        cp: &Checkpoint,
        conv: Conversation,
        parser: String,
        delta: IncrementalResult,
        outcome: &mut IngestionOutcome,
    ) -> Result<(), IngestError> {
        let started = Instant::now();
        let mut messages = delta.new_messages;
        for (i, m) in messages.iter_mut().enumerate() {
            m.seq = conv.message_count + i as i64;
        }
        let (started_at, ended_at) = merge_span(conv.started_at, conv.ended_at, &messages);
        lap(outcome, Stage::Dedupe, started);

        let started = Instant::now();
        let content_hash = {
            let owned = path.to_path_buf();
            let (size, chunk) = (delta.file_size, self.settings.hashing.read_chunk_bytes);
            blocking(move || Ok(fingerprint::content_hash(&owned, size, chunk)?)).await?
        };
        let commit = FileCommit {
            conversation: ConversationUpsert {
                id: conv.id.clone(),
                parent_id: conv.parent_id.clone(),
                source_path: conv.source_path.clone(),
                parser: parser.clone(),
                started_at,
                ended_at,
            },
            messages: MessageWrite::Append(messages),
            checkpoint: Checkpoint {
                file_path: key.to_string(),
                content_hash,
                file_size_bytes: delta.file_size,
                last_processed_offset: delta.new_offset,
                last_processed_line: delta.new_line,
                partial_hash: delta.new_partial_hash,
                parser,
                conversation_id: Some(conv.id.clone()),
                duplicate_of: None,
                updated_at: Utc::now().timestamp(),
            },
            resumed_from: Some(cp.last_processed_offset),
        };
        let summary = self
            .store
            .commit_file(commit)
            .await
            .map_err(IngestError::Persist)?;
        lap(outcome, Stage::Persist, started);

        self.hand_off(&conv.id, summary.inserted > 0, outcome);
        outcome.conversation_id = Some(conv.id);
        outcome.messages_added = summary.inserted;
        let mut reason = format!(
            "appended {} messages from offset {}",
            summary.inserted, cp.last_processed_offset
        );
        if delta.malformed_records > 0 {
            reason.push_str(&format!(", {} malformed records skipped", delta.malformed_records));
        }
        outcome.status = IngestionStatus::Success;
        outcome.reason = reason;
        Ok(())
    }

    async fn full_pass(
        &self,
        path: &Path,
        key: &str,
        outcome: &mut IngestionOutcome,
    ) -> Result<(), IngestError> {
        let started = Instant::now();
        let probe = {
            let owned = path.to_path_buf();
            let prefilter = self.settings.prefilter.clone();
            blocking(move || Ok(prefilter.probe(&owned)?)).await?
        };
        if !self.settings.prefilter.is_conversational(&probe) {
            lap(outcome, Stage::Select, started);
            return Err(IngestError::MetadataOnly {
                lines: self.settings.prefilter.lines,
            });
        }
        let parser = self
            .registry
            .select(&probe)
            .ok_or(IngestError::UnsupportedFormat)?;
        let name = parser.metadata().name.clone();
        outcome.parser = Some(name.clone());
        lap(outcome, Stage::Select, started);

        let started = Instant::now();
        let opts = self.settings.parse_options();
        let owned = path.to_path_buf();
        let (parsed, file_size, content_hash, partial_hash) = blocking(move || {
            let parsed = parse_with(parser.as_ref(), &owned, &opts)?;
            let size = std::fs::metadata(&owned)?.len().max(parsed.end_offset);
            let content = fingerprint::content_hash(&owned, size, opts.read_chunk_bytes)?;
            let partial = fingerprint::partial_hash(
                &owned,
                opts.partial_hash_bytes,
                size,
                opts.read_chunk_bytes,
            )?;
            Ok((parsed, size, content, partial))
        })
        .await?;
        lap(outcome, Stage::Parse, started);

        let started = Instant::now();
        let base = Checkpoint {
            file_path: key.to_string(),
            content_hash,
            file_size_bytes: file_size,
            last_processed_offset: parsed.end_offset,
            last_processed_line: parsed.line_count,
            partial_hash,
            parser: name.clone(),
            conversation_id: None,
            duplicate_of: None,
            updated_at: Utc::now().timestamp(),
        };

        if let Some(owner) = self
            .store
            .find_processed_by_hash(&base.content_hash, key)
            .await
            .map_err(IngestError::Persist)?
        {
            let reason = format!("identical content already ingested from {}", owner.file_path);
            let checkpoint = Checkpoint {
                conversation_id: owner.conversation_id.clone(),
                duplicate_of: Some(owner.file_path),
                ..base
            };
            self.store
                .set_checkpoint(&checkpoint)
                .await
                .map_err(IngestError::Persist)?;
            lap(outcome, Stage::Dedupe, started);
            outcome.conversation_id = checkpoint.conversation_id;
            outcome.status = IngestionStatus::Duplicate;
            outcome.reason = reason;
            return Ok(());
        }

        let id = conversation_id(parsed.external_id.as_deref(), key);
        let existing = self
            .store
            .get_conversation(&id)
            .await
            .map_err(IngestError::Persist)?;
        let action = resolve_entity(existing.as_ref(), key, self.settings.policy);
        lap(outcome, Stage::Dedupe, started);
        outcome.conversation_id = Some(id.clone());

        let started = Instant::now();
        let total = parsed.messages.len();
        let (status, reason, summary) = match (action, existing) {
            (EntityAction::Skip { owner }, _) => {
                let checkpoint = Checkpoint {
                    conversation_id: Some(id.clone()),
                    duplicate_of: Some(owner.clone()),
                    ..base
                };
                self.store
                    .set_checkpoint(&checkpoint)
                    .await
                    .map_err(IngestError::Persist)?;
                lap(outcome, Stage::Persist, started);
                outcome.status = IngestionStatus::Duplicate;
                outcome.reason = format!("conversation {} already ingested from {}", id, owner);
                return Ok(());
            }
            (EntityAction::AppendNew { owner }, Some(conv)) => {
                let (started_at, ended_at) =
                    merge_span(conv.started_at, conv.ended_at, &parsed.messages);
                let commit = FileCommit {
                    conversation: ConversationUpsert {
                        id: id.clone(),
                        parent_id: conv.parent_id.or(parsed.parent_external_id),
                        source_path: conv.source_path,
                        parser: conv.parser,
                        started_at,
                        ended_at,
                    },
                    messages: MessageWrite::Append(parsed.messages),
                    checkpoint: Checkpoint {
                        conversation_id: Some(id.clone()),
                        duplicate_of: Some(owner.clone()),
                        ..base
                    },
                    resumed_from: None,
                };
                let summary = self
                    .store
                    .commit_file(commit)
                    .await
                    .map_err(IngestError::Persist)?;
                if summary.inserted > 0 {
                    (
                        IngestionStatus::Success,
                        format!(
                            "appended {} new messages to conversation owned by {}",
                            summary.inserted, owner
                        ),
                        summary,
                    )
                } else {
                    (
                        IngestionStatus::Duplicate,
                        format!("no new messages for conversation owned by {}", owner),
                        summary,
                    )
                }
            }
            (action, _) => {
                let commit = FileCommit {
                    conversation: ConversationUpsert {
                        id: id.clone(),
                        parent_id: parsed.parent_external_id,
                        source_path: key.to_string(),
                        parser: name,
                        started_at: parsed.started_at,
                        ended_at: parsed.ended_at,
                    },
                    messages: MessageWrite::Replace(parsed.messages),
                    checkpoint: Checkpoint {
                        conversation_id: Some(id.clone()),
                        ..base
                    },
                    resumed_from: None,
                };
                let summary = self
                    .store
                    .commit_file(commit)
                    .await
                    .map_err(IngestError::Persist)?;
                let verb = if action == EntityAction::Create {
                    "created"
                } else {
                    "replaced"
                };
                let mut reason = format!("{} conversation with {} messages", verb, total);
                if parsed.malformed_records > 0 {
                    reason.push_str(&format!(
                        ", {} malformed records skipped",
                        parsed.malformed_records
                    ));
                }
                (IngestionStatus::Success, reason, summary)
            }
        };
        lap(outcome, Stage::Persist, started);

        self.hand_off(&id, summary.inserted > 0, outcome);
        outcome.messages_added = summary.inserted;
        outcome.status = status;
        outcome.reason = reason;
        Ok(())
    }

    fn hand_off(&self, conversation_id: &str, changed: bool, outcome: &mut IngestionOutcome) {
        let started = Instant::now();
        if changed {
            if let Some(queue) = &self.enrichment {
                if !queue.enqueue(conversation_id) {
                    debug!(conversation = conversation_id, "enrichment worker has stopped");
                }
            }
        }
        lap(outcome, Stage::Handoff, started);
    }
}

fn parse_with(
    parser: &dyn ConversationParser,
    path: &Path,
    opts: &ParseOptions,
) -> Result<transcript_harness_core::models::ParsedConversation, IngestError> {
    parser
        .parse(path, opts)
        .map_err(|source| IngestError::Parse {
            parser: parser.metadata().name.clone(),
            source,
        })
}

/// Canonical path used for checkpoints and locking.
pub fn path_key(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn lap(outcome: &mut IngestionOutcome, stage: Stage, started: Instant) {
    outcome.timings.push(StageTiming {
        stage,
        micros: started.elapsed().as_micros() as u64,
    });
}

fn merge_span(
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    messages: &[ParsedMessage],
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let times = messages.iter().filter_map(|m| m.timestamp);
    let first = times.clone().min();
    let last = times.max();
    (
        [started_at, first].into_iter().flatten().min(),
        [ended_at, last].into_iter().flatten().max(),
    )
}

async fn blocking<T, F>(f: F) -> Result<T, IngestError>
where
    F: FnOnce() -> Result<T, IngestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IngestError::Io(io::Error::other(format!("blocking task failed: {}", e))))?
}
