//! SQLite implementation of the core [`Store`] trait.
//!
//! [`Store::commit_file`] runs in a single transaction: the stored
//! checkpoint is re-read and checked, messages are written, and the
//! conversation and checkpoint rows are upserted before commit. A failure
//! anywhere rolls back all of it.
//!
//! Write transactions start with `BEGIN IMMEDIATE`. A deferred transaction
//! that reads and then writes fails with `SQLITE_BUSY` as soon as another
//! connection commits in between; taking the write lock up front makes
//! concurrent workers queue on `busy_timeout` instead.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;

use transcript_harness_core::models::{
    CanonicalArtifact, ChangeKind, Checkpoint, Conversation, EnrichmentRecord, IngestionOutcome,
    IngestionStatus, ParsedMessage, Role, SamplingStrategy, StageTiming,
};
use transcript_harness_core::store::{
    check_checkpoint, check_replace, plan_append, CommitSummary, FileCommit, MessageWrite, Store,
};

use crate::db;
use crate::migrate;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `db_path` and make sure the schema exists.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = db::connect_path(db_path).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

fn ts_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn parse_ts(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint> {
    Ok(Checkpoint {
        file_path: row.try_get("file_path")?,
        content_hash: row.try_get("content_hash")?,
        file_size_bytes: row.try_get::<i64, _>("file_size_bytes")? as u64,
        last_processed_offset: row.try_get::<i64, _>("last_processed_offset")? as u64,
        last_processed_line: row.try_get::<i64, _>("last_processed_line")? as u64,
        partial_hash: row.try_get("partial_hash")?,
        parser: row.try_get("parser")?,
        conversation_id: row.try_get("conversation_id")?,
        duplicate_of: row.try_get("duplicate_of")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        source_path: row.try_get("source_path")?,
        parser: row.try_get("parser")?,
        started_at: parse_ts(row.try_get("started_at")?),
        ended_at: parse_ts(row.try_get("ended_at")?),
        message_count: row.try_get("message_count")?,
        revision: row.try_get("revision")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ParsedMessage> {
    let role: String = row.try_get("role")?;
    let tool_json: Option<String> = row.try_get("tool_json")?;
    let tool = match tool_json {
        Some(json) => Some(serde_json::from_str(&json).context("corrupt tool payload")?),
        None => None,
    };
    Ok(ParsedMessage {
        seq: row.try_get("seq")?,
        role: role.parse::<Role>().map_err(anyhow::Error::msg)?,
        author: row.try_get("author")?,
        content: row.try_get("content")?,
        timestamp: parse_ts(row.try_get("timestamp")?),
        tool,
        reasoning: row.try_get("reasoning")?,
        is_error: row.try_get::<i64, _>("is_error")? != 0,
        is_boundary: row.try_get::<i64, _>("is_boundary")? != 0,
        raw: row.try_get("raw")?,
    })
}

const CHECKPOINT_COLUMNS: &str = "file_path, content_hash, file_size_bytes, last_processed_offset, \
     last_processed_line, partial_hash, parser, conversation_id, duplicate_of, updated_at";

async fn write_checkpoint(tx: &mut Transaction<'_, Sqlite>, cp: &Checkpoint) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO checkpoints (file_path, content_hash, file_size_bytes, last_processed_offset,
            last_processed_line, partial_hash, parser, conversation_id, duplicate_of, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(file_path) DO UPDATE SET
            content_hash = excluded.content_hash,
            file_size_bytes = excluded.file_size_bytes,
            last_processed_offset = excluded.last_processed_offset,
            last_processed_line = excluded.last_processed_line,
            partial_hash = excluded.partial_hash,
            parser = excluded.parser,
            conversation_id = excluded.conversation_id,
            duplicate_of = excluded.duplicate_of,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&cp.file_path)
    .bind(&cp.content_hash)
    .bind(cp.file_size_bytes as i64)
    .bind(cp.last_processed_offset as i64)
    .bind(cp.last_processed_line as i64)
    .bind(&cp.partial_hash)
    .bind(&cp.parser)
    .bind(&cp.conversation_id)
    .bind(&cp.duplicate_of)
    .bind(cp.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Insert one message; returns false when its sequence number exists.
async fn insert_message(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &str,
    m: &ParsedMessage,
) -> Result<bool> {
    let tool_json = match &m.tool {
        Some(t) => Some(serde_json::to_string(t)?),
        None => None,
    };
    let result = sqlx::query(
        r#"
        INSERT INTO messages (conversation_id, seq, role, author, content, timestamp, tool_json,
            reasoning, is_error, is_boundary, raw)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(conversation_id, seq) DO NOTHING
        "#,
    )
    .bind(conversation_id)
    .bind(m.seq)
    .bind(m.role.as_str())
    .bind(&m.author)
    .bind(&m.content)
    .bind(ts_text(m.timestamp))
    .bind(tool_json)
    .bind(&m.reasoning)
    .bind(m.is_error as i64)
    .bind(m.is_boundary as i64)
    .bind(&m.raw)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_checkpoint(&self, file_path: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM checkpoints WHERE file_path = ?",
            CHECKPOINT_COLUMNS
        ))
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.begin_write().await?;
        write_checkpoint(&mut tx, checkpoint).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_processed_by_hash(
        &self,
        content_hash: &str,
        exclude_path: &str,
    ) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM checkpoints
            WHERE content_hash = ? AND file_path != ?
              AND conversation_id IS NOT NULL AND duplicate_of IS NULL
            ORDER BY file_path
            LIMIT 1
            "#,
            CHECKPOINT_COLUMNS
        ))
        .bind(content_hash)
        .bind(exclude_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Conversation>> {
        let rows = sqlx::query("SELECT * FROM conversations WHERE parent_id = ? ORDER BY id")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ParsedMessage>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY seq")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn commit_file(&self, commit: FileCommit) -> Result<CommitSummary> {
        let mut tx = self.begin_write().await?;

        let stored = sqlx::query(&format!(
            "SELECT {} FROM checkpoints WHERE file_path = ?",
            CHECKPOINT_COLUMNS
        ))
        .bind(&commit.checkpoint.file_path)
        .fetch_optional(&mut *tx)
        .await?;
        let stored = stored.as_ref().map(checkpoint_from_row).transpose()?;
        check_checkpoint(stored.as_ref(), &commit)?;

        let upsert = &commit.conversation;
        let existing = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(&upsert.id)
            .fetch_optional(&mut *tx)
            .await?;
        let existing = existing.as_ref().map(conversation_from_row).transpose()?;

        let parent_id = upsert
            .parent_id
            .clone()
            .or_else(|| existing.as_ref().and_then(|c| c.parent_id.clone()));
        let started_at = match (&commit.messages, existing.as_ref()) {
            (MessageWrite::Append(_), Some(c)) => c.started_at.or(upsert.started_at),
            _ => upsert.started_at,
        };
        let ended_at = upsert
            .ended_at
            .or_else(|| existing.as_ref().and_then(|c| c.ended_at));
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO conversations (id, parent_id, source_path, parser, started_at, ended_at,
                message_count, revision, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                source_path = excluded.source_path,
                parser = excluded.parser,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&upsert.id)
        .bind(&parent_id)
        .bind(&upsert.source_path)
        .bind(&upsert.parser)
        .bind(ts_text(started_at))
        .bind(ts_text(ended_at))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let existing_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(&upsert.id)
                .fetch_one(&mut *tx)
                .await?;

        let (inserted, rejected, replaced) = match &commit.messages {
            MessageWrite::Append(msgs) => {
                let (insert, mut rejected) = plan_append(existing_count, msgs)?;
                let mut inserted = 0;
                for m in insert {
                    if insert_message(&mut tx, &upsert.id, m).await? {
                        inserted += 1;
                    } else {
                        rejected += 1;
                    }
                }
                (inserted, rejected, false)
            }
            MessageWrite::Replace(msgs) => {
                check_replace(msgs)?;
                sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                    .bind(&upsert.id)
                    .execute(&mut *tx)
                    .await?;
                for m in msgs {
                    insert_message(&mut tx, &upsert.id, m).await?;
                }
                (msgs.len(), 0, true)
            }
        };

        let message_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(&upsert.id)
                .fetch_one(&mut *tx)
                .await?;
        let changed = inserted > 0 || replaced;
        let revision = existing.as_ref().map(|c| c.revision).unwrap_or(0) + i64::from(changed);

        sqlx::query("UPDATE conversations SET message_count = ?, revision = ? WHERE id = ?")
            .bind(message_count)
            .bind(revision)
            .bind(&upsert.id)
            .execute(&mut *tx)
            .await?;

        if let (MessageWrite::Replace(_), Some(prev)) = (&commit.messages, existing.as_ref()) {
            if prev.source_path != upsert.source_path {
                sqlx::query(
                    "UPDATE checkpoints SET duplicate_of = ? WHERE file_path = ? AND conversation_id = ?",
                )
                .bind(&upsert.source_path)
                .bind(&prev.source_path)
                .bind(&upsert.id)
                .execute(&mut *tx)
                .await?;
            }
        }

        write_checkpoint(&mut tx, &commit.checkpoint).await?;
        tx.commit().await?;

        Ok(CommitSummary {
            inserted,
            rejected,
            message_count,
            revision,
        })
    }

    async fn record_outcome(&self, outcome: &IngestionOutcome) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_outcomes (file_path, status, change_kind, parser, conversation_id,
                messages_added, reason, timings_json, batch_id, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&outcome.file_path)
        .bind(outcome.status.as_str())
        .bind(outcome.change.map(|c| c.as_str()))
        .bind(&outcome.parser)
        .bind(&outcome.conversation_id)
        .bind(outcome.messages_added as i64)
        .bind(&outcome.reason)
        .bind(serde_json::to_string(&outcome.timings)?)
        .bind(&outcome.batch_id)
        .bind(outcome.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<IngestionOutcome>> {
        let rows = sqlx::query("SELECT * FROM ingestion_outcomes ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let change: Option<String> = row.try_get("change_kind")?;
                let timings: String = row.try_get("timings_json")?;
                Ok(IngestionOutcome {
                    file_path: row.try_get("file_path")?,
                    status: status
                        .parse::<IngestionStatus>()
                        .map_err(anyhow::Error::msg)?,
                    change: change.as_deref().and_then(parse_change),
                    parser: row.try_get("parser")?,
                    conversation_id: row.try_get("conversation_id")?,
                    messages_added: row.try_get::<i64, _>("messages_added")? as usize,
                    reason: row.try_get("reason")?,
                    timings: serde_json::from_str::<Vec<StageTiming>>(&timings)?,
                    batch_id: row.try_get("batch_id")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn get_artifact(
        &self,
        conversation_id: &str,
        canonical_type: &str,
        strategy: SamplingStrategy,
    ) -> Result<Option<CanonicalArtifact>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM canonical_artifacts
            WHERE conversation_id = ? AND canonical_type = ? AND strategy = ?
            "#,
        )
        .bind(conversation_id)
        .bind(canonical_type)
        .bind(strategy.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };
        Ok(Some(CanonicalArtifact {
            conversation_id: row.try_get("conversation_id")?,
            canonical_type: row.try_get("canonical_type")?,
            strategy,
            strategy_version: row.try_get::<i64, _>("strategy_version")? as u32,
            source_revision: row.try_get("source_revision")?,
            budget: row.try_get::<i64, _>("budget")? as usize,
            token_count: row.try_get::<i64, _>("token_count")? as usize,
            messages_selected: row.try_get::<i64, _>("messages_selected")? as usize,
            messages_total: row.try_get::<i64, _>("messages_total")? as usize,
            text: row.try_get("text")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn put_artifact(&self, artifact: &CanonicalArtifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO canonical_artifacts (conversation_id, canonical_type, strategy,
                strategy_version, source_revision, budget, token_count, messages_selected,
                messages_total, text, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(conversation_id, canonical_type, strategy) DO UPDATE SET
                strategy_version = excluded.strategy_version,
                source_revision = excluded.source_revision,
                budget = excluded.budget,
                token_count = excluded.token_count,
                messages_selected = excluded.messages_selected,
                messages_total = excluded.messages_total,
                text = excluded.text,
                created_at = excluded.created_at
            "#,
        )
        .bind(&artifact.conversation_id)
        .bind(&artifact.canonical_type)
        .bind(artifact.strategy.as_str())
        .bind(artifact.strategy_version as i64)
        .bind(artifact.source_revision)
        .bind(artifact.budget as i64)
        .bind(artifact.token_count as i64)
        .bind(artifact.messages_selected as i64)
        .bind(artifact.messages_total as i64)
        .bind(&artifact.text)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_enrichment(&self, record: &EnrichmentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO enrichment_results (conversation_id, canonical_type, source_revision,
                provider, payload_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.conversation_id)
        .bind(&record.canonical_type)
        .bind(record.source_revision)
        .bind(&record.provider)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_change(s: &str) -> Option<ChangeKind> {
    match s {
        "full" => Some(ChangeKind::Full),
        "unchanged" => Some(ChangeKind::Unchanged),
        "append" => Some(ChangeKind::Append),
        "truncate" => Some(ChangeKind::Truncate),
        "rewrite" => Some(ChangeKind::Rewrite),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transcript_harness_core::store::ConversationUpsert;

    fn checkpoint(offset: u64) -> Checkpoint {
        Checkpoint {
            file_path: "/a.jsonl".into(),
            content_hash: format!("h{}", offset),
            file_size_bytes: offset,
            last_processed_offset: offset,
            last_processed_line: offset / 10,
            partial_hash: "p".into(),
            parser: "claude-code".into(),
            conversation_id: Some("s1".into()),
            duplicate_of: None,
            updated_at: 0,
        }
    }

    fn msgs(range: std::ops::Range<i64>) -> Vec<ParsedMessage> {
        range
            .map(|i| {
                let mut m = ParsedMessage::new(Role::Assistant, format!("m{}", i));
                m.seq = i;
                m
            })
            .collect()
    }

    fn upsert() -> ConversationUpsert {
        ConversationUpsert {
            id: "s1".into(),
            parent_id: None,
            source_path: "/a.jsonl".into(),
            parser: "claude-code".into(),
            started_at: None,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn commit_is_transactional() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("th.sqlite")).await.unwrap();

        let s = store
            .commit_file(FileCommit {
                conversation: upsert(),
                messages: MessageWrite::Replace(msgs(0..3)),
                checkpoint: checkpoint(30),
                resumed_from: None,
            })
            .await
            .unwrap();
        assert_eq!((s.inserted, s.message_count, s.revision), (3, 3, 1));

        // Stale resume: nothing from this commit may land.
        let err = store
            .commit_file(FileCommit {
                conversation: upsert(),
                messages: MessageWrite::Append(msgs(3..5)),
                checkpoint: checkpoint(50),
                resumed_from: Some(10),
            })
            .await;
        assert!(err.is_err());
        assert_eq!(store.get_messages("s1").await.unwrap().len(), 3);
        let cp = store.get_checkpoint("/a.jsonl").await.unwrap().unwrap();
        assert_eq!(cp.last_processed_offset, 30);

        let s = store
            .commit_file(FileCommit {
                conversation: upsert(),
                messages: MessageWrite::Append(msgs(2..5)),
                checkpoint: checkpoint(50),
                resumed_from: Some(30),
            })
            .await
            .unwrap();
        assert_eq!((s.inserted, s.rejected, s.message_count, s.revision), (2, 1, 5, 2));
        let conv = store.get_conversation("s1").await.unwrap().unwrap();
        assert_eq!(conv.message_count, 5);
    }

    #[tokio::test]
    async fn outcomes_round_trip_through_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("th.sqlite")).await.unwrap();
        let mut outcome = IngestionOutcome::new("/a.jsonl")
            .finish(IngestionStatus::Skipped, "metadata-only");
        outcome.change = Some(ChangeKind::Full);
        store.record_outcome(&outcome).await.unwrap();
        store
            .record_outcome(&IngestionOutcome::new("/b.jsonl").finish(IngestionStatus::Failed, "x"))
            .await
            .unwrap();

        let recent = store.recent_outcomes(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].file_path, "/b.jsonl");
        assert_eq!(recent[1].change, Some(ChangeKind::Full));
        assert_eq!(recent[1].reason, "metadata-only");
    }
}
