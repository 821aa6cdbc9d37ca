//! Idempotent schema setup.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Conversations
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            parent_id TEXT,
            source_path TEXT NOT NULL,
            parser TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            revision INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Messages, gapless per conversation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            conversation_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            author TEXT,
            content TEXT NOT NULL,
            timestamp TEXT,
            tool_json TEXT,
            reasoning TEXT,
            is_error INTEGER NOT NULL DEFAULT 0,
            is_boundary INTEGER NOT NULL DEFAULT 0,
            raw TEXT,
            UNIQUE(conversation_id, seq),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-file checkpoints
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            file_path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL,
            last_processed_offset INTEGER NOT NULL,
            last_processed_line INTEGER NOT NULL,
            partial_hash TEXT NOT NULL,
            parser TEXT NOT NULL,
            conversation_id TEXT,
            duplicate_of TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Ingestion ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_outcomes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL,
            status TEXT NOT NULL,
            change_kind TEXT,
            parser TEXT,
            conversation_id TEXT,
            messages_added INTEGER NOT NULL DEFAULT 0,
            reason TEXT NOT NULL,
            timings_json TEXT NOT NULL DEFAULT '[]',
            batch_id TEXT,
            recorded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Artifact cache
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_artifacts (
            conversation_id TEXT NOT NULL,
            canonical_type TEXT NOT NULL,
            strategy TEXT NOT NULL,
            strategy_version INTEGER NOT NULL,
            source_revision INTEGER NOT NULL,
            budget INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            messages_selected INTEGER NOT NULL,
            messages_total INTEGER NOT NULL,
            text TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, canonical_type, strategy)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Enrichment output, stored verbatim
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            canonical_type TEXT NOT NULL,
            source_revision INTEGER NOT NULL,
            provider TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_content_hash ON checkpoints(content_hash)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_parent ON conversations(parent_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outcomes_recorded_at ON ingestion_outcomes(recorded_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
