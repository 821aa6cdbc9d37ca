//! Database statistics and health overview.
//!
//! Summarizes what has been ingested: conversations, messages, tracked
//! files, the outcome ledger, and a per-parser breakdown. Used by
//! `th stats` to confirm that scans are landing where expected.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Per-parser conversation and message counts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserStats {
    pub parser: String,
    pub conversations: i64,
    pub messages: i64,
    pub last_update: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub conversations: i64,
    pub sub_agents: i64,
    pub messages: i64,
    pub files_tracked: i64,
    pub duplicate_files: i64,
    pub artifacts: i64,
    pub enrichments: i64,
    /// Ledger counts per status, in status order.
    pub outcomes: Vec<(String, i64)>,
    pub by_parser: Vec<ParserStats>,
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

/// Gather counts from an open database.
pub async fn collect_stats(pool: &SqlitePool) -> Result<Stats> {
    let outcome_rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM ingestion_outcomes GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;
    let mut outcomes = Vec::with_capacity(outcome_rows.len());
    for row in &outcome_rows {
        outcomes.push((row.try_get("status")?, row.try_get("n")?));
    }

    let parser_rows = sqlx::query(
        r#"
        SELECT c.parser AS parser,
               COUNT(*) AS conversations,
               COALESCE(SUM(c.message_count), 0) AS messages,
               MAX(c.updated_at) AS last_update
        FROM conversations c
        GROUP BY c.parser
        ORDER BY conversations DESC, parser
        "#,
    )
    .fetch_all(pool)
    .await?;
    let mut by_parser = Vec::with_capacity(parser_rows.len());
    for row in &parser_rows {
        by_parser.push(ParserStats {
            parser: row.try_get("parser")?,
            conversations: row.try_get("conversations")?,
            messages: row.try_get("messages")?,
            last_update: row.try_get("last_update")?,
        });
    }

    Ok(Stats {
        conversations: count(pool, "SELECT COUNT(*) FROM conversations").await?,
        sub_agents: count(
            pool,
            "SELECT COUNT(*) FROM conversations WHERE parent_id IS NOT NULL",
        )
        .await?,
        messages: count(pool, "SELECT COUNT(*) FROM messages").await?,
        files_tracked: count(pool, "SELECT COUNT(*) FROM checkpoints").await?,
        duplicate_files: count(
            pool,
            "SELECT COUNT(*) FROM checkpoints WHERE duplicate_of IS NOT NULL",
        )
        .await?,
        artifacts: count(pool, "SELECT COUNT(*) FROM canonical_artifacts").await?,
        enrichments: count(pool, "SELECT COUNT(*) FROM enrichment_results").await?,
        outcomes,
        by_parser,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Transcript Harness — Database Stats");
    println!("===================================");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!();
    println!(
        "  Conversations:  {} ({} sub-agent)",
        stats.conversations, stats.sub_agents
    );
    println!("  Messages:       {}", stats.messages);
    println!(
        "  Files tracked:  {} ({} duplicate)",
        stats.files_tracked, stats.duplicate_files
    );
    println!("  Artifacts:      {}", stats.artifacts);
    println!("  Enrichments:    {}", stats.enrichments);

    if !stats.outcomes.is_empty() {
        println!();
        println!("  Outcomes:");
        for (status, n) in &stats.outcomes {
            println!("    {:<12} {}", status, n);
        }
    }

    if !stats.by_parser.is_empty() {
        println!();
        println!("  By parser:");
        println!(
            "  {:<16} {:>8} {:>10}   {}",
            "PARSER", "CONVS", "MESSAGES", "LAST UPDATE"
        );
        println!("  {}", "-".repeat(60));
        for p in &stats.by_parser {
            let last = match p.last_update {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<16} {:>8} {:>10}   {}",
                p.parser, p.conversations, p.messages, last
            );
        }
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else {
        format!("{:.2} GB", b / (KB * KB * KB))
    }
}

/// Relative time such as "3 hours ago"; older than a month prints the date.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    let plural = |n: i64, unit: &str| format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" });
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86400 => plural(d / 3600, "hour"),
        d if d < 86400 * 30 => plural(d / 86400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteStore;
    use transcript_harness_core::models::{IngestionOutcome, IngestionStatus};
    use transcript_harness_core::store::Store;

    #[test]
    fn bytes_and_times_format() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }

    #[tokio::test]
    async fn empty_database_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("th.sqlite")).await.unwrap();
        store
            .record_outcome(&IngestionOutcome::new("/a.jsonl").finish(IngestionStatus::Skipped, "metadata-only"))
            .await
            .unwrap();

        let stats = collect_stats(store.pool()).await.unwrap();
        assert_eq!(stats.conversations, 0);
        assert_eq!(stats.outcomes, vec![("skipped".to_string(), 1)]);
        assert!(stats.by_parser.is_empty());
    }
}
