//! # Transcript Harness CLI (`th`)
//!
//! The `th` binary drives ingestion and artifact generation for AI coding
//! assistant transcripts.
//!
//! ## Usage
//!
//! ```bash
//! th --config ./config/th.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `th init` | Create the SQLite database and run schema migrations |
//! | `th ingest [PATHS...]` | Ingest files, or scan configured sources |
//! | `th parsers` | List registered parser plugins in selection order |
//! | `th artifact <id>` | Render (or reuse) a canonical artifact |
//! | `th outcomes` | Show the most recent ingestion outcomes |
//! | `th stats` | Database statistics |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use transcript_harness::canonical::ArtifactService;
use transcript_harness::config::{self, Config};
use transcript_harness::enrich::{enricher_from_config, spawn_worker};
use transcript_harness::ingest::{IngestSettings, Ingestor};
use transcript_harness::migrate;
use transcript_harness::parser::ParserRegistry;
use transcript_harness::progress::ProgressMode;
use transcript_harness::sources::scan_sources;
use transcript_harness::sqlite_store::SqliteStore;
use transcript_harness::stats;
use transcript_harness_core::models::SamplingStrategy;
use transcript_harness_core::store::Store;

/// Transcript Harness: incremental ingestion and token-budgeted
/// narratives for AI coding assistant transcripts.
#[derive(Parser)]
#[command(
    name = "th",
    about = "Transcript Harness — incremental ingestion and token-budgeted narratives for AI coding assistant transcripts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/th.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest transcript files.
    ///
    /// With no PATHS, every configured source (or only `--source`) is
    /// scanned. Unchanged files are skipped; grown files resume from
    /// their last checkpoint.
    Ingest {
        /// Files to ingest.
        paths: Vec<PathBuf>,

        /// Replaying an id seen within the batch TTL returns the cached
        /// report instead of reprocessing.
        #[arg(long)]
        batch_id: Option<String>,

        /// Scan only this configured source.
        #[arg(long)]
        source: Option<String>,

        /// Progress output on stderr: off, human, or json.
        /// Defaults to human when stderr is a TTY.
        #[arg(long)]
        progress: Option<String>,

        /// Print the batch report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List registered parsers in selection order.
    Parsers,

    /// Render the canonical artifact for a conversation.
    Artifact {
        conversation_id: String,

        /// Canonical type; must have a configured budget.
        #[arg(long = "type", default_value = "tagging")]
        canonical_type: String,

        /// semantic, epoch, or chronological. Defaults to `[sampling] strategy`.
        #[arg(long)]
        strategy: Option<String>,

        /// Print the artifact with its metadata as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show recent ingestion outcomes, newest first.
    Outcomes {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show database statistics.
    Stats,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn progress_mode(arg: Option<&str>) -> Result<ProgressMode> {
    match arg {
        None => Ok(ProgressMode::default_for_tty()),
        Some("off") => Ok(ProgressMode::Off),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some(other) => bail!("Unknown progress mode: '{}'. Must be off, human, or json.", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest {
            paths,
            batch_id,
            source,
            progress,
            json,
        } => {
            run_ingest(cfg, paths, batch_id, source, progress, json).await?;
        }
        Commands::Parsers => {
            list_parsers(&ParserRegistry::with_builtins());
        }
        Commands::Artifact {
            conversation_id,
            canonical_type,
            strategy,
            json,
        } => {
            let strategy = match strategy {
                Some(s) => s.parse::<SamplingStrategy>().map_err(anyhow::Error::msg)?,
                None => cfg.sampling.strategy,
            };
            let store = SqliteStore::open(&cfg.db.path).await?;
            let service = ArtifactService::new(Arc::new(store.clone()), Arc::new(cfg));
            let (artifact, cached) = service
                .get_or_build(&conversation_id, &canonical_type, strategy)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&artifact)?);
            } else {
                eprintln!(
                    "{} {} / {}: {} of {} messages, {} / {} tokens{}",
                    artifact.conversation_id,
                    artifact.canonical_type,
                    artifact.strategy,
                    artifact.messages_selected,
                    artifact.messages_total,
                    artifact.token_count,
                    artifact.budget,
                    if cached { " (cached)" } else { "" }
                );
                println!("{}", artifact.text);
            }
            store.close().await;
        }
        Commands::Outcomes { limit } => {
            let store = SqliteStore::open(&cfg.db.path).await?;
            let outcomes = store.recent_outcomes(limit).await?;
            if outcomes.is_empty() {
                println!("No outcomes recorded.");
            } else {
                println!(
                    "{:<10} {:<10} {:<13} {:>6}  {}",
                    "STATUS", "CHANGE", "PARSER", "MSGS", "PATH / REASON"
                );
                for o in &outcomes {
                    println!(
                        "{:<10} {:<10} {:<13} {:>6}  {}",
                        o.status.as_str(),
                        o.change.map(|c| c.as_str()).unwrap_or("-"),
                        o.parser.as_deref().unwrap_or("-"),
                        o.messages_added,
                        o.file_path
                    );
                    println!("{:>43}  {}", "", o.reason);
                }
            }
            store.close().await;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_ingest(
    cfg: Config,
    paths: Vec<PathBuf>,
    batch_id: Option<String>,
    source: Option<String>,
    progress: Option<String>,
    json: bool,
) -> Result<()> {
    let mode = progress_mode(progress.as_deref())?;
    let paths = if paths.is_empty() {
        let found = scan_sources(&cfg, source.as_deref(), mode.reporter().as_ref())?;
        if found.is_empty() {
            println!("No transcript files found.");
            return Ok(());
        }
        found
    } else {
        paths
    };

    let store = SqliteStore::open(&cfg.db.path).await?;
    let shared: Arc<dyn Store> = Arc::new(store.clone());
    let cfg = Arc::new(cfg);
    let settings = IngestSettings::from_config(&cfg.ingest);
    let mut ingestor = Ingestor::new(shared.clone(), ParserRegistry::with_builtins(), settings)
        .with_progress(mode.reporter());

    let mut worker = None;
    if let Some(enricher) = enricher_from_config(&cfg.enrichment)? {
        let (queue, handle) = spawn_worker(shared, cfg.clone(), enricher);
        ingestor = ingestor.with_enrichment(queue);
        worker = Some(handle);
    }

    let report = ingestor.ingest_batch(&paths, batch_id.as_deref()).await;
    drop(ingestor);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for o in &report.outcomes {
            println!("{:<10} {}  ({})", o.status.as_str(), o.file_path, o.reason);
        }
        println!(
            "batch {}{}: {} success, {} duplicate, {} skipped, {} failed, {} messages added",
            report.batch_id,
            if report.replayed { " (replayed)" } else { "" },
            report.success,
            report.duplicate,
            report.skipped,
            report.failed,
            report.messages_added
        );
    }

    if let Some(handle) = worker {
        match handle.await {
            Ok(n) if n > 0 => eprintln!("enriched {} conversations", n),
            Ok(_) => {}
            Err(e) => eprintln!("enrichment worker failed: {}", e),
        }
    }
    store.close().await;
    Ok(())
}

fn list_parsers(registry: &ParserRegistry) {
    println!(
        "{:<14} {:<8} {:>8}  {:<9} {:<20} EXTENSIONS",
        "NAME", "VERSION", "PRIORITY", "SOURCE", "CAPABILITIES"
    );
    for parser in registry.parsers() {
        let meta = parser.metadata();
        let caps: Vec<&str> = meta.capabilities.iter().map(|c| c.as_str()).collect();
        println!(
            "{:<14} {:<8} {:>8}  {:<9} {:<20} {}",
            meta.name,
            meta.version,
            meta.priority,
            meta.source.as_str(),
            caps.join(","),
            meta.extensions.join(",")
        );
    }
}
