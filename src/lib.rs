//! # Transcript Harness
//!
//! Incremental ingestion, deduplication, and token-budgeted narratives for
//! AI coding assistant transcripts.
//!
//! Transcript Harness watches nothing itself: a caller hands it JSONL
//! transcript paths (or a configured source scan does), and each file is
//! classified against its last checkpoint, parsed fully or from the last
//! committed offset, deduplicated, and committed atomically. Committed
//! conversations can be rendered into budgeted canonical artifacts and
//! handed to an external enrichment service.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌──────────┐
//! │  Change  │──▶│  Parser    │──▶│  Dedup   │──▶│  SQLite  │
//! │ Detector │   │  Registry  │   │  layers  │   │  Store   │
//! └──────────┘   └────────────┘   └──────────┘   └────┬─────┘
//!                                                     │
//!                              ┌──────────────────────┤
//!                              ▼                      ▼
//!                        ┌───────────┐          ┌───────────┐
//!                        │ Canonical │─────────▶│ Enricher  │
//!                        │ Artifacts │          │  (HTTP)   │
//!                        └───────────┘          └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! th init                                  # create database
//! th ingest                                # scan configured sources
//! th ingest ~/.claude/projects/x/s.jsonl   # ingest specific files
//! th artifact <conversation-id> --type tagging
//! th outcomes --limit 20
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Parse and ingest error taxonomy |
//! | [`fingerprint`] | Partial and whole-file hashes |
//! | [`change`] | Change detection against checkpoints |
//! | [`parser`] | Plugin contract, built-in parsers, registry |
//! | [`dedup`] | File, entity, and batch deduplication |
//! | [`ingest`] | Pipeline orchestration and worker pool |
//! | [`canonical`] | Cached canonical artifacts |
//! | [`enrich`] | Enrichment hand-off |
//! | [`sources`] | Source discovery |
//! | [`progress`] | Ingest progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite `Store` backend |
//! | [`stats`] | Database statistics |

pub mod canonical;
pub mod change;
pub mod config;
pub mod db;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod migrate;
pub mod parser;
pub mod progress;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
