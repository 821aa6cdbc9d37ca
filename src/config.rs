//! TOML configuration.
//!
//! Everything beyond `[db]` has defaults, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/th.sqlite"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use transcript_harness_core::models::SamplingStrategy;
use transcript_harness_core::narrative::{NarrativeConfig, MIN_BUDGET};

use crate::dedup::DuplicatePolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default = "default_budgets")]
    pub budgets: BTreeMap<String, usize>,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Lines scanned by the metadata-only pre-filter.
    #[serde(default = "default_prefilter_lines")]
    pub prefilter_lines: usize,
    #[serde(default = "default_marker_fields")]
    pub marker_fields: Vec<String>,
    #[serde(default = "default_partial_hash_bytes")]
    pub partial_hash_bytes: u64,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default = "default_batch_ttl_secs")]
    pub batch_ttl_secs: u64,
    /// Keep each message's source line in `raw`.
    #[serde(default)]
    pub keep_raw: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            prefilter_lines: default_prefilter_lines(),
            marker_fields: default_marker_fields(),
            partial_hash_bytes: default_partial_hash_bytes(),
            read_chunk_bytes: default_read_chunk_bytes(),
            workers: default_workers(),
            duplicate_policy: DuplicatePolicy::default(),
            batch_ttl_secs: default_batch_ttl_secs(),
            keep_raw: false,
        }
    }
}

fn default_prefilter_lines() -> usize {
    5
}
fn default_marker_fields() -> Vec<String> {
    vec![
        "message".to_string(),
        "payload".to_string(),
        "role".to_string(),
    ]
}
fn default_partial_hash_bytes() -> u64 {
    64 * 1024
}
fn default_read_chunk_bytes() -> usize {
    8 * 1024
}
fn default_workers() -> usize {
    4
}
fn default_batch_ttl_secs() -> u64 {
    600
}

fn default_budgets() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("tagging".to_string(), 8000),
        ("insights".to_string(), 12000),
        ("export".to_string(), 20000),
    ])
}

#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    #[serde(default)]
    pub strategy: SamplingStrategy,
    #[serde(default = "default_child_budget_fraction")]
    pub child_budget_fraction: f64,
    #[serde(default = "default_max_message_tokens")]
    pub max_message_tokens: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::default(),
            child_budget_fraction: default_child_budget_fraction(),
            max_message_tokens: default_max_message_tokens(),
        }
    }
}

fn default_child_budget_fraction() -> f64 {
    0.2
}
fn default_max_message_tokens() -> usize {
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_canonical_type")]
    pub canonical_type: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            canonical_type: default_canonical_type(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EnrichmentConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_canonical_type() -> String {
    "tagging".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string()]
}

impl Config {
    /// Token budget configured for a canonical type.
    pub fn budget_for(&self, canonical_type: &str) -> Result<usize> {
        match self.budgets.get(canonical_type) {
            Some(b) => Ok(*b),
            None => bail!(
                "Unknown canonical type: '{}'. Configured: {}",
                canonical_type,
                self.budgets.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }

    /// Narrative settings for one artifact type and strategy.
    pub fn narrative(
        &self,
        canonical_type: &str,
        strategy: SamplingStrategy,
    ) -> Result<NarrativeConfig> {
        Ok(NarrativeConfig {
            canonical_type: canonical_type.to_string(),
            budget: self.budget_for(canonical_type)?,
            strategy,
            child_budget_fraction: self.sampling.child_budget_fraction,
            max_message_tokens: self.sampling.max_message_tokens,
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate ingest
    if config.ingest.prefilter_lines == 0 {
        bail!("ingest.prefilter_lines must be > 0");
    }
    if config.ingest.partial_hash_bytes == 0 {
        bail!("ingest.partial_hash_bytes must be > 0");
    }
    if config.ingest.read_chunk_bytes == 0 {
        bail!("ingest.read_chunk_bytes must be > 0");
    }
    if config.ingest.workers == 0 {
        bail!("ingest.workers must be > 0");
    }

    // Validate budgets
    if config.budgets.is_empty() {
        bail!("budgets must define at least one canonical type");
    }
    if let Some((name, b)) = config.budgets.iter().find(|(_, b)| **b < MIN_BUDGET) {
        bail!("budgets.{} is {}; must be at least {}", name, b, MIN_BUDGET);
    }

    // Validate sampling
    if !(0.0..=0.5).contains(&config.sampling.child_budget_fraction) {
        bail!("sampling.child_budget_fraction must be in [0.0, 0.5]");
    }

    // Validate enrichment
    match config.enrichment.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.enrichment.endpoint.is_none() {
                bail!("enrichment.endpoint must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown enrichment provider: '{}'. Must be disabled or http.",
            other
        ),
    }
    if config.enrichment.is_enabled() && !config.budgets.contains_key(&config.enrichment.canonical_type)
    {
        bail!(
            "enrichment.canonical_type '{}' has no entry in [budgets]",
            config.enrichment.canonical_type
        );
    }

    Ok(config)
}
