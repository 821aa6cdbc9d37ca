//! Source discovery.
//!
//! Walks the `[sources.<name>]` roots and returns transcript files to
//! ingest. Watching and debouncing belong to the caller; this is a
//! one-shot scan.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::config::{Config, SourceConfig};
use crate::progress::{IngestProgressEvent, IngestProgressReporter};

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Scan every configured source, or only `only` when given.
///
/// Paths are sorted and deduplicated across sources.
pub fn scan_sources(
    config: &Config,
    only: Option<&str>,
    progress: &dyn IngestProgressReporter,
) -> Result<Vec<PathBuf>> {
    if let Some(name) = only {
        if !config.sources.contains_key(name) {
            bail!(
                "Unknown source: '{}'. Configured: {}",
                name,
                config.sources.keys().cloned().collect::<Vec<_>>().join(", ")
            );
        }
    }

    let mut paths = Vec::new();
    for (name, source) in &config.sources {
        if only.is_some_and(|o| o != name) {
            continue;
        }
        progress.report(IngestProgressEvent::Discovering {
            source: name.clone(),
        });
        paths.extend(scan_root(name, source)?);
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn scan_root(name: &str, source: &SourceConfig) -> Result<Vec<PathBuf>> {
    let root = &source.root;
    if !root.exists() {
        bail!("Source '{}' root does not exist: {}", name, root.display());
    }

    let include_set = build_globset(&source.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(source.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(source.follow_symlinks) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel = relative.to_string_lossy();
        if exclude_set.is_match(rel.as_ref()) || !include_set.is_match(rel.as_ref()) {
            continue;
        }
        paths.push(path.to_path_buf());
    }
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
