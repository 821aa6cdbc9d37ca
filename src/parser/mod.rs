//! Parser plugins and the record-decoding driver they share.
//!
//! A plugin turns one transcript file into a [`ParsedConversation`]. All
//! built-in formats are newline-delimited JSON, so plugins only supply a
//! per-record [`RecordDecoder`]; [`run_pass`] handles chunked reading,
//! malformed-record tolerance, and offset bookkeeping for both full and
//! incremental passes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ParserRegistry                │
//! │  ┌───────────┐ ┌───────────┐ ┌────────────┐  │
//! │  │ Built-in  │ │ Extension │ │   Local    │  │
//! │  │claude/    │ │ plugins   │ │ overrides  │  │
//! │  │codex/chat │ │           │ │            │  │
//! │  └───────────┘ └───────────┘ └────────────┘  │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!        Ingestor: select → parse / parse_incremental
//! ```
//!
//! Parsing is synchronous; the orchestrator runs it on the blocking pool.

pub mod claude;
pub mod codex;
pub mod generic;
pub mod lines;
pub mod registry;

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use transcript_harness_core::models::{ParsedConversation, ParsedMessage};

use crate::error::ParseError;
use crate::fingerprint;
use lines::LineReader;

pub use registry::{ParserRegistry, Prefilter};

// ═══════════════════════════════════════════════════════════════════════
// Plugin contract
// ═══════════════════════════════════════════════════════════════════════

/// Parsing mode a plugin supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Batch,
    Incremental,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Batch => "batch",
            Capability::Incremental => "incremental",
        }
    }
}

/// Where a plugin came from. Selection tries sources in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParserSource {
    Builtin,
    Extension,
    Local,
}

impl ParserSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserSource::Builtin => "builtin",
            ParserSource::Extension => "extension",
            ParserSource::Local => "local",
        }
    }
}

/// Static description of a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserMetadata {
    pub name: String,
    pub version: String,
    /// File extensions the plugin accepts, without the dot.
    pub extensions: Vec<String>,
    pub capabilities: Vec<Capability>,
    /// Higher wins within a source.
    pub priority: i32,
    pub source: ParserSource,
}

impl ParserMetadata {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether `path` has one of the accepted extensions.
    pub fn accepts_extension(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

/// The first records of a file, read once and shared by the pre-filter and
/// every plugin's `can_parse`.
#[derive(Debug, Clone, Default)]
pub struct FileProbe {
    pub path: PathBuf,
    /// Decoded JSON values of the first complete, non-blank lines.
    pub head: Vec<Value>,
}

impl FileProbe {
    /// Read up to `max_lines` complete lines from the start of `path`.
    pub fn read(path: &Path, max_lines: usize, chunk_bytes: usize) -> std::io::Result<Self> {
        let mut reader = LineReader::open(path, 0, 0, chunk_bytes)?;
        let mut head = Vec::new();
        let mut seen = 0;
        while seen < max_lines {
            let line = match reader.next_line()? {
                Some(l) => l,
                None => break,
            };
            if line.text.trim().is_empty() {
                continue;
            }
            seen += 1;
            if let Ok(value) = serde_json::from_str::<Value>(&line.text) {
                head.push(value);
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            head,
        })
    }

    /// Head records that are JSON objects.
    pub fn objects(&self) -> impl Iterator<Item = &serde_json::Map<String, Value>> {
        self.head.iter().filter_map(Value::as_object)
    }
}

/// Read and hashing settings handed to plugins.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub read_chunk_bytes: usize,
    pub partial_hash_bytes: u64,
    /// Copy each record's source line into the messages it produced.
    pub keep_raw: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 8 * 1024,
            partial_hash_bytes: 64 * 1024,
            keep_raw: false,
        }
    }
}

/// Delta produced by resuming a parse at a byte offset.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalResult {
    /// New messages, numbered from 0 within this pass.
    pub new_messages: Vec<ParsedMessage>,
    /// Offset just past the last complete record.
    pub new_offset: u64,
    pub new_line: u64,
    /// Partial hash of the file as it is now.
    pub new_partial_hash: String,
    /// File size to record, never below `new_offset`.
    pub file_size: u64,
    pub external_id: Option<String>,
    pub parent_external_id: Option<String>,
    pub malformed_records: usize,
}

/// A format-detecting conversation parser.
///
/// # Example
///
/// ```rust
/// use std::path::Path;
/// use transcript_harness::error::ParseError;
/// use transcript_harness::parser::{
///     Capability, ConversationParser, FileProbe, ParseOptions, ParserMetadata, ParserSource,
/// };
/// use transcript_harness_core::models::ParsedConversation;
///
/// struct Empty(ParserMetadata);
///
/// impl ConversationParser for Empty {
///     fn metadata(&self) -> &ParserMetadata { &self.0 }
///     fn can_parse(&self, _probe: &FileProbe) -> bool { false }
///     fn parse(&self, _path: &Path, _opts: &ParseOptions) -> Result<ParsedConversation, ParseError> {
///         Err(ParseError::Empty)
///     }
/// }
/// ```
pub trait ConversationParser: Send + Sync {
    fn metadata(&self) -> &ParserMetadata;

    /// Cheap format check over the file's first records.
    fn can_parse(&self, probe: &FileProbe) -> bool;

    /// Parse the whole file.
    fn parse(&self, path: &Path, opts: &ParseOptions) -> Result<ParsedConversation, ParseError>;

    /// Whether this particular file can be resumed at an offset.
    fn supports_incremental(&self, _path: &Path) -> bool {
        false
    }

    /// Parse the records after `last_offset`.
    fn parse_incremental(
        &self,
        _path: &Path,
        _last_offset: u64,
        _last_line: u64,
        _opts: &ParseOptions,
    ) -> Result<IncrementalResult, ParseError> {
        Err(ParseError::NotIncremental {
            parser: self.metadata().name.clone(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Shared JSONL driver
// ═══════════════════════════════════════════════════════════════════════

/// Decodes one JSON record into zero or more messages.
pub trait RecordDecoder {
    fn decode(&mut self, record: &serde_json::Map<String, Value>, out: &mut ParsedConversation);
}

/// Read records from `offset` and decode them into a conversation.
///
/// Complete records that are not JSON objects are skipped and counted.
/// When `hold_back_malformed` is set (incremental passes), malformed
/// records at the very end of the file are treated as not yet complete:
/// the returned offset stops before them.
pub fn run_pass(
    path: &Path,
    offset: u64,
    line: u64,
    opts: &ParseOptions,
    parser_name: &str,
    hold_back_malformed: bool,
    decoder: &mut dyn RecordDecoder,
) -> Result<ParsedConversation, ParseError> {
    let mut reader = LineReader::open(path, offset, line, opts.read_chunk_bytes)?;
    let mut conv = ParsedConversation::new(parser_name);
    let mut committed = (offset, line);
    let mut trailing_bad: Vec<u64> = Vec::new();

    while let Some(l) = reader.next_line()? {
        if l.text.trim().is_empty() {
            if trailing_bad.is_empty() || !hold_back_malformed {
                committed = (l.end_offset, l.number);
            }
            continue;
        }
        match serde_json::from_str::<Value>(&l.text) {
            Ok(Value::Object(record)) => {
                if !trailing_bad.is_empty() {
                    for n in trailing_bad.drain(..) {
                        warn!(path = %path.display(), line = n, "skipping malformed record");
                        conv.malformed_records += 1;
                    }
                }
                let produced = conv.messages.len();
                decoder.decode(&record, &mut conv);
                if opts.keep_raw {
                    for m in &mut conv.messages[produced..] {
                        m.raw = Some(l.text.trim_end().to_string());
                    }
                }
                committed = (l.end_offset, l.number);
            }
            _ => {
                trailing_bad.push(l.number);
                if !hold_back_malformed {
                    committed = (l.end_offset, l.number);
                }
            }
        }
    }

    if !trailing_bad.is_empty() {
        if hold_back_malformed {
            debug!(
                path = %path.display(),
                records = trailing_bad.len(),
                "holding back malformed tail"
            );
        } else {
            for n in trailing_bad.drain(..) {
                warn!(path = %path.display(), line = n, "skipping malformed record");
                conv.malformed_records += 1;
            }
        }
    }
    if reader.has_incomplete_tail() {
        debug!(path = %path.display(), offset = reader.offset(), "incomplete trailing record");
    }

    conv.end_offset = committed.0;
    conv.line_count = committed.1;
    conv.finalize();
    Ok(conv)
}

/// Full pass from the start of the file; empty results are an error.
pub fn parse_full(
    path: &Path,
    opts: &ParseOptions,
    parser_name: &str,
    decoder: &mut dyn RecordDecoder,
) -> Result<ParsedConversation, ParseError> {
    let conv = run_pass(path, 0, 0, opts, parser_name, false, decoder)?;
    if conv.messages.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(conv)
}

/// Incremental pass from `offset`, packaged as an [`IncrementalResult`].
pub fn parse_from(
    path: &Path,
    offset: u64,
    line: u64,
    opts: &ParseOptions,
    parser_name: &str,
    decoder: &mut dyn RecordDecoder,
) -> Result<IncrementalResult, ParseError> {
    let conv = run_pass(path, offset, line, opts, parser_name, true, decoder)?;
    let file_size = std::fs::metadata(path)?.len().max(conv.end_offset);
    let new_partial_hash = fingerprint::partial_hash(
        path,
        opts.partial_hash_bytes,
        file_size,
        opts.read_chunk_bytes,
    )?;
    Ok(IncrementalResult {
        new_messages: conv.messages,
        new_offset: conv.end_offset,
        new_line: conv.line_count,
        new_partial_hash,
        file_size,
        external_id: conv.external_id,
        parent_external_id: conv.parent_external_id,
        malformed_records: conv.malformed_records,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Field helpers shared by the decoders
// ═══════════════════════════════════════════════════════════════════════

pub(crate) fn str_field<'a>(
    record: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

pub(crate) fn timestamp_field(
    record: &serde_json::Map<String, Value>,
) -> Option<chrono::DateTime<chrono::Utc>> {
    str_field(record, "timestamp")
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
}

/// Flatten a content value (string, or list of text blocks) to text.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                Value::Object(o) => o
                    .get("text")
                    .or_else(|| o.get("content"))
                    .and_then(Value::as_str),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
