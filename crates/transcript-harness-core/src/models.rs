//! Core data models used throughout Transcript Harness.
//!
//! These types represent the parsed messages, persisted conversations,
//! checkpoints, ingestion outcomes, and canonical artifacts that flow
//! through the ingestion and enrichment pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Author role of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" | "human" => Ok(Role::User),
            "assistant" | "model" => Ok(Role::Assistant),
            "system" | "developer" => Ok(Role::System),
            "tool" | "function" => Ok(Role::Tool),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Tool-call or tool-result payload attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolPayload {
    /// The assistant invoked a tool.
    Call {
        call_id: Option<String>,
        name: String,
        input: serde_json::Value,
    },
    /// A tool returned output to the assistant.
    Result {
        call_id: Option<String>,
        output: String,
        is_error: bool,
    },
}

impl ToolPayload {
    pub fn is_call(&self) -> bool {
        matches!(self, ToolPayload::Call { .. })
    }

    /// Tool name for calls, `None` for results.
    pub fn name(&self) -> Option<&str> {
        match self {
            ToolPayload::Call { name, .. } => Some(name),
            ToolPayload::Result { .. } => None,
        }
    }
}

/// One ordered unit of a conversation, as produced by a parse pass.
///
/// `seq` is relative to the pass that produced the message until the
/// orchestrator renumbers it against the persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub seq: i64,
    pub role: Role,
    /// Model, agent, or tool name when the format records one.
    pub author: Option<String>,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub tool: Option<ToolPayload>,
    /// Extended reasoning ("thinking") text, kept apart from `content`.
    pub reasoning: Option<String>,
    pub is_error: bool,
    /// Set by parsers on segment markers such as context compaction.
    pub is_boundary: bool,
    /// Source record the message came from, kept when `[ingest] keep_raw`
    /// is set. Built-in plugins fill it through the shared JSONL driver.
    pub raw: Option<String>,
}

impl ParsedMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role,
            author: None,
            content: content.into(),
            timestamp: None,
            tool: None,
            reasoning: None,
            is_error: false,
            is_boundary: false,
            raw: None,
        }
    }

    pub fn with_tool(mut self, tool: ToolPayload) -> Self {
        if let ToolPayload::Result { is_error, .. } = &tool {
            self.is_error |= *is_error;
        }
        self.tool = Some(tool);
        self
    }

    pub fn with_timestamp(mut self, ts: Option<DateTime<Utc>>) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.author = author;
        self
    }

    /// True when this message is a user prompt rather than a tool result
    /// delivered in a user-role record.
    pub fn is_user_prompt(&self) -> bool {
        self.role == Role::User && self.tool.is_none()
    }
}

/// Summary counts of a parse pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub user: usize,
    pub assistant: usize,
    pub system: usize,
    pub tool_calls: usize,
    pub tool_results: usize,
    pub errors: usize,
}

/// Output of one full parse pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedConversation {
    /// Name of the parser plugin that produced this conversation.
    pub parser: String,
    /// Session identifier embedded in the source, if any.
    pub external_id: Option<String>,
    /// Parent session identifier for sub-agent transcripts.
    pub parent_external_id: Option<String>,
    pub messages: Vec<ParsedMessage>,
    pub counts: MessageCounts,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Byte offset just past the last complete record.
    pub end_offset: u64,
    /// Number of complete lines consumed.
    pub line_count: u64,
    /// Complete records that could not be decoded and were skipped.
    pub malformed_records: usize,
}

impl ParsedConversation {
    pub fn new(parser: impl Into<String>) -> Self {
        Self {
            parser: parser.into(),
            ..Default::default()
        }
    }

    /// Recompute counts, timestamps, and pass-relative sequence numbers.
    pub fn finalize(&mut self) {
        let mut counts = MessageCounts::default();
        for (i, m) in self.messages.iter_mut().enumerate() {
            m.seq = i as i64;
            match m.role {
                Role::User => counts.user += 1,
                Role::Assistant => counts.assistant += 1,
                Role::System => counts.system += 1,
                Role::Tool => {}
            }
            match &m.tool {
                Some(ToolPayload::Call { .. }) => counts.tool_calls += 1,
                Some(ToolPayload::Result { .. }) => counts.tool_results += 1,
                None => {}
            }
            if m.is_error {
                counts.errors += 1;
            }
        }
        self.counts = counts;
        self.started_at = self.messages.iter().filter_map(|m| m.timestamp).min();
        self.ended_at = self.messages.iter().filter_map(|m| m.timestamp).max();
    }
}

/// Durable record of how far a source file has been consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub file_path: String,
    /// SHA-256 over the first `file_size_bytes` bytes.
    pub content_hash: String,
    pub file_size_bytes: u64,
    pub last_processed_offset: u64,
    pub last_processed_line: u64,
    /// SHA-256 over the first `min(prefix size, file_size_bytes)` bytes.
    pub partial_hash: String,
    pub parser: String,
    pub conversation_id: Option<String>,
    /// Set when this path's content is owned by a conversation ingested
    /// from another path; any later change forces a full pass.
    pub duplicate_of: Option<String>,
    pub updated_at: i64,
}

/// Persisted conversation aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub parent_id: Option<String>,
    pub source_path: String,
    pub parser: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    /// Incremented whenever the message sequence changes.
    pub revision: i64,
    pub updated_at: i64,
}

/// Classification of a file mutation relative to its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Full,
    Unchanged,
    Append,
    Truncate,
    Rewrite,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Full => "full",
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::Append => "append",
            ChangeKind::Truncate => "truncate",
            ChangeKind::Rewrite => "rewrite",
        }
    }

    /// Whether this classification requires reading the file from the start.
    pub fn needs_full_parse(&self) -> bool {
        matches!(
            self,
            ChangeKind::Full | ChangeKind::Truncate | ChangeKind::Rewrite
        )
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of one file in one ingestion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Success,
    Failed,
    Duplicate,
    Skipped,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Success => "success",
            IngestionStatus::Failed => "failed",
            IngestionStatus::Duplicate => "duplicate",
            IngestionStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(IngestionStatus::Success),
            "failed" => Ok(IngestionStatus::Failed),
            "duplicate" => Ok(IngestionStatus::Duplicate),
            "skipped" => Ok(IngestionStatus::Skipped),
            other => Err(format!("unknown ingestion status: {}", other)),
        }
    }
}

/// Pipeline stage, used to label timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detect,
    Select,
    Parse,
    Dedupe,
    Persist,
    Handoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub micros: u64,
}

/// Audit record for one attempted file in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionOutcome {
    pub file_path: String,
    pub status: IngestionStatus,
    pub change: Option<ChangeKind>,
    pub parser: Option<String>,
    pub conversation_id: Option<String>,
    pub messages_added: usize,
    /// Human-readable explanation; never empty.
    pub reason: String,
    pub timings: Vec<StageTiming>,
    pub batch_id: Option<String>,
    pub recorded_at: i64,
}

impl IngestionOutcome {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            status: IngestionStatus::Skipped,
            change: None,
            parser: None,
            conversation_id: None,
            messages_added: 0,
            reason: String::new(),
            timings: Vec::new(),
            batch_id: None,
            recorded_at: Utc::now().timestamp(),
        }
    }

    pub fn finish(mut self, status: IngestionStatus, reason: impl Into<String>) -> Self {
        self.status = status;
        self.reason = reason.into();
        self
    }

    pub fn total_micros(&self) -> u64 {
        self.timings.iter().map(|t| t.micros).sum()
    }
}

/// Sampling strategy used to build a canonical artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Priority-budgeted selection.
    #[default]
    Semantic,
    /// Complete first and last segments, priority-budgeted elsewhere.
    Epoch,
    /// Every message, no budget. Reserved for export.
    Chronological,
}

impl SamplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategy::Semantic => "semantic",
            SamplingStrategy::Epoch => "epoch",
            SamplingStrategy::Chronological => "chronological",
        }
    }

    pub fn is_bounded(&self) -> bool {
        !matches!(self, SamplingStrategy::Chronological)
    }
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SamplingStrategy::Semantic),
            "epoch" => Ok(SamplingStrategy::Epoch),
            "chronological" => Ok(SamplingStrategy::Chronological),
            other => Err(format!(
                "unknown sampling strategy: '{}'. Must be semantic, epoch, or chronological.",
                other
            )),
        }
    }
}

/// Token-budgeted narrative derived from one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalArtifact {
    pub conversation_id: String,
    pub canonical_type: String,
    pub strategy: SamplingStrategy,
    pub strategy_version: u32,
    /// Conversation revision the artifact was rendered from.
    pub source_revision: i64,
    pub budget: usize,
    pub token_count: usize,
    pub messages_selected: usize,
    pub messages_total: usize,
    pub text: String,
    pub created_at: i64,
}

impl CanonicalArtifact {
    /// Whether this cached artifact still matches its source and settings.
    pub fn is_fresh(&self, revision: i64, budget: usize, strategy_version: u32) -> bool {
        self.source_revision == revision
            && self.budget == budget
            && self.strategy_version == strategy_version
    }
}

/// Opaque output of the external enrichment service, stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub conversation_id: String,
    pub canonical_type: String,
    pub source_revision: i64,
    pub provider: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}
