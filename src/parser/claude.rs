//! Claude Code session transcripts.
//!
//! One JSON record per line. `user` and `assistant` records wrap an
//! API-style `message` whose `content` is a string or a list of blocks;
//! `system` records carry notices such as compaction boundaries. Sub-agent
//! transcripts set `isSidechain` and `agentId` and share the parent's
//! `sessionId`.

use serde_json::{Map, Value};
use std::path::Path;

use transcript_harness_core::models::{ParsedConversation, ParsedMessage, Role, ToolPayload};

use super::{
    parse_from, parse_full, str_field, text_of, timestamp_field, Capability, ConversationParser,
    FileProbe, IncrementalResult, ParseOptions, ParserMetadata, ParserSource, RecordDecoder,
};
use crate::error::ParseError;

pub const NAME: &str = "claude-code";

pub struct ClaudeCodeParser {
    metadata: ParserMetadata,
}

impl ClaudeCodeParser {
    pub fn new() -> Self {
        Self {
            metadata: ParserMetadata {
                name: NAME.to_string(),
                version: "1.0.0".to_string(),
                extensions: vec!["jsonl".to_string()],
                capabilities: vec![Capability::Batch, Capability::Incremental],
                priority: 100,
                source: ParserSource::Builtin,
            },
        }
    }
}

impl Default for ClaudeCodeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationParser for ClaudeCodeParser {
    fn metadata(&self) -> &ParserMetadata {
        &self.metadata
    }

    fn can_parse(&self, probe: &FileProbe) -> bool {
        self.metadata.accepts_extension(&probe.path)
            && probe.objects().any(|r| {
                r.contains_key("sessionId")
                    && matches!(
                        str_field(r, "type"),
                        Some("user" | "assistant" | "system")
                    )
            })
    }

    fn parse(&self, path: &Path, opts: &ParseOptions) -> Result<ParsedConversation, ParseError> {
        parse_full(path, opts, NAME, &mut Decoder)
    }

    fn supports_incremental(&self, _path: &Path) -> bool {
        true
    }

    fn parse_incremental(
        &self,
        path: &Path,
        last_offset: u64,
        last_line: u64,
        opts: &ParseOptions,
    ) -> Result<IncrementalResult, ParseError> {
        parse_from(path, last_offset, last_line, opts, NAME, &mut Decoder)
    }
}

struct Decoder;

impl RecordDecoder for Decoder {
    fn decode(&mut self, record: &Map<String, Value>, out: &mut ParsedConversation) {
        if out.external_id.is_none() {
            let session = str_field(record, "sessionId").map(str::to_string);
            let agent = str_field(record, "agentId").map(str::to_string);
            let sidechain = record
                .get("isSidechain")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            match (sidechain, agent) {
                (true, Some(agent)) => {
                    out.external_id = Some(agent);
                    out.parent_external_id = session;
                }
                _ => out.external_id = session,
            }
        }

        if record.get("isMeta").and_then(Value::as_bool) == Some(true) {
            return;
        }
        let ts = timestamp_field(record);

        match str_field(record, "type") {
            Some("user") => decode_user(record, ts, out),
            Some("assistant") => decode_assistant(record, ts, out),
            Some("system") => decode_system(record, ts, out),
            _ => {}
        }
    }
}

type Timestamp = Option<chrono::DateTime<chrono::Utc>>;

fn blocks(record: &Map<String, Value>) -> Option<&Value> {
    record.get("message").and_then(|m| m.get("content"))
}

fn decode_user(record: &Map<String, Value>, ts: Timestamp, out: &mut ParsedConversation) {
    let content = match blocks(record) {
        Some(c) => c,
        None => return,
    };
    let items = match content {
        Value::Array(items) => items,
        other => {
            let text = text_of(other);
            if !text.trim().is_empty() {
                out.messages
                    .push(ParsedMessage::new(Role::User, text).with_timestamp(ts));
            }
            return;
        }
    };

    let mut text = Vec::new();
    let mut results = Vec::new();
    for block in items {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push(t.to_string());
                }
            }
            Some("tool_result") => {
                let output = block.get("content").map(text_of).unwrap_or_default();
                let is_error = block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let call_id = block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                results.push(
                    ParsedMessage::new(Role::Tool, output.clone())
                        .with_timestamp(ts)
                        .with_tool(ToolPayload::Result {
                            call_id,
                            output,
                            is_error,
                        }),
                );
            }
            _ => {}
        }
    }

    let text = text.join("\n");
    if !text.trim().is_empty() {
        out.messages
            .push(ParsedMessage::new(Role::User, text).with_timestamp(ts));
    }
    out.messages.extend(results);
}

fn decode_assistant(record: &Map<String, Value>, ts: Timestamp, out: &mut ParsedConversation) {
    let model = record
        .get("message")
        .and_then(|m| m.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let content = match blocks(record) {
        Some(c) => c,
        None => return,
    };
    let items = match content {
        Value::Array(items) => items.as_slice(),
        other => {
            let text = text_of(other);
            if !text.trim().is_empty() {
                out.messages.push(
                    ParsedMessage::new(Role::Assistant, text)
                        .with_timestamp(ts)
                        .with_author(model),
                );
            }
            return;
        }
    };

    let mut text = Vec::new();
    let mut reasoning = Vec::new();
    let mut calls = Vec::new();
    for block in items {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push(t.to_string());
                }
            }
            Some("thinking") => {
                if let Some(t) = block.get("thinking").and_then(Value::as_str) {
                    reasoning.push(t.to_string());
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                let call_id = block.get("id").and_then(Value::as_str).map(str::to_string);
                calls.push(
                    ParsedMessage::new(Role::Assistant, summarize_input(&input))
                        .with_timestamp(ts)
                        .with_author(model.clone())
                        .with_tool(ToolPayload::Call {
                            call_id,
                            name,
                            input,
                        }),
                );
            }
            _ => {}
        }
    }

    let text = text.join("\n");
    let reasoning = reasoning.join("\n");
    if !text.trim().is_empty() || !reasoning.trim().is_empty() {
        let mut m = ParsedMessage::new(Role::Assistant, text)
            .with_timestamp(ts)
            .with_author(model);
        if !reasoning.trim().is_empty() {
            m.reasoning = Some(reasoning);
        }
        out.messages.push(m);
    }
    out.messages.extend(calls);
}

fn decode_system(record: &Map<String, Value>, ts: Timestamp, out: &mut ParsedConversation) {
    let boundary = str_field(record, "subtype") == Some("compact_boundary");
    let content = str_field(record, "content").unwrap_or_default();
    if !boundary && content.trim().is_empty() {
        return;
    }
    let text = if content.trim().is_empty() {
        "conversation compacted".to_string()
    } else {
        content.to_string()
    };
    let mut m = ParsedMessage::new(Role::System, text).with_timestamp(ts);
    m.is_boundary = boundary;
    m.is_error = str_field(record, "level") == Some("error");
    out.messages.push(m);
}

/// One-line rendering of a tool input: the salient argument when there is
/// one, compact JSON otherwise.
pub(crate) fn summarize_input(input: &Value) -> String {
    for key in ["command", "file_path", "path", "pattern", "url", "query"] {
        if let Some(v) = input.get(key).and_then(Value::as_str) {
            return v.to_string();
        }
    }
    match input {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
