//! Codex CLI rollout files.
//!
//! Records have the shape `{timestamp, type, payload}`. The session id
//! comes from the leading `session_meta` record; conversation content is
//! carried by `response_item` payloads.

use serde_json::{Map, Value};
use std::path::Path;

use transcript_harness_core::models::{ParsedConversation, ParsedMessage, Role, ToolPayload};

use super::{
    parse_from, parse_full, str_field, text_of, timestamp_field, Capability, ConversationParser,
    FileProbe, IncrementalResult, ParseOptions, ParserMetadata, ParserSource, RecordDecoder,
};
use crate::error::ParseError;

pub const NAME: &str = "codex";

const RECORD_TYPES: &[&str] = &[
    "session_meta",
    "response_item",
    "event_msg",
    "turn_context",
    "compacted",
];

pub struct CodexParser {
    metadata: ParserMetadata,
}

impl CodexParser {
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

impl Default for CodexParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationParser for CodexParser {
    fn metadata(&self) -> &ParserMetadata {
        &self.metadata
    }

    fn can_parse(&self, probe: &FileProbe) -> bool {
        self.metadata.accepts_extension(&probe.path)
            && probe.objects().any(|r| {
                r.get("payload").is_some_and(Value::is_object)
                    && str_field(r, "type").is_some_and(|t| RECORD_TYPES.contains(&t))
            })
    }

    fn parse(&self, path: &Path, opts: &ParseOptions) -> Result<ParsedConversation, ParseError> {
        parse_full(path, opts, NAME, &mut Decoder)
    }

    /// Only rollouts that open with `session_meta` are append-safe; older
    /// files without it get their identity from content and must be
    /// reparsed whole.
    fn supports_incremental(&self, path: &Path) -> bool {
        match FileProbe::read(path, 1, 8 * 1024) {
            Ok(probe) => probe
                .objects()
                .next()
                .is_some_and(|r| str_field(r, "type") == Some("session_meta")),
            Err(_) => false,
        }
    }

    fn parse_incremental(
        &self,
        path: &Path,
        last_offset: u64,
        last_line: u64,
        opts: &ParseOptions,
    ) -> Result<IncrementalResult, ParseError> {
        let session = session_anchor(path)?;
        let mut delta = parse_from(path, last_offset, last_line, opts, NAME, &mut Decoder)?;
        delta.external_id.get_or_insert(session);
        Ok(delta)
    }
}

/// Session id from the leading `session_meta`. A resumed pass starts past
/// that record, so the identity has to come from here.
fn session_anchor(path: &Path) -> Result<String, ParseError> {
    let probe = FileProbe::read(path, 1, 8 * 1024)?;
    let anchor = probe
        .objects()
        .next()
        .filter(|r| str_field(r, "type") == Some("session_meta"))
        .and_then(|r| r.get("payload"))
        .and_then(Value::as_object)
        .and_then(|p| str_field(p, "id"))
        .map(str::to_string)
        .ok_or_else(|| ParseError::malformed(1, "leading session_meta has no payload.id"));
    anchor
}

struct Decoder;

impl RecordDecoder for Decoder {
    fn decode(&mut self, record: &Map<String, Value>, out: &mut ParsedConversation) {
        let payload = match record.get("payload").and_then(Value::as_object) {
            Some(p) => p,
            None => return,
        };
        let ts = timestamp_field(record);

        match str_field(record, "type") {
            Some("session_meta") => {
                if out.external_id.is_none() {
                    out.external_id = str_field(payload, "id").map(str::to_string);
                }
            }
            Some("response_item") => {
                if let Some(m) = decode_item(payload) {
                    out.messages.push(m.with_timestamp(ts));
                }
            }
            Some("event_msg") if str_field(payload, "type") == Some("error") => {
                let text = str_field(payload, "message").unwrap_or("error");
                let mut m = ParsedMessage::new(Role::System, text).with_timestamp(ts);
                m.is_error = true;
                out.messages.push(m);
            }
            Some("compacted") => {
                let text = str_field(payload, "message")
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or("conversation compacted");
                let mut m = ParsedMessage::new(Role::System, text).with_timestamp(ts);
                m.is_boundary = true;
                out.messages.push(m);
            }
            _ => {}
        }
    }
}

fn decode_item(payload: &Map<String, Value>) -> Option<ParsedMessage> {
    match str_field(payload, "type")? {
        "message" => {
            let role = str_field(payload, "role")?.parse::<Role>().ok()?;
            let text = payload.get("content").map(text_of).unwrap_or_default();
            if text.trim().is_empty() {
                return None;
            }
            Some(ParsedMessage::new(role, text))
        }
        "reasoning" => {
            let summary = payload.get("summary").map(text_of).unwrap_or_default();
            if summary.trim().is_empty() {
                return None;
            }
            let mut m = ParsedMessage::new(Role::Assistant, "");
            m.reasoning = Some(summary);
            Some(m)
        }
        "function_call" | "custom_tool_call" => {
            let name = str_field(payload, "name").unwrap_or("tool").to_string();
            let raw = payload
                .get("arguments")
                .or_else(|| payload.get("input"))
                .cloned()
                .unwrap_or(Value::Null);
            let input = match raw {
                Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                other => other,
            };
            let call_id = str_field(payload, "call_id").map(str::to_string);
            Some(
                ParsedMessage::new(Role::Assistant, super::claude::summarize_input(&input))
                    .with_tool(ToolPayload::Call {
                        call_id,
                        name,
                        input,
                    }),
            )
        }
        "function_call_output" | "custom_tool_call_output" => {
            let (output, is_error) = decode_output(payload.get("output")?);
            let call_id = str_field(payload, "call_id").map(str::to_string);
            Some(
                ParsedMessage::new(Role::Tool, output.clone()).with_tool(ToolPayload::Result {
                    call_id,
                    output,
                    is_error,
                }),
            )
        }
        _ => None,
    }
}

/// Tool output is either plain text or a JSON string of the form
/// `{"output": ..., "metadata": {"exit_code": N}}`.
fn decode_output(value: &Value) -> (String, bool) {
    let text = text_of(value);
    let parsed = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(o)) => o,
        _ => return (text, false),
    };
    let exit_code = parsed
        .get("metadata")
        .and_then(|m| m.get("exit_code"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let output = parsed.get("output").map(text_of).unwrap_or(text);
    (output, exit_code != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLLOUT: &[&str] = &[
        r#"{"timestamp":"2025-02-01T09:00:00Z","type":"session_meta","payload":{"id":"rollout-1","cwd":"/repo"}}"#,
        r#"{"timestamp":"2025-02-01T09:00:01Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"run the tests"}]}}"#,
        r#"{"timestamp":"2025-02-01T09:00:02Z","type":"response_item","payload":{"type":"reasoning","summary":[{"type":"summary_text","text":"use cargo"}]}}"#,
        r#"{"timestamp":"2025-02-01T09:00:03Z","type":"response_item","payload":{"type":"function_call","name":"shell","arguments":"{\"command\":\"cargo test\"}","call_id":"c1"}}"#,
        r#"{"timestamp":"2025-02-01T09:00:04Z","type":"response_item","payload":{"type":"function_call_output","call_id":"c1","output":"{\"output\":\"1 failed\",\"metadata\":{\"exit_code\":101}}"}}"#,
        r#"{"timestamp":"2025-02-01T09:00:05Z","type":"event_msg","payload":{"type":"token_count"}}"#,
        r#"{"timestamp":"2025-02-01T09:00:06Z","type":"response_item","payload":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"One test fails."}]}}"#,
    ];

    fn write(dir: &tempfile::TempDir, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join("rollout.jsonl");
        std::fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();
        path
    }

    #[test]
    fn parses_rollout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, ROLLOUT);
        let parser = CodexParser::new();
        assert!(parser.can_parse(&FileProbe::read(&path, 5, 8192).unwrap()));
        assert!(parser.supports_incremental(&path));

        let conv = parser.parse(&path, &ParseOptions::default()).unwrap();
        assert_eq!(conv.external_id.as_deref(), Some("rollout-1"));
        assert_eq!(conv.messages.len(), 5);
        assert_eq!(conv.messages[1].reasoning.as_deref(), Some("use cargo"));
        assert_eq!(conv.messages[2].content, "cargo test");
        assert_eq!(conv.messages[3].content, "1 failed");
        assert!(conv.messages[3].is_error);
        assert_eq!(conv.messages[4].role, Role::Assistant);
    }

    #[test]
    fn missing_session_meta_is_not_append_safe() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, &ROLLOUT[1..]);
        let parser = CodexParser::new();
        assert!(parser.can_parse(&FileProbe::read(&path, 5, 8192).unwrap()));
        assert!(!parser.supports_incremental(&path));
    }

    #[test]
    fn resume_reads_session_id_from_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, ROLLOUT);
        let head = format!("{}\n{}\n", ROLLOUT[0], ROLLOUT[1]).len() as u64;
        let delta = CodexParser::new()
            .parse_incremental(&path, head, 2, &ParseOptions::default())
            .unwrap();
        assert_eq!(delta.external_id.as_deref(), Some("rollout-1"));
        assert_eq!(delta.new_messages.len(), 4);
        assert_eq!(delta.new_line, 7);
    }

    #[test]
    fn resume_without_session_id_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let anchor = r#"{"timestamp":"2025-02-01T09:00:00Z","type":"session_meta","payload":{"cwd":"/repo"}}"#;
        let mut lines = vec![anchor];
        lines.extend_from_slice(&ROLLOUT[1..]);
        let path = write(&dir, &lines);
        let parser = CodexParser::new();
        assert!(parser.supports_incremental(&path));
        let err = parser
            .parse_incremental(&path, 0, 0, &ParseOptions::default())
            .unwrap_err();
        assert!(matches!(err, ParseError::Malformed { line: 1, .. }));
    }
}
