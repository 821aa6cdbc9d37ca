//! Fallback for plain chat logs: one `{role, content}` object per line.

use serde_json::{Map, Value};
use std::path::Path;

use transcript_harness_core::models::{ParsedConversation, ParsedMessage, Role};

use super::{
    parse_full, str_field, text_of, timestamp_field, Capability, ConversationParser, FileProbe,
    ParseOptions, ParserMetadata, ParserSource, RecordDecoder,
};
use crate::error::ParseError;

pub const NAME: &str = "generic-chat";

pub struct GenericChatParser {
    metadata: ParserMetadata,
}

impl GenericChatParser {
    pub fn new() -> Self {
        Self {
            metadata: ParserMetadata {
                name: NAME.to_string(),
                version: "1.0.0".to_string(),
                extensions: vec!["jsonl".to_string(), "ndjson".to_string()],
                capabilities: vec![Capability::Batch],
                priority: -100,
                source: ParserSource::Builtin,
            },
        }
    }
}

impl Default for GenericChatParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationParser for GenericChatParser {
    fn metadata(&self) -> &ParserMetadata {
        &self.metadata
    }

    fn can_parse(&self, probe: &FileProbe) -> bool {
        self.metadata.accepts_extension(&probe.path)
            && probe.objects().any(|r| {
                r.contains_key("content")
                    && str_field(r, "role").is_some_and(|role| role.parse::<Role>().is_ok())
            })
    }

    fn parse(&self, path: &Path, opts: &ParseOptions) -> Result<ParsedConversation, ParseError> {
        parse_full(path, opts, NAME, &mut Decoder)
    }
}

struct Decoder;

impl RecordDecoder for Decoder {
    fn decode(&mut self, record: &Map<String, Value>, out: &mut ParsedConversation) {
        if out.external_id.is_none() {
            out.external_id = str_field(record, "conversation_id")
                .or_else(|| str_field(record, "session_id"))
                .map(str::to_string);
        }
        let role = match str_field(record, "role").and_then(|r| r.parse::<Role>().ok()) {
            Some(r) => r,
            None => return,
        };
        let content = record.get("content").map(text_of).unwrap_or_default();
        let reasoning = str_field(record, "reasoning").map(str::to_string);
        if content.trim().is_empty() && reasoning.is_none() {
            return;
        }
        let author = str_field(record, "name")
            .or_else(|| str_field(record, "model"))
            .map(str::to_string);

        let mut m = ParsedMessage::new(role, content)
            .with_timestamp(timestamp_field(record))
            .with_author(author);
        m.reasoning = reasoning;
        m.is_error = record.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        out.messages.push(m);
    }
}
