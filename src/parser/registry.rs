//! Ordered parser registry and the metadata-only pre-filter.
//!
//! The registry is built explicitly and handed to the orchestrator; there
//! is no global plugin list. Plugins are kept sorted by
//! `(source, descending priority, name)` so selection is deterministic.

use std::io;
use std::path::Path;
use std::sync::Arc;

use super::claude::ClaudeCodeParser;
use super::codex::CodexParser;
use super::generic::GenericChatParser;
use super::{ConversationParser, FileProbe};

/// Registry of parser plugins.
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn ConversationParser>>,
}

impl ParserRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Registry holding the built-in `claude-code`, `codex`, and
    /// `generic-chat` plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeCodeParser::new()));
        registry.register(Arc::new(CodexParser::new()));
        registry.register(Arc::new(GenericChatParser::new()));
        registry
    }

    /// Add a plugin, keeping selection order.
    pub fn register(&mut self, parser: Arc<dyn ConversationParser>) {
        self.parsers.push(parser);
        self.parsers.sort_by(|a, b| {
            let (a, b) = (a.metadata(), b.metadata());
            a.source
                .cmp(&b.source)
                .then(b.priority.cmp(&a.priority))
                .then(a.name.cmp(&b.name))
        });
    }

    /// All registered plugins in selection order.
    pub fn parsers(&self) -> &[Arc<dyn ConversationParser>] {
        &self.parsers
    }

    /// Look up a plugin by name.
    pub fn find(&self, name: &str) -> Option<Arc<dyn ConversationParser>> {
        self.parsers
            .iter()
            .find(|p| p.metadata().name == name)
            .cloned()
    }

    /// First plugin in selection order that claims the probed file.
    pub fn select(&self, probe: &FileProbe) -> Option<Arc<dyn ConversationParser>> {
        self.parsers.iter().find(|p| p.can_parse(probe)).cloned()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap marker scan run before any plugin sees a file.
#[derive(Debug, Clone)]
pub struct Prefilter {
    pub lines: usize,
    pub markers: Vec<String>,
    pub chunk_bytes: usize,
}

impl Prefilter {
    /// Read the probe this filter and the plugins work from.
    pub fn probe(&self, path: &Path) -> io::Result<FileProbe> {
        FileProbe::read(path, self.lines, self.chunk_bytes)
    }

    /// Whether any probed record carries a marker field at top level.
    pub fn is_conversational(&self, probe: &FileProbe) -> bool {
        probe
            .objects()
            .any(|r| self.markers.iter().any(|m| r.contains_key(m.as_str())))
    }
}
