//! End-to-end pipeline tests against the in-memory and SQLite stores.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use transcript_harness::config::parse_config;
use transcript_harness::dedup::DuplicatePolicy;
use transcript_harness::enrich::{spawn_worker, Enricher, EnrichmentRequest};
use transcript_harness::error::ParseError;
use transcript_harness::ingest::{path_key, IngestSettings, Ingestor};
use transcript_harness::parser::claude::ClaudeCodeParser;
use transcript_harness::parser::{
    Capability, ConversationParser, FileProbe, IncrementalResult, ParseOptions, ParserMetadata,
    ParserRegistry, ParserSource,
};
use transcript_harness::sqlite_store::SqliteStore;
use transcript_harness_core::models::{ChangeKind, IngestionStatus, ParsedConversation};
use transcript_harness_core::store::memory::InMemoryStore;
use transcript_harness_core::store::Store;

fn user(session: &str, i: usize, text: &str) -> String {
    format!(
        r#"{{"type":"user","sessionId":"{}","uuid":"u{}","timestamp":"2025-03-01T10:{:02}:00Z","message":{{"role":"user","content":"{}"}}}}"#,
        session,
        i,
        i % 60,
        text
    )
}

fn assistant(session: &str, i: usize, text: &str) -> String {
    format!(
        r#"{{"type":"assistant","sessionId":"{}","uuid":"a{}","timestamp":"2025-03-01T10:{:02}:30Z","message":{{"role":"assistant","model":"claude-sonnet","content":[{{"type":"text","text":"{}"}}]}}}}"#,
        session,
        i,
        i % 60,
        text
    )
}

/// `n` alternating user/assistant records.
fn records(session: &str, range: std::ops::Range<usize>) -> Vec<String> {
    range
        .map(|i| {
            if i % 2 == 0 {
                user(session, i, &format!("question {}", i))
            } else {
                assistant(session, i, &format!("answer {}", i))
            }
        })
        .collect()
}

fn write_lines(path: &Path, lines: &[String]) {
    let mut body = String::new();
    for l in lines {
        body.push_str(l);
        body.push('\n');
    }
    fs::write(path, body).unwrap();
}

fn append_raw(path: &Path, text: &str) {
    let mut f = OpenOptions::new().append(true).open(path).unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

fn append_lines(path: &Path, lines: &[String]) {
    let mut body = String::new();
    for l in lines {
        body.push_str(l);
        body.push('\n');
    }
    append_raw(path, &body);
}

fn ingestor(store: Arc<dyn Store>) -> Ingestor {
    Ingestor::new(store, ParserRegistry::with_builtins(), IngestSettings::default())
}

fn ingestor_with_policy(store: Arc<dyn Store>, policy: DuplicatePolicy) -> Ingestor {
    let settings = IngestSettings {
        policy,
        ..IngestSettings::default()
    };
    Ingestor::new(store, ParserRegistry::with_builtins(), settings)
}

fn transcript(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[tokio::test]
async fn unmodified_file_reports_unchanged_twice() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    write_lines(&path, &records("s1", 0..4));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());

    let first = ingestor.ingest_file(&path).await;
    assert_eq!(first.status, IngestionStatus::Success);
    assert_eq!(first.change, Some(ChangeKind::Full));
    assert_eq!(first.messages_added, 4);

    for _ in 0..2 {
        let again = ingestor.ingest_file(&path).await;
        assert_eq!(again.status, IngestionStatus::Skipped);
        assert_eq!(again.change, Some(ChangeKind::Unchanged));
        assert_eq!(again.messages_added, 0);
        assert!(!again.reason.is_empty());
    }
    assert_eq!(store.get_messages("s1").await.unwrap().len(), 4);
}

async fn assert_append_matches_full(resumed: Arc<dyn Store>, fresh: Arc<dyn Store>, dir: &TempDir) {
    let path = transcript(dir, "session.jsonl");
    write_lines(&path, &records("s1", 0..5));

    let first = ingestor(resumed.clone()).ingest_file(&path).await;
    assert_eq!(first.messages_added, 5);

    append_lines(&path, &records("s1", 5..8));
    let delta = ingestor(resumed.clone()).ingest_file(&path).await;
    assert_eq!(delta.status, IngestionStatus::Success, "{}", delta.reason);
    assert_eq!(delta.change, Some(ChangeKind::Append));
    assert_eq!(delta.messages_added, 3);

    let full = ingestor(fresh.clone()).ingest_file(&path).await;
    assert_eq!(full.change, Some(ChangeKind::Full));

    let incremental = resumed.get_messages("s1").await.unwrap();
    let reparsed = fresh.get_messages("s1").await.unwrap();
    assert_eq!(incremental.len(), 8);
    assert_eq!(incremental, reparsed);

    let conv = resumed.get_conversation("s1").await.unwrap().unwrap();
    assert_eq!(conv.message_count, 8);

    let cp = resumed.get_checkpoint(&path_key(&path)).await.unwrap().unwrap();
    assert_eq!(cp.last_processed_offset, fs::metadata(&path).unwrap().len());
    assert_eq!(cp.last_processed_line, 8);
}

#[tokio::test]
async fn append_matches_full_reparse_in_memory() {
    let dir = TempDir::new().unwrap();
    assert_append_matches_full(
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryStore::new()),
        &dir,
    )
    .await;
}

#[tokio::test]
async fn append_matches_full_reparse_sqlite() {
    let dir = TempDir::new().unwrap();
    let resumed = SqliteStore::open(&dir.path().join("a.sqlite")).await.unwrap();
    let fresh = SqliteStore::open(&dir.path().join("b.sqlite")).await.unwrap();
    assert_append_matches_full(Arc::new(resumed), Arc::new(fresh), &dir).await;
}

#[tokio::test]
async fn truncation_forces_full_reparse() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    write_lines(&path, &records("s1", 0..6));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());
    ingestor.ingest_file(&path).await;

    write_lines(&path, &records("s1", 0..2));
    let outcome = ingestor.ingest_file(&path).await;
    assert_eq!(outcome.change, Some(ChangeKind::Truncate));
    assert_eq!(outcome.status, IngestionStatus::Success);

    let messages = store.get_messages("s1").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "answer 1");
    let conv = store.get_conversation("s1").await.unwrap().unwrap();
    assert_eq!(conv.message_count, 2);
}

#[tokio::test]
async fn rewritten_prefix_is_reparsed() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    write_lines(&path, &records("s1", 0..2));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());
    ingestor.ingest_file(&path).await;

    let mut lines = vec![user("s1", 0, "edited question with more words")];
    lines.extend(records("s1", 1..3));
    write_lines(&path, &lines);
    let outcome = ingestor.ingest_file(&path).await;
    assert_eq!(outcome.change, Some(ChangeKind::Rewrite));

    let messages = store.get_messages("s1").await.unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content, "edited question with more words");
}

#[tokio::test]
async fn identical_content_at_two_paths_is_one_conversation() {
    let dir = TempDir::new().unwrap();
    let a = transcript(&dir, "a.jsonl");
    let b = transcript(&dir, "b.jsonl");
    write_lines(&a, &records("s1", 0..3));
    fs::copy(&a, &b).unwrap();

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());
    assert_eq!(ingestor.ingest_file(&a).await.status, IngestionStatus::Success);

    let dup = ingestor.ingest_file(&b).await;
    assert_eq!(dup.status, IngestionStatus::Duplicate);
    assert_eq!(dup.conversation_id.as_deref(), Some("s1"));
    assert!(dup.reason.contains("a.jsonl"));
    assert_eq!(store.conversation_count(), 1);

    let again = ingestor.ingest_file(&b).await;
    assert_eq!(again.change, Some(ChangeKind::Unchanged));
    assert_eq!(store.get_messages("s1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn grown_duplicate_goes_through_dedup() {
    let dir = TempDir::new().unwrap();
    let a = transcript(&dir, "a.jsonl");
    let b = transcript(&dir, "b.jsonl");
    write_lines(&a, &records("s1", 0..3));
    fs::copy(&a, &b).unwrap();

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());
    ingestor.ingest_file(&a).await;
    ingestor.ingest_file(&b).await;

    append_lines(&b, &records("s1", 3..4));
    let outcome = ingestor.ingest_file(&b).await;
    assert_eq!(outcome.change, Some(ChangeKind::Append));
    assert_eq!(outcome.status, IngestionStatus::Success, "{}", outcome.reason);
    assert_eq!(outcome.messages_added, 1);
    assert!(outcome.reason.contains("owned by"));

    let conv = store.get_conversation("s1").await.unwrap().unwrap();
    assert_eq!(conv.message_count, 4);
    assert_eq!(conv.source_path, path_key(&a));
    let cp = store.get_checkpoint(&path_key(&b)).await.unwrap().unwrap();
    assert_eq!(cp.duplicate_of.as_deref(), Some(path_key(&a).as_str()));
}

#[tokio::test]
async fn skip_existing_leaves_owner_untouched() {
    let dir = TempDir::new().unwrap();
    let a = transcript(&dir, "a.jsonl");
    let b = transcript(&dir, "b.jsonl");
    write_lines(&a, &records("s1", 0..2));
    write_lines(&b, &records("s1", 0..4));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor_with_policy(store.clone(), DuplicatePolicy::SkipExisting);
    ingestor.ingest_file(&a).await;
    let outcome = ingestor.ingest_file(&b).await;

    assert_eq!(outcome.status, IngestionStatus::Duplicate);
    assert_eq!(store.get_messages("s1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn append_new_adds_only_unseen_messages() {
    let dir = TempDir::new().unwrap();
    let a = transcript(&dir, "a.jsonl");
    let b = transcript(&dir, "b.jsonl");
    write_lines(&a, &records("s1", 0..2));
    write_lines(&b, &records("s1", 0..5));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor_with_policy(store.clone(), DuplicatePolicy::AppendNew);
    ingestor.ingest_file(&a).await;
    let outcome = ingestor.ingest_file(&b).await;

    assert_eq!(outcome.status, IngestionStatus::Success, "{}", outcome.reason);
    assert_eq!(outcome.messages_added, 3);
    let conv = store.get_conversation("s1").await.unwrap().unwrap();
    assert_eq!(conv.message_count, 5);
    assert_eq!(conv.source_path, path_key(&a));
    assert_eq!(store.conversation_count(), 1);
}

#[tokio::test]
async fn replace_existing_moves_ownership() {
    let dir = TempDir::new().unwrap();
    let a = transcript(&dir, "a.jsonl");
    let b = transcript(&dir, "b.jsonl");
    write_lines(&a, &records("s1", 0..4));
    write_lines(&b, &records("s1", 0..1));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor_with_policy(store.clone(), DuplicatePolicy::ReplaceExisting);
    ingestor.ingest_file(&a).await;
    ingestor.ingest_file(&b).await;

    let conv = store.get_conversation("s1").await.unwrap().unwrap();
    assert_eq!(conv.message_count, 1);
    assert_eq!(conv.source_path, path_key(&b));
}

async fn assert_displaced_owner_reresolves(store: Arc<dyn Store>, dir: &TempDir) {
    let a = transcript(dir, "a.jsonl");
    let b = transcript(dir, "b.jsonl");
    write_lines(&a, &records("s1", 0..4));
    write_lines(&b, &[user("s1", 0, "from b")]);

    let ingestor = ingestor_with_policy(store.clone(), DuplicatePolicy::ReplaceExisting);
    ingestor.ingest_file(&a).await;
    ingestor.ingest_file(&b).await;
    let displaced = store.get_checkpoint(&path_key(&a)).await.unwrap().unwrap();
    assert_eq!(displaced.duplicate_of.as_deref(), Some(path_key(&b).as_str()));

    append_lines(&a, &records("s1", 4..5));
    let outcome = ingestor.ingest_file(&a).await;
    assert_eq!(outcome.change, Some(ChangeKind::Append));
    assert_eq!(outcome.status, IngestionStatus::Success, "{}", outcome.reason);
    assert!(outcome.reason.starts_with("replaced conversation with 5 messages"));

    let conv = store.get_conversation("s1").await.unwrap().unwrap();
    assert_eq!(conv.source_path, path_key(&a));
    let contents: Vec<String> = store
        .get_messages("s1")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents.len(), 5);
    assert!(!contents.iter().any(|c| c == "from b"));
    assert_eq!(contents[4], "question 4");
}

#[tokio::test]
async fn displaced_owner_is_reresolved_in_memory() {
    let dir = TempDir::new().unwrap();
    assert_displaced_owner_reresolves(Arc::new(InMemoryStore::new()), &dir).await;
}

#[tokio::test]
async fn displaced_owner_is_reresolved_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("th.sqlite")).await.unwrap();
    assert_displaced_owner_reresolves(Arc::new(store), &dir).await;
}

#[tokio::test]
async fn concurrent_batch_commits_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let mut paths = Vec::new();
    for i in 0..40 {
        let path = transcript(&dir, &format!("s{}.jsonl", i));
        write_lines(&path, &records(&format!("s{}", i), 0..20));
        paths.push(path);
    }

    let store = Arc::new(SqliteStore::open(&dir.path().join("th.sqlite")).await.unwrap());
    let settings = IngestSettings {
        workers: 8,
        ..IngestSettings::default()
    };
    let ingestor = Ingestor::new(store.clone(), ParserRegistry::with_builtins(), settings);
    let report = ingestor.ingest_batch(&paths, None).await;

    let failures: Vec<&str> = report
        .outcomes
        .iter()
        .filter(|o| o.status != IngestionStatus::Success)
        .map(|o| o.reason.as_str())
        .collect();
    assert!(failures.is_empty(), "failed: {:?}", failures);
    assert_eq!(report.success, 40);
    assert_eq!(report.messages_added, 800);
    for i in [0, 17, 39] {
        let conv = store.get_conversation(&format!("s{}", i)).await.unwrap().unwrap();
        assert_eq!(conv.message_count, 20);
    }
    assert_eq!(store.recent_outcomes(100).await.unwrap().len(), 40);

    for (i, path) in paths[..10].iter().enumerate() {
        append_lines(path, &[user(&format!("s{}", i), 20, "one more")]);
    }
    let again = ingestor.ingest_batch(&paths, None).await;
    assert_eq!(again.failed, 0);
    assert_eq!(again.success, 10);
    assert_eq!(again.skipped, 30);
    assert_eq!(again.messages_added, 10);
}

/// Parses like the Claude Code plugin but can never resume.
struct ResumeFails {
    inner: ClaudeCodeParser,
    meta: ParserMetadata,
}

impl ResumeFails {
    fn registry() -> ParserRegistry {
        let mut registry = ParserRegistry::new();
        registry.register(Arc::new(ResumeFails {
            inner: ClaudeCodeParser::new(),
            meta: ParserMetadata {
                name: "resume-fails".into(),
                version: "0.1.0".into(),
                extensions: vec!["jsonl".into()],
                capabilities: vec![Capability::Batch, Capability::Incremental],
                priority: 0,
                source: ParserSource::Local,
            },
        }));
        registry
    }
}

impl ConversationParser for ResumeFails {
    fn metadata(&self) -> &ParserMetadata {
        &self.meta
    }
    fn can_parse(&self, probe: &FileProbe) -> bool {
        self.inner.can_parse(probe)
    }
    fn parse(&self, path: &Path, opts: &ParseOptions) -> Result<ParsedConversation, ParseError> {
        self.inner.parse(path, opts)
    }
    fn supports_incremental(&self, _path: &Path) -> bool {
        true
    }
    fn parse_incremental(
        &self,
        _path: &Path,
        last_offset: u64,
        _last_line: u64,
        _opts: &ParseOptions,
    ) -> Result<IncrementalResult, ParseError> {
        Err(ParseError::malformed(last_offset, "resume anchor lost"))
    }
}

#[tokio::test]
async fn failed_resume_falls_back_to_full_pass() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    write_lines(&path, &records("s1", 0..4));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(store.clone(), ResumeFails::registry(), IngestSettings::default());
    assert_eq!(ingestor.ingest_file(&path).await.messages_added, 4);

    append_lines(&path, &records("s1", 4..6));
    let outcome = ingestor.ingest_file(&path).await;
    assert_eq!(outcome.change, Some(ChangeKind::Append));
    assert_eq!(outcome.status, IngestionStatus::Success, "{}", outcome.reason);
    assert_eq!(outcome.parser.as_deref(), Some("resume-fails"));
    assert!(outcome.reason.starts_with("replaced conversation with 6 messages"));
    assert_eq!(outcome.messages_added, 6);

    let fresh = Arc::new(InMemoryStore::new());
    Ingestor::new(fresh.clone(), ResumeFails::registry(), IngestSettings::default())
        .ingest_file(&path)
        .await;
    assert_eq!(
        store.get_messages("s1").await.unwrap(),
        fresh.get_messages("s1").await.unwrap()
    );

    let cp = store.get_checkpoint(&path_key(&path)).await.unwrap().unwrap();
    assert_eq!(cp.last_processed_offset, fs::metadata(&path).unwrap().len());
    assert_eq!(cp.last_processed_line, 6);
}

struct Broken(ParserMetadata);

impl ConversationParser for Broken {
    fn metadata(&self) -> &ParserMetadata {
        &self.0
    }
    fn can_parse(&self, _probe: &FileProbe) -> bool {
        true
    }
    fn parse(&self, _path: &Path, _opts: &ParseOptions) -> Result<ParsedConversation, ParseError> {
        Err(ParseError::malformed(1, "unexpected record layout"))
    }
}

#[tokio::test]
async fn parse_failure_does_not_advance_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    write_lines(&path, &records("s1", 0..2));

    let mut registry = ParserRegistry::new();
    registry.register(Arc::new(Broken(ParserMetadata {
        name: "broken".into(),
        version: "0.1.0".into(),
        extensions: vec!["jsonl".into()],
        capabilities: vec![Capability::Batch],
        priority: 0,
        source: ParserSource::Local,
    })));
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(store.clone(), registry, IngestSettings::default());

    for _ in 0..2 {
        let outcome = ingestor.ingest_file(&path).await;
        assert_eq!(outcome.status, IngestionStatus::Failed);
        assert_eq!(outcome.change, Some(ChangeKind::Full));
        assert!(outcome.reason.contains("parse failed (broken)"));
    }
    assert!(store.get_checkpoint(&path_key(&path)).await.unwrap().is_none());
    assert_eq!(store.conversation_count(), 0);

    let ledger = store.recent_outcomes(10).await.unwrap();
    assert_eq!(ledger.len(), 2);
    assert!(ledger.iter().all(|o| o.status == IngestionStatus::Failed));
}

#[tokio::test]
async fn emptied_rewrite_keeps_previous_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    write_lines(&path, &records("s1", 0..2));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());
    ingestor.ingest_file(&path).await;
    let before = store.get_checkpoint(&path_key(&path)).await.unwrap().unwrap();

    let empty = r#"{"type":"user","sessionId":"s1","message":{"role":"user","content":""}}"#;
    write_lines(&path, &vec![empty.to_string(); 6]);
    let outcome = ingestor.ingest_file(&path).await;
    assert_eq!(outcome.status, IngestionStatus::Skipped);
    assert_eq!(outcome.change, Some(ChangeKind::Rewrite));

    let after = store.get_checkpoint(&path_key(&path)).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(store.get_messages("s1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn incomplete_trailing_record_is_held_back() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    let lines = records("s1", 0..10);
    write_lines(&path, &lines);
    let complete_len = fs::metadata(&path).unwrap().len();
    let tail = user("s1", 10, "still being written");
    let (head, rest) = tail.split_at(tail.len() / 2);
    append_raw(&path, head);

    let delta = ClaudeCodeParser::new()
        .parse_incremental(&path, 0, 0, &ParseOptions::default())
        .unwrap();
    assert_eq!(delta.new_messages.len(), 10);
    assert_eq!(delta.new_offset, complete_len);
    assert_eq!(delta.new_line, 10);
    assert_eq!(delta.file_size, fs::metadata(&path).unwrap().len());

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());
    let first = ingestor.ingest_file(&path).await;
    assert_eq!(first.messages_added, 10);
    let cp = store.get_checkpoint(&path_key(&path)).await.unwrap().unwrap();
    assert_eq!(cp.last_processed_offset, complete_len);

    append_raw(&path, &format!("{}\n", rest));
    let second = ingestor.ingest_file(&path).await;
    assert_eq!(second.change, Some(ChangeKind::Append));
    assert_eq!(second.messages_added, 1);
    let messages = store.get_messages("s1").await.unwrap();
    assert_eq!(messages.len(), 11);
    assert_eq!(messages[10].content, "still being written");
    assert_eq!(messages[10].seq, 10);
}

#[tokio::test]
async fn metadata_only_and_unsupported_files_are_skipped() {
    let dir = TempDir::new().unwrap();
    let summary = transcript(&dir, "summary.jsonl");
    fs::write(
        &summary,
        "{\"type\":\"summary\",\"summary\":\"Fix build\",\"leafUuid\":\"x\"}\n",
    )
    .unwrap();
    let unknown = transcript(&dir, "unknown.jsonl");
    fs::write(&unknown, "{\"message\":\"hello\"}\n").unwrap();

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());

    let meta = ingestor.ingest_file(&summary).await;
    assert_eq!(meta.status, IngestionStatus::Skipped);
    assert!(meta.reason.starts_with("metadata-only"), "{}", meta.reason);

    let unsupported = ingestor.ingest_file(&unknown).await;
    assert_eq!(unsupported.status, IngestionStatus::Skipped);
    assert!(unsupported.reason.starts_with("unsupported format"));
    assert_eq!(store.conversation_count(), 0);
}

#[tokio::test]
async fn sub_agent_links_to_parent() {
    let dir = TempDir::new().unwrap();
    let parent = transcript(&dir, "parent.jsonl");
    let child = transcript(&dir, "agent-a1.jsonl");
    write_lines(&parent, &records("s1", 0..2));
    fs::write(
        &child,
        concat!(
            r#"{"type":"user","sessionId":"s1","agentId":"a1","isSidechain":true,"message":{"role":"user","content":"search the repo"}}"#,
            "\n",
            r#"{"type":"assistant","sessionId":"s1","agentId":"a1","isSidechain":true,"message":{"role":"assistant","content":[{"type":"text","text":"found it"}]}}"#,
            "\n"
        ),
    )
    .unwrap();

    let store = Arc::new(InMemoryStore::new());
    let report = ingestor(store.clone())
        .ingest_batch(&[parent, child], None)
        .await;
    assert_eq!(report.success, 2);

    let children = store.list_children("s1").await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, "a1");
    assert_eq!(children[0].message_count, 2);
}

#[tokio::test]
async fn batch_id_replays_cached_report() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    write_lines(&path, &records("s1", 0..2));

    let store = Arc::new(InMemoryStore::new());
    let ingestor = ingestor(store.clone());
    let first = ingestor.ingest_batch(&[path.clone()], Some("batch-1")).await;
    assert_eq!(first.batch_id, "batch-1");
    assert_eq!(first.messages_added, 2);
    assert!(!first.replayed);

    append_lines(&path, &records("s1", 2..3));
    let replay = ingestor.ingest_batch(&[path.clone()], Some("batch-1")).await;
    assert!(replay.replayed);
    assert_eq!(replay.outcomes, first.outcomes);
    assert_eq!(store.get_messages("s1").await.unwrap().len(), 2);

    let next = ingestor.ingest_batch(&[path.clone()], Some("batch-2")).await;
    assert!(!next.replayed);
    assert_eq!(next.messages_added, 1);
    assert_eq!(next.outcomes[0].batch_id.as_deref(), Some("batch-2"));
}

#[tokio::test]
async fn batch_failures_are_isolated() {
    let dir = TempDir::new().unwrap();
    let good = transcript(&dir, "good.jsonl");
    let missing = transcript(&dir, "missing.jsonl");
    write_lines(&good, &records("s1", 0..2));

    let store = Arc::new(InMemoryStore::new());
    let report = ingestor(store.clone())
        .ingest_batch(&[missing.clone(), good.clone()], None)
        .await;
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].status, IngestionStatus::Failed);
    assert_eq!(report.outcomes[1].status, IngestionStatus::Success);
    assert_eq!((report.success, report.failed), (1, 1));
    assert_eq!(store.get_messages("s1").await.unwrap().len(), 2);
}

struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl Enricher for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "chars": request.text.len() }))
    }
}

#[tokio::test]
async fn committed_conversations_are_handed_off() {
    let dir = TempDir::new().unwrap();
    let path = transcript(&dir, "s.jsonl");
    write_lines(&path, &records("s1", 0..3));

    let store = Arc::new(InMemoryStore::new());
    let config = Arc::new(parse_config("[db]\npath = \"/tmp/unused.sqlite\"\n").unwrap());
    let enricher = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    let (queue, handle) = spawn_worker(store.clone(), config, enricher.clone());
    let ingestor = ingestor(store.clone()).with_enrichment(queue);

    ingestor.ingest_file(&path).await;
    // Unchanged files are not handed off again.
    ingestor.ingest_file(&path).await;
    drop(ingestor);

    assert_eq!(handle.await.unwrap(), 1);
    assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);
    let stored = store.enrichments();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].conversation_id, "s1");
    assert_eq!(stored[0].canonical_type, "tagging");
}
