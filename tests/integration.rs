use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn th_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_th"))
}

const SESSION: &str = concat!(
    r#"{"type":"user","sessionId":"sess-1","timestamp":"2025-03-01T10:00:00Z","message":{"role":"user","content":"the build is failing"}}"#,
    "\n",
    r#"{"type":"assistant","sessionId":"sess-1","timestamp":"2025-03-01T10:00:05Z","message":{"role":"assistant","model":"claude-sonnet","content":[{"type":"text","text":"Let me run the tests."},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"cargo test"}}]}}"#,
    "\n",
    r#"{"type":"user","sessionId":"sess-1","timestamp":"2025-03-01T10:00:20Z","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"error[E0425]: cannot find value","is_error":true}]}}"#,
    "\n",
    r#"{"type":"assistant","sessionId":"sess-1","timestamp":"2025-03-01T10:01:00Z","message":{"role":"assistant","content":[{"type":"text","text":"Fixed the missing import."}]}}"#,
    "\n",
);

const ROLLOUT: &str = concat!(
    r#"{"timestamp":"2025-03-02T09:00:00Z","type":"session_meta","payload":{"id":"rollout-1","cwd":"/work"}}"#,
    "\n",
    r#"{"timestamp":"2025-03-02T09:00:01Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"add a readme"}]}}"#,
    "\n",
    r#"{"timestamp":"2025-03-02T09:00:09Z","type":"response_item","payload":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"Added README.md"}]}}"#,
    "\n",
);

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    let transcripts = root.join("transcripts");
    fs::create_dir_all(transcripts.join("project-a")).unwrap();
    fs::create_dir_all(transcripts.join(".git")).unwrap();

    fs::write(transcripts.join("project-a/sess-1.jsonl"), SESSION).unwrap();
    fs::write(transcripts.join("rollout.jsonl"), ROLLOUT).unwrap();
    fs::write(
        transcripts.join("summary.jsonl"),
        "{\"type\":\"summary\",\"summary\":\"Build fix\",\"leafUuid\":\"x\"}\n",
    )
    .unwrap();
    fs::write(transcripts.join(".git/ignored.jsonl"), SESSION).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/th.sqlite"

[ingest]
workers = 2

[budgets]
tagging = 8000
insights = 12000

[sources.local]
root = "{root}/transcripts"
"#,
        root = root.display()
    );
    let config_path = root.join("config/th.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_th(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = th_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run th binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_th(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));
    assert!(tmp.path().join("data/th.sqlite").exists());

    let (_, stderr, ok) = run_th(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_ingest_scans_sources() {
    let (_tmp, config) = setup_test_env();
    run_th(&config, &["init"]);

    let (stdout, stderr, ok) = run_th(&config, &["ingest", "--progress", "off"]);
    assert!(ok, "ingest failed: {}", stderr);
    assert!(
        stdout.contains("2 success, 0 duplicate, 1 skipped, 0 failed"),
        "unexpected summary: {}",
        stdout
    );
    assert!(!stdout.contains(".git"));

    let (stdout, _, ok) = run_th(&config, &["ingest", "--progress", "off"]);
    assert!(ok);
    assert!(
        stdout.contains("0 success, 0 duplicate, 3 skipped, 0 failed, 0 messages added"),
        "second scan should be unchanged: {}",
        stdout
    );
}

#[test]
fn test_ingest_json_report_and_replay() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("transcripts/project-a/sess-1.jsonl");
    let file = file.to_str().unwrap();

    let (stdout, stderr, ok) = run_th(
        &config,
        &["ingest", file, "--batch-id", "b-1", "--json", "--progress", "off"],
    );
    assert!(ok, "ingest failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["batch_id"], "b-1");
    assert_eq!(report["success"], 1);
    assert_eq!(report["outcomes"][0]["parser"], "claude-code");
    assert_eq!(report["outcomes"][0]["conversation_id"], "sess-1");
    assert_eq!(report["replayed"], false);
}

#[test]
fn test_artifact_renders_conversation() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("transcripts/project-a/sess-1.jsonl");
    run_th(
        &config,
        &["ingest", file.to_str().unwrap(), "--progress", "off"],
    );

    let (stdout, stderr, ok) = run_th(&config, &["artifact", "sess-1", "--type", "tagging"]);
    assert!(ok, "artifact failed: {}", stderr);
    assert!(stdout.contains("sess-1"));
    assert!(stdout.contains("the build is failing"));
    assert!(stdout.contains("Fixed the missing import."));

    let (stdout, _, ok) = run_th(&config, &["artifact", "sess-1", "--json"]);
    assert!(ok);
    let artifact: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(artifact["canonical_type"], "tagging");
    assert!(artifact["token_count"].as_u64().unwrap() <= 8000);

    let (_, _, ok) = run_th(&config, &["artifact", "sess-1", "--type", "haiku"]);
    assert!(!ok, "unknown canonical type should fail");
}

#[test]
fn test_outcomes_and_stats() {
    let (_tmp, config) = setup_test_env();
    run_th(&config, &["ingest", "--progress", "off"]);

    let (stdout, stderr, ok) = run_th(&config, &["outcomes", "--limit", "10"]);
    assert!(ok, "outcomes failed: {}", stderr);
    assert!(stdout.contains("STATUS"));
    assert!(stdout.contains("metadata-only"));
    assert!(stdout.contains("claude-code"));

    let (stdout, stderr, ok) = run_th(&config, &["stats"]);
    assert!(ok, "stats failed: {}", stderr);
    assert!(stdout.contains("Conversations:  2"));
    assert!(stdout.contains("codex"));
}

#[test]
fn test_parsers_lists_builtins_in_order() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, ok) = run_th(&config, &["parsers"]);
    assert!(ok);
    let claude = stdout.find("claude-code").unwrap();
    let codex = stdout.find("codex").unwrap();
    let generic = stdout.find("generic-chat").unwrap();
    assert!(claude < generic && codex < generic);
}

#[test]
fn test_missing_config_fails() {
    let (stdout, _, ok) = run_th(Path::new("/nonexistent/th.toml"), &["stats"]);
    assert!(!ok);
    assert!(stdout.is_empty());
}
