use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn chan_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("chan");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let posts = [
        r#"{"channel":"@markettwits","message_id":101,"ts":"2024-05-01T09:00:00Z","text":"Банк России сохранил ключевую ставку на уровне 16%","views":1500}"#,
        r##"{"channel":"@markettwits","message_id":102,"ts":"2024-05-02T09:00:00Z","text":"#нефть Brent выше $90","views":900}"##,
        r#"{"channel":"rbc_news","message_id":7,"ts":"2024-05-03T09:00:00Z","text":"Прямой эфир"}"#,
        "not a json line",
    ];
    fs::write(root.join("posts.jsonl"), posts.join("\n")).unwrap();

    // Nothing listens on port 1, so both backends fail fast.
    let config_content = format!(
        r#"[db]
path = "{}/data/chan.sqlite"

[backend]
primary = "job"
fallback = true
timeout_secs = 2
http_timeout_secs = 2
job_url = "http://127.0.0.1:1"
direct_url = "http://127.0.0.1:1"

[tagging]
max_attempts = 2

[retrieval]
default_limit = 10
"#,
        root.display()
    );

    let config_path = config_dir.join("chan.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_chan(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = chan_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("TAG_ALIASES_JSON")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run chan binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn ingest(tmp: &TempDir, config_path: &Path) -> String {
    let posts = tmp.path().join("posts.jsonl");
    let (stdout, stderr, success) = run_chan(config_path, &["ingest", posts.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_chan(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_chan(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_chan(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_and_reingest() {
    let (tmp, config_path) = setup_test_env();
    run_chan(&config_path, &["init"]);

    let stdout = ingest(&tmp, &config_path);
    assert!(stdout.contains("inserted: 3"), "got: {}", stdout);
    assert!(stdout.contains("skipped lines: 1"), "got: {}", stdout);
    assert!(stdout.contains("channels touched: 2"), "got: {}", stdout);

    let stdout = ingest(&tmp, &config_path);
    assert!(stdout.contains("inserted: 0"), "got: {}", stdout);
    assert!(stdout.contains("unchanged: 3"), "got: {}", stdout);
}

#[test]
fn test_fetch_by_channel() {
    let (tmp, config_path) = setup_test_env();
    run_chan(&config_path, &["init"]);
    ingest(&tmp, &config_path);

    let (stdout, _, success) = run_chan(&config_path, &["fetch", "--channel", "markettwits"]);
    assert!(success);
    let newest = stdout.find("#102").expect("message 102 listed");
    let older = stdout.find("#101").expect("message 101 listed");
    assert!(newest < older, "expected newest first, got: {}", stdout);
    assert!(!stdout.contains("rbc_news"));

    let (stdout, _, success) = run_chan(&config_path, &["fetch", "--json", "--limit", "1"]);
    assert!(success);
    let hits: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 1);
    assert_eq!(hits[0]["channel"], "rbc_news");
}

#[test]
fn test_fetch_rejects_bad_date() {
    let (_tmp, config_path) = setup_test_env();
    run_chan(&config_path, &["init"]);

    let (_, stderr, success) = run_chan(&config_path, &["fetch", "--since", "01.05.2024"]);
    assert!(!success);
    assert!(stderr.contains("YYYY-MM-DD"), "got: {}", stderr);
}

#[test]
fn test_tag_pending_with_unreachable_backend_counts_failures() {
    let (tmp, config_path) = setup_test_env();
    run_chan(&config_path, &["init"]);
    ingest(&tmp, &config_path);

    let (stdout, stderr, success) = run_chan(&config_path, &["tag", "pending"]);
    assert!(success, "tag pending failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("selected: 3"), "got: {}", stdout);
    assert!(stdout.contains("skipped (no backend call): 1"), "got: {}", stdout);
    assert!(stdout.contains("failed: 2"), "got: {}", stdout);

    // Second failure reaches the ceiling of 2.
    let (stdout, _, _) = run_chan(&config_path, &["tag", "pending"]);
    assert!(stdout.contains("poisoned: 2"), "got: {}", stdout);

    let (stdout, _, _) = run_chan(&config_path, &["tag", "pending"]);
    assert!(stdout.contains("selected: 0"), "got: {}", stdout);

    let (stdout, _, success) = run_chan(&config_path, &["reset", "tag", "--all-poisoned"]);
    assert!(success);
    assert!(stdout.contains("messages reset: 2"), "got: {}", stdout);
}

#[test]
fn test_search_with_unreachable_backend_is_empty() {
    let (tmp, config_path) = setup_test_env();
    run_chan(&config_path, &["init"]);
    ingest(&tmp, &config_path);

    let (stdout, _, success) = run_chan(&config_path, &["search", "ставка"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_stats_output() {
    let (tmp, config_path) = setup_test_env();
    run_chan(&config_path, &["init"]);
    ingest(&tmp, &config_path);

    let (stdout, _, success) = run_chan(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Messages:    3"), "got: {}", stdout);
    assert!(stdout.contains("markettwits"));

    let (stdout, _, success) = run_chan(&config_path, &["stats", "--json"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["channels"], 2);
    assert_eq!(stats["tagging"]["pending"], 3);
}

#[test]
fn test_aliases_add_and_list() {
    let (_tmp, config_path) = setup_test_env();
    run_chan(&config_path, &["init"]);

    let (stdout, _, success) = run_chan(&config_path, &["aliases", "add", "мосбиржа", "Мосбиржа"]);
    assert!(success, "got: {}", stdout);

    let (stdout, _, success) = run_chan(&config_path, &["aliases", "list"]);
    assert!(success);
    assert!(stdout.contains("мосбиржа"));
    assert!(stdout.contains("банк россии"));

    let (stdout, _, success) = run_chan(&config_path, &["aliases", "check"]);
    assert!(success, "got: {}", stdout);
    assert!(stdout.contains("conflicts: 0"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_chan(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
