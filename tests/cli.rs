//! End-to-end tests that drive the `ingest` binary against a temp config.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ingest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ingest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        format!(
            "# Alpha Document\n\n{}",
            "This is the alpha document about Rust programming. ".repeat(30)
        ),
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file. Contains notes about deployment and infrastructure. ".repeat(20),
    )
    .unwrap();

    let config_path = root.join("ingest.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[indexing]
chunk_size = 500
chunk_overlap = 50

[cache]
backend = "sqlite"
path = "{}"

[sources.docs]
type = "file"
path = "{}"

[sources.gone]
type = "file"
path = "{}"
"#,
            root.join("data").join("hashes.sqlite").display(),
            files_dir.display(),
            root.join("missing").display()
        ),
    )
    .unwrap();

    (tmp, config_path)
}

fn run(config: &Path, args: &[&str]) -> std::process::Output {
    Command::new(ingest_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run ingest binary")
}

#[test]
fn test_strategies_lists_builtins() {
    let (_tmp, config) = setup_test_env();
    let output = run(&config, &["strategies"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sliding-window (default)"));
    assert!(stdout.contains("sentence-based"));
}

#[test]
fn test_sources_reports_health() {
    let (_tmp, config) = setup_test_env();
    let output = run(&config, &["sources"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let docs = stdout.lines().find(|l| l.starts_with("docs")).unwrap();
    assert!(docs.contains("true"));
    let gone = stdout.lines().find(|l| l.starts_with("gone")).unwrap();
    assert!(gone.contains("false"));
}

#[test]
fn test_sync_prints_result_json() {
    let (_tmp, config) = setup_test_env();
    let output = run(&config, &["sync", "docs", "--full"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["documents_processed"], 2);
}

#[test]
fn test_sync_unknown_source_fails() {
    let (_tmp, config) = setup_test_env();
    let output = run(&config, &["sync", "nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown source"));
}

#[test]
fn test_index_is_idempotent_with_persistent_cache() {
    let (_tmp, config) = setup_test_env();

    let first = run(&config, &["index", "docs", "--full"]);
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    let stdout = String::from_utf8_lossy(&first.stdout);
    assert!(stdout.contains("indexed: 2"));
    assert!(stdout.contains("failed: 0"));
    assert!(!stdout.contains("chunks created: 0"));

    let second = run(&config, &["index", "docs", "--full"]);
    assert!(second.status.success());
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(stdout.contains("indexed: 2"));
    assert!(stdout.contains("chunks created: 0"));
}

#[test]
fn test_index_rejects_unknown_strategy() {
    let (_tmp, config) = setup_test_env();
    let output = run(&config, &["index", "docs", "--strategy", "paragraphs"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown chunking strategy"));
}
