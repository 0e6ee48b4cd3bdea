use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn tflow_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tflow");
    path
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/tflow.sqlite"

[detection]
threshold = 0.80
top_k = 5

[server]
bind = "127.0.0.1:7340"
{}
"#,
        root.display(),
        extra
    );

    let config_path = config_dir.join("tflow.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_tflow(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = tflow_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tflow binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_tflow(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/tflow.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, _, success1) = run_tflow(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_tflow(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_detect_degrades_when_embeddings_disabled() {
    let (_tmp, config_path) = setup_test_env("");
    run_tflow(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_tflow(&config_path, &["detect", "checkout page is blank"]);
    assert!(success, "detect failed: stderr={}", stderr);
    assert!(stdout.contains("unavailable"));
    assert!(!stdout.contains("No similar tickets found"));
}

#[test]
fn test_sync_without_projects_fails() {
    let (_tmp, config_path) = setup_test_env("");
    run_tflow(&config_path, &["init"]);

    let (_, stderr, success) = run_tflow(&config_path, &["sync"]);
    assert!(!success);
    assert!(stderr.contains("No projects to sync"));
}

#[test]
fn test_backfill_fails_when_tracker_disabled() {
    let (_tmp, config_path) = setup_test_env("");
    run_tflow(&config_path, &["init"]);

    let (_, _, success) = run_tflow(&config_path, &["backfill", "OPS"]);
    assert!(!success);
}

#[test]
fn test_sweep_on_empty_database() {
    let (_tmp, config_path) = setup_test_env("");
    run_tflow(&config_path, &["init"]);

    let (stdout, stderr, success) = run_tflow(&config_path, &["sweep"]);
    assert!(success, "sweep failed: stderr={}", stderr);
    assert!(stdout.contains("evicted 0"));
}

#[test]
fn test_invalid_threshold_rejected() {
    let (_tmp, config_path) = setup_test_env("");
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("threshold = 0.80", "threshold = 1.5");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_tflow(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("detection.threshold"));
}

#[test]
fn test_unknown_embedding_provider_rejected() {
    let (_tmp, config_path) = setup_test_env("\n[embedding]\nprovider = \"word2vec\"\n");

    let (_, _, success) = run_tflow(&config_path, &["init"]);
    assert!(!success);
}
