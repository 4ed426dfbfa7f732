use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn mend_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("mend");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::write(
        root.join("good.lua"),
        "local M = {}\n\nfunction M.main()\n  return { total = 1 + 2 }\nend\n\nreturn M\n",
    )
    .unwrap();
    fs::write(
        root.join("broken.lua"),
        "local M = {}\n\nfunction M.main()\n  return missing_helper()\nend\n\nreturn M\n",
    )
    .unwrap();

    // Unreachable fixer so failing runs stop without touching the network.
    let config_content = format!(
        r#"[project]
root = "."

[fixer]
provider = "ollama"
model = "none"
url = "http://127.0.0.1:9"
max_retries = 0
timeout_secs = 2

[repair]
max_rounds = 3
backup_dir = "{}/backups"
"#,
        root.display()
    );
    let config_path = root.join("mend.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_mend(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = mend_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run mend binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_writes_config_once() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("mend.toml");

    let (stdout, _, success) = run_mend(&config_path, &["init"]);
    assert!(success);
    assert!(stdout.contains("Wrote"));
    let written = fs::read_to_string(&config_path).unwrap();
    assert!(written.contains("[repair]"));

    let (_, stderr, success) = run_mend(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("already exists"));
}

#[test]
fn test_index_status_before_build() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_mend(&config_path, &["index", "status"]);
    assert!(success);
    assert!(stdout.contains("not built"));
}

#[test]
fn test_index_build_requires_embeddings() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_mend(&config_path, &["index", "build"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"));
}

#[test]
fn test_apply_edit_file() {
    let (tmp, config_path) = setup_test_env();
    let edits = tmp.path().join("edits.json");
    fs::write(
        &edits,
        r#"{"edits": [
            {"path": "good.lua", "strategy": "replace_range", "startLine": 4, "endLine": 4, "new_text": "  return { total = 40 + 2 }"},
            {"path": "notes/new.txt", "strategy": "replace_file", "new_content": "hello"}
        ]}"#,
    )
    .unwrap();

    let (stdout, _, success) = run_mend(&config_path, &["apply", edits.to_str().unwrap()]);
    assert!(success, "stdout: {}", stdout);
    assert!(stdout.contains("2/2 edits applied"));
    assert!(fs::read_to_string(tmp.path().join("good.lua"))
        .unwrap()
        .contains("40 + 2"));
    assert_eq!(
        fs::read_to_string(tmp.path().join("notes/new.txt")).unwrap(),
        "hello"
    );
    // The existing file was backed up before the range edit.
    assert_eq!(fs::read_dir(tmp.path().join("backups")).unwrap().count(), 1);
}

#[test]
fn test_apply_reports_rejected_edit() {
    let (tmp, config_path) = setup_test_env();
    let edits = tmp.path().join("edits.json");
    fs::write(
        &edits,
        r#"[{"path": "good.lua", "strategy": "patch"}, {"path": "other.txt", "strategy": "replace_file", "new_content": "x"}]"#,
    )
    .unwrap();

    let (stdout, _, success) = run_mend(&config_path, &["apply", edits.to_str().unwrap()]);
    assert!(!success);
    assert!(stdout.contains("unknown strategy: patch"));
    assert!(stdout.contains("1/2 edits applied"));
    assert!(tmp.path().join("other.txt").exists());
}

#[test]
fn test_repair_passing_module() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("good.lua");
    let (stdout, _, success) =
        run_mend(&config_path, &["repair", file.to_str().unwrap(), "--json"]);
    assert!(success, "stdout: {}", stdout);

    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["ok"], true);
    assert_eq!(result["rounds"], 1);
    assert_eq!(result["entry"], "main");
    assert_eq!(result["out"]["total"], 3);
    assert_eq!(result["stop_reason"], "succeeded");
}

#[test]
fn test_repair_with_unreachable_fixer_stops_early() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("broken.lua");
    let (stdout, _, success) =
        run_mend(&config_path, &["repair", file.to_str().unwrap(), "--json"]);
    assert!(!success);

    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["ok"], false);
    assert_eq!(result["rounds"], 1);
    assert_eq!(result["stop_reason"], "no_progress");
    assert_eq!(result["history"][0]["error"]["kind"], "runtime");
    assert_eq!(result["history"][0]["warnings"][0]["kind"], "proposal");
    assert!(result["error"]
        .as_str()
        .unwrap()
        .contains("missing_helper"));
}

#[test]
fn test_repair_zero_rounds() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("good.lua");
    let (stdout, _, success) = run_mend(
        &config_path,
        &["repair", file.to_str().unwrap(), "--rounds", "0"],
    );
    assert!(!success);
    assert!(stdout.contains("failed after 0 round(s)"));
    assert!(stdout.contains("no rounds attempted"));
}
