//! Basic CLI E2E tests.
//!
//! Each test runs the built binary against its own temporary data directory.

use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

/// Run a CLI command and return (stdout, stderr, exit code).
fn run_cli(data_dir: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_nudgeflow"))
        .env("NUDGEFLOW_DATA_DIR", data_dir)
        .env("NUDGEFLOW_LOG", "off")
        .args(args)
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

fn run_json(data_dir: &Path, args: &[&str]) -> serde_json::Value {
    let (stdout, stderr, code) = run_cli(data_dir, args);
    assert_eq!(code, 0, "{args:?} failed: {stderr}");
    serde_json::from_str(&stdout).expect("Failed to parse JSON output")
}

fn write_snapshot(dir: &Path) -> String {
    let path = dir.join("u1.json");
    let snapshot = serde_json::json!({
        "user_id": "u1",
        "taken_at": "2026-03-04T09:00:00Z",
        "local_date": "2026-03-04",
        "energy_level": 3,
        "capacity_utilization": 0.6,
        "season_intensity": 3,
        "tasks": [{"id": "t1", "title": "Quarterly report", "due_date": "2026-02-25"}]
    });
    std::fs::write(&path, snapshot.to_string()).unwrap();
    path.to_string_lossy().to_string()
}

#[test]
fn test_ingest_classifies_events() {
    let dir = TempDir::new().unwrap();

    let queued = run_json(dir.path(), &["signal", "ingest", "u1", "task.overdue", "--payload", r#"{"task_id":"t1"}"#]);
    assert_eq!(queued["outcome"], "queued");
    assert_eq!(queued["signal"]["window_type"], "immediate");

    let unmapped = run_json(dir.path(), &["signal", "ingest", "u1", "weather.changed"]);
    assert_eq!(unmapped["outcome"], "unmapped");

    let pending = run_json(dir.path(), &["signal", "pending", "u1"]);
    assert_eq!(pending.as_array().unwrap().len(), 1);
}

#[test]
fn test_generate_then_accept_executes() {
    let dir = TempDir::new().unwrap();
    let snapshot = write_snapshot(dir.path());

    let report = run_json(dir.path(), &["generate", "--snapshot", &snapshot]);
    let created = report["created"].as_array().unwrap();
    let reschedule = created
        .iter()
        .find(|r| r["target_entity_id"] == "t1")
        .expect("overdue task recommendation");
    let id = reschedule["id"].as_str().unwrap();

    let accepted = run_json(dir.path(), &["rec", "accept", id]);
    assert_eq!(accepted["result"]["success"], true);
    assert_eq!(accepted["result"]["entity_id"], "t1");
    assert_eq!(accepted["issued"].as_array().unwrap().len(), 1);

    let executed = run_json(dir.path(), &["rec", "list", "u1", "--status", "executed"]);
    assert_eq!(executed.as_array().unwrap().len(), 1);

    let (_, stderr, code) = run_cli(dir.path(), &["rec", "dismiss", id]);
    assert_eq!(code, 1);
    assert!(stderr.starts_with("error:"));
}

#[test]
fn test_repeated_generate_does_not_duplicate() {
    let dir = TempDir::new().unwrap();
    let snapshot = write_snapshot(dir.path());

    run_json(dir.path(), &["generate", "--snapshot", &snapshot]);
    let second = run_json(dir.path(), &["generate", "--snapshot", &snapshot]);
    assert!(second["created"].as_array().unwrap().is_empty());

    let active = run_json(dir.path(), &["rec", "list", "u1", "--status", "active"]);
    let on_t1 = active
        .as_array()
        .unwrap()
        .iter()
        .filter(|r| r["target_entity_id"] == "t1")
        .count();
    assert_eq!(on_t1, 1);
}

#[test]
fn test_trace_listing_paginates() {
    let dir = TempDir::new().unwrap();
    let snapshot = write_snapshot(dir.path());
    run_json(dir.path(), &["generate", "--snapshot", &snapshot]);

    let page = run_json(dir.path(), &["trace", "list", "--user", "u1", "--page-size", "1"]);
    assert_eq!(page["page_size"], 1);
    assert_eq!(page["rows"].as_array().unwrap().len(), 1);
    assert!(page["total"].as_u64().unwrap() >= 1);
}

#[test]
fn test_config_roundtrip() {
    let dir = TempDir::new().unwrap();

    let (stdout, _, code) = run_cli(dir.path(), &["config", "get", "lifecycle.max_active_per_context"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "5");

    let (_, _, code) = run_cli(dir.path(), &["config", "set", "lifecycle.max_active_per_context", "2"]);
    assert_eq!(code, 0);
    let (stdout, _, _) = run_cli(dir.path(), &["config", "get", "lifecycle.max_active_per_context"]);
    assert_eq!(stdout.trim(), "2");

    let (_, _, code) = run_cli(dir.path(), &["config", "get", "no.such.key"]);
    assert_eq!(code, 1);
}

#[test]
fn test_config_set_rejects_budget_over_run_timeout() {
    let dir = TempDir::new().unwrap();

    let (_, stderr, code) = run_cli(dir.path(), &["config", "set", "selection.selector_timeout_ms", "60000"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("run_timeout_ms"));

    let selection = run_json(dir.path(), &["config", "show", "selection"]);
    assert_eq!(selection["selector_timeout_ms"], 2000);
}

#[test]
fn test_config_disable_and_enable_rule() {
    let dir = TempDir::new().unwrap();

    let (_, _, code) = run_cli(dir.path(), &["config", "disable", "overdue-task"]);
    assert_eq!(code, 0);
    let rules = run_json(dir.path(), &["config", "rules"]);
    let overdue = rules
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["id"] == "overdue-task")
        .unwrap();
    assert_eq!(overdue["enabled"], false);

    let (_, _, code) = run_cli(dir.path(), &["config", "enable", "overdue-task"]);
    assert_eq!(code, 0);
    let disabled = run_json(dir.path(), &["config", "show", "rules"]);
    assert!(disabled["disabled"].as_array().unwrap().is_empty());

    let (_, _, code) = run_cli(dir.path(), &["config", "disable", "no-such-rule"]);
    assert_eq!(code, 1);
}

#[test]
fn test_classify_show() {
    let dir = TempDir::new().unwrap();
    let shown = run_json(dir.path(), &["classify", "show", "task.overdue"]);
    assert_eq!(shown["kind"], "signal");
    assert_eq!(shown["window"], "immediate");
}
