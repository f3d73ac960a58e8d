#![allow(deprecated)]
use assert_cmd::Command;
use chrono::{TimeZone, Utc};
use predicates::prelude::*;
use relay_core::attributes::Attributes;
use relay_core::context::Context;
use relay_core::event::{Event, EventInfo};
use relay_core::queue::EventLog;
use relay_core::storage::RedbStore;
use std::sync::Arc;
use tempfile::TempDir;

fn relay(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("relay").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("RELAY_CONFIG")
        .env_remove("RELAY_DB")
        .env_remove("RUST_LOG");
    cmd
}

/// Appends one event per name to `relay.db` inside `dir`.
fn seed(dir: &TempDir, names: &[&str]) {
    let store = RedbStore::open(&dir.path().join("relay.db")).unwrap();
    let mut log = EventLog::new(Arc::new(store));
    for (i, name) in names.iter().enumerate() {
        let info = EventInfo::new(
            *name,
            "app",
            Attributes::new().with("index", i as i64),
        )
        .at(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, i as u32).unwrap());
        log.append(&Event::from_info(&info, Context::new())).unwrap();
    }
}

// ---------------------------------------------------------------------------
// relay queue count / list
// ---------------------------------------------------------------------------

#[test]
fn count_on_fresh_database_is_zero() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["queue", "count"])
        .assert()
        .success()
        .stdout("0\n");
}

#[test]
fn count_reports_seeded_events() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &["Opened", "Viewed", "Closed"]);

    let output = relay(&dir)
        .args(["queue", "count", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["count"], 3);
}

#[test]
fn list_prints_events_in_order() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &["Opened", "Viewed"]);

    let output = relay(&dir).args(["queue", "list"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("SEQ"));
    assert!(stdout.contains("2026-01-02T03:04:00Z"));
    let opened = stdout.find("Opened").unwrap();
    let viewed = stdout.find("Viewed").unwrap();
    assert!(opened < viewed, "events should be listed in append order");
}

#[test]
fn list_on_empty_database_says_so() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending events."));
}

#[test]
fn list_json_includes_sequence_numbers() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &["Opened", "Viewed"]);

    let output = relay(&dir)
        .args(["queue", "list", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = value.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["seq"], 0);
    assert_eq!(rows[0]["name"], "Opened");
    assert_eq!(rows[0]["namespace"], "app");
    assert_eq!(rows[1]["seq"], 1);
    assert_eq!(rows[1]["name"], "Viewed");
    assert_eq!(rows[1]["attributes"]["index"], 1);
}

#[test]
fn db_flag_overrides_config_path() {
    let dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    seed(&other, &["Elsewhere"]);

    relay(&dir)
        .args(["queue", "count", "--db"])
        .arg(other.path().join("relay.db"))
        .assert()
        .success()
        .stdout("1\n");
}

// ---------------------------------------------------------------------------
// relay queue clear / drain
// ---------------------------------------------------------------------------

#[test]
fn clear_discards_every_event() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &["Opened", "Viewed"]);

    relay(&dir)
        .args(["queue", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared 2 event(s)."));

    relay(&dir)
        .args(["queue", "count"])
        .assert()
        .success()
        .stdout("0\n");
}

#[test]
fn drain_writes_json_lines_and_empties_queue() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &["Opened", "Viewed", "Closed"]);

    let output = relay(&dir)
        .args(["queue", "drain", "--out", "out.jsonl", "--batch-size", "2", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["restored"], 3);
    assert_eq!(summary["delivered"], 3);
    assert_eq!(summary["discarded"], 0);
    assert_eq!(summary["remaining"], 0);

    let written = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
    let names: Vec<String> = written
        .lines()
        .map(|line| {
            let event: serde_json::Value = serde_json::from_str(line).unwrap();
            event["name"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(names, ["Opened", "Viewed", "Closed"]);

    relay(&dir)
        .args(["queue", "count"])
        .assert()
        .success()
        .stdout("0\n");
}

#[test]
fn drain_appends_to_existing_output() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("out.jsonl"), "{\"name\":\"earlier\"}\n").unwrap();
    seed(&dir, &["Opened"]);

    relay(&dir)
        .args(["queue", "drain", "--out", "out.jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Drained 1 event(s)"));

    let written = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 2);
    assert!(written.starts_with("{\"name\":\"earlier\"}"));
}

#[test]
fn drain_rejects_zero_batch_size() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["queue", "drain", "--out", "out.jsonl", "--batch-size", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--batch-size must be at least 1"));
}

// ---------------------------------------------------------------------------
// relay config show / validate
// ---------------------------------------------------------------------------

#[test]
fn config_show_json_prints_defaults() {
    let dir = TempDir::new().unwrap();
    let output = relay(&dir)
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["queue"]["flush_at"], 20);
    assert_eq!(value["queue"]["max_batch_size"], 100);
    assert_eq!(value["storage"]["path"], "relay.db");
}

#[test]
fn config_show_reads_file_values() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("relay.yaml"), "queue:\n  flush_at: 5\n").unwrap();

    relay(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("flush_at: 5"));
}

#[test]
fn config_validate_accepts_clean_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("relay.yaml"), "queue:\n  flush_at: 10\n").unwrap();

    relay(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid. No warnings."));
}

#[test]
fn config_validate_fails_on_errors() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("relay.yaml"),
        "dispatcher:\n  max_concurrency: 0\n",
    )
    .unwrap();

    relay(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains(
            "[error] dispatcher.max_concurrency must be at least 1",
        ))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_validate_requires_file() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn config_env_var_selects_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("alt.yaml"), "queue:\n  flush_at: 7\n").unwrap();

    let output = relay(&dir)
        .env("RELAY_CONFIG", "alt.yaml")
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["queue"]["flush_at"], 7);
}
