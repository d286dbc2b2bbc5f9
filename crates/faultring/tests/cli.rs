//! CLI contract tests for `fring`.
//!
//! Each test points the binary at its own temp region directory, so tests
//! never touch a real ring. Separate `fring` invocations are separate
//! processes, which makes these the cross-process checks for the ring.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

/// `fring` bound to the test's region with capacity 3.
fn fring(dir: &TempDir) -> Command {
    fring_with_capacity(dir, 3)
}

#[allow(deprecated)]
fn fring_with_capacity(dir: &TempDir, capacity: u32) -> Command {
    let mut cmd = Command::cargo_bin("fring").expect("fring binary should be built");
    cmd.env_remove("FAULTRING_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--region-dir")
        .arg(dir.path())
        .args(["--name", "cli", "--capacity", &capacity.to_string()]);
    cmd
}

fn json(dir: &TempDir, args: &[&str]) -> serde_json::Value {
    let output = fring(dir)
        .args(["--format", "json"])
        .args(args)
        .output()
        .expect("fring should execute");
    assert!(
        output.status.success(),
        "fring {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

fn capture(dir: &TempDir, origin: &str, message: &str) {
    fring(dir)
        .args(["capture", message, "--origin", origin])
        .assert()
        .success();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn help_lists_subcommands() {
    let tmp = TempDir::new().unwrap();
    fring(&tmp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("capture"))
        .stdout(predicate::str::contains("history"))
        .stdout(predicate::str::contains("destroy"));
}

#[test]
fn init_creates_then_attaches() {
    let tmp = TempDir::new().unwrap();
    let first = json(&tmp, &["init"]);
    assert_eq!(first["attachment"], "created");
    assert_eq!(first["capacity"], 3);
    assert!(tmp.path().join("cli.ring").is_file());

    let second = json(&tmp, &["init"]);
    assert_eq!(second["attachment"], "attached");
}

#[test]
fn queries_without_region_fail_with_remediation() {
    let tmp = TempDir::new().unwrap();
    for sub in ["last", "history", "clear", "stats"] {
        fring(&tmp)
            .arg(sub)
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("not initialized"))
            .stderr(predicate::str::contains("fring init"));
    }
    // Queries never create the region.
    assert!(!tmp.path().join("cli.ring").exists());
}

#[test]
fn capacity_mismatch_is_reported() {
    let tmp = TempDir::new().unwrap();
    fring(&tmp).arg("init").assert().success();
    fring_with_capacity(&tmp, 5)
        .arg("stats")
        .assert()
        .failure()
        .stderr(predicate::str::contains("layout mismatch"));
}

#[test]
fn invalid_capacity_is_rejected() {
    let tmp = TempDir::new().unwrap();
    fring_with_capacity(&tmp, 0)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("capacity"));
}

#[test]
fn destroy_then_init_starts_empty() {
    let tmp = TempDir::new().unwrap();
    capture(&tmp, "1", "before destroy");

    assert_eq!(json(&tmp, &["destroy"])["removed"], true);
    assert_eq!(json(&tmp, &["destroy"])["removed"], false);

    assert_eq!(json(&tmp, &["init"])["attachment"], "created");
    assert_eq!(json(&tmp, &["stats"])["total_written"], 0);
}

// =============================================================================
// Capture and queries
// =============================================================================

#[test]
fn capacity_three_end_to_end() {
    let tmp = TempDir::new().unwrap();
    capture(&tmp, "1", "msg A");
    capture(&tmp, "2", "msg B");
    capture(&tmp, "1", "msg C");
    capture(&tmp, "3", "msg D");

    let last = json(&tmp, &["last", "--origin", "1"]);
    assert_eq!(last["error_message"], "msg C");
    assert_eq!(last["origin_id"], 1);

    let history = json(&tmp, &["history", "--limit", "10"]);
    let mut messages: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["error_message"].as_str().unwrap())
        .collect();
    messages.sort_unstable();
    assert_eq!(messages, vec!["msg B", "msg C", "msg D"]);

    let stats = json(&tmp, &["stats"]);
    assert_eq!(stats["live"], 3);
    assert_eq!(stats["total_evicted"], 1);
}

#[test]
fn capture_stores_all_fields() {
    let tmp = TempDir::new().unwrap();
    let receipt = json(
        &tmp,
        &[
            "capture",
            "permission denied for table accounts",
            "--status",
            "42501",
            "--query",
            "SELECT * FROM accounts",
            "--severity",
            "fatal",
            "--origin",
            "77",
        ],
    );
    assert_eq!(receipt["slot"], 0);

    let last = json(&tmp, &["last", "--origin", "77"]);
    assert_eq!(last["status_code"], "42501");
    assert_eq!(last["query_text"], "SELECT * FROM accounts");
    assert_eq!(last["severity"], 6);
}

#[test]
fn last_for_unknown_origin_is_null() {
    let tmp = TempDir::new().unwrap();
    capture(&tmp, "1", "only one");
    assert!(json(&tmp, &["last", "--origin", "9"]).is_null());
    fring(&tmp)
        .args(["last", "--origin", "9"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no error recorded for origin 9"));
}

#[test]
fn last_without_origin_is_rejected() {
    let tmp = TempDir::new().unwrap();
    capture(&tmp, "1", "somebody else's error");
    fring(&tmp)
        .arg("last")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("needs --origin"));
}

#[test]
fn last_falls_back_to_configured_origin() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("faultring.toml");
    std::fs::write(&config, "[ring]\norigin_id = 4\n").unwrap();
    capture(&tmp, "4", "from the configured origin");

    fring(&tmp)
        .arg("--config")
        .arg(&config)
        .arg("last")
        .assert()
        .success()
        .stdout(predicate::str::contains("message: from the configured origin"));
}

#[test]
fn history_limit_and_pretty_output() {
    let tmp = TempDir::new().unwrap();
    capture(&tmp, "1", "first");
    capture(&tmp, "1", "second");

    assert_eq!(json(&tmp, &["history", "-n", "1"]).as_array().unwrap().len(), 1);
    assert_eq!(json(&tmp, &["history", "--limit", "-1"]).as_array().unwrap().len(), 2);

    fring(&tmp)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("origin=1"))
        .stdout(predicate::str::contains("message: first"))
        .stdout(predicate::str::contains("message: second"));
}

#[test]
fn long_fields_are_truncated() {
    let tmp = TempDir::new().unwrap();
    let query = "q".repeat(10_000);
    let message = "m".repeat(2_000);
    fring(&tmp)
        .args(["capture", &message, "--query", &query, "--origin", "5"])
        .assert()
        .success();

    let last = json(&tmp, &["last", "--origin", "5"]);
    assert_eq!(last["query_text"].as_str().unwrap().len(), 8192);
    assert_eq!(last["error_message"].as_str().unwrap().len(), 1024);
}

#[test]
fn clear_empties_ring() {
    let tmp = TempDir::new().unwrap();
    capture(&tmp, "1", "to be cleared");
    fring(&tmp)
        .arg("clear")
        .assert()
        .success()
        .stdout(predicate::str::contains("ring cleared"));
    assert!(json(&tmp, &["last", "--origin", "1"]).is_null());
    assert!(json(&tmp, &["history"]).as_array().unwrap().is_empty());
}

// =============================================================================
// Cross-process concurrency
// =============================================================================

#[test]
#[allow(deprecated)]
fn parallel_processes_each_land_one_record() {
    let tmp = TempDir::new().unwrap();
    let writers: u32 = 12;
    let capacity = writers.to_string();
    let exe = assert_cmd::cargo::cargo_bin("fring");

    let children: Vec<_> = (1..=writers)
        .map(|origin| {
            std::process::Command::new(&exe)
                .env_remove("FAULTRING_CONFIG")
                .arg("--region-dir")
                .arg(tmp.path())
                .args(["--name", "cli", "--capacity", &capacity])
                .args(["capture", &format!("writer {origin}")])
                .args(["--status", &format!("{origin:05}")])
                .args(["--query", &format!("query from {origin}")])
                .args(["--origin", &origin.to_string()])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
                .expect("spawn fring")
        })
        .collect();
    for mut child in children {
        assert!(child.wait().expect("wait for fring").success());
    }

    let output = fring_with_capacity(&tmp, writers)
        .args(["--format", "json", "history"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let history: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let records = history.as_array().unwrap();
    assert_eq!(records.len(), writers as usize);

    let mut origins: Vec<i64> = records
        .iter()
        .map(|r| {
            let origin = r["origin_id"].as_i64().unwrap();
            assert_eq!(r["error_message"], format!("writer {origin}"));
            assert_eq!(r["status_code"], format!("{origin:05}"));
            assert_eq!(r["query_text"], format!("query from {origin}"));
            origin
        })
        .collect();
    origins.sort_unstable();
    assert_eq!(origins, (1..=i64::from(writers)).collect::<Vec<_>>());
}
