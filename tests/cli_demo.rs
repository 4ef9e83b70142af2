//! CLI integration tests for the demo and bench modes.

use std::io::Write;
use std::process::Command;

fn summary_value<'a>(stdout: &'a str, key: &str) -> &'a str {
    let prefix = format!("{key}=");
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(prefix.as_str()))
        .unwrap_or_else(|| panic!("{key} line missing from output"))
}

#[test]
fn demo_cli_reports_agreed_allocations() {
    let bin = env!("CARGO_BIN_EXE_fieldnode");
    let output = Command::new(bin)
        .output()
        .expect("failed to run demo binary");

    assert!(
        output.status.success(),
        "demo exited with non-zero status: {:?}",
        output.status
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("DEMO SUMMARY"),
        "demo summary missing from output"
    );

    // Every agent resolves every auction to the same outcome.
    assert_eq!(summary_value(&stdout, "allocation_conflict"), "false");

    let resolved: usize = summary_value(&stdout, "auctions_resolved")
        .parse()
        .expect("auctions_resolved is a number");
    assert!(resolved > 0, "demo resolved no auctions");
}

#[test]
fn bench_reads_config_file_and_prints_csv() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, r#"{{ "agents": 2, "steps": 6, "step_ms": 100 }}"#).expect("write config");

    let bin = env!("CARGO_BIN_EXE_fieldnode");
    let output = Command::new(bin)
        .arg("bench")
        .arg("--config")
        .arg(file.path())
        .output()
        .expect("failed to run bench");
    assert!(output.status.success(), "bench failed: {:?}", output.status);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    let header = lines.next().expect("csv header");
    assert!(header.starts_with("agents,steps,seed"));
    let row = lines.next().expect("csv row");
    let fields: Vec<&str> = row.split(',').collect();
    assert_eq!(fields.len(), header.split(',').count());
    assert_eq!(fields[0], "2");
    assert_eq!(fields[1], "6");
}

#[test]
fn bench_accepts_node_config_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, r#"{{ "auction_timeout_ms": 300, "safety_margin_ms": 20 }}"#)
        .expect("write node config");

    let bin = env!("CARGO_BIN_EXE_fieldnode");
    let output = Command::new(bin)
        .args(["bench", "--agents", "2", "--steps", "4", "--step-ms", "100"])
        .arg("--node-config")
        .arg(file.path())
        .output()
        .expect("failed to run bench");
    assert!(output.status.success(), "bench failed: {:?}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 2, "unexpected output: {stdout}");
}

#[test]
fn invalid_node_config_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, r#"{{ "vision": 0 }}"#).expect("write node config");

    let bin = env!("CARGO_BIN_EXE_fieldnode");
    let output = Command::new(bin)
        .arg("--node-config")
        .arg(file.path())
        .output()
        .expect("failed to run demo binary");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("loading node config"), "unexpected stderr: {stderr}");
}

#[test]
fn missing_config_file_fails_cleanly() {
    let bin = env!("CARGO_BIN_EXE_fieldnode");
    let output = Command::new(bin)
        .args(["demo", "--config", "/nonexistent/fieldnode.json"])
        .output()
        .expect("failed to run demo binary");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("loading config"), "unexpected stderr: {stderr}");
}
