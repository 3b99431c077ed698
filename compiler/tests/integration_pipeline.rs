// Integration tests for the command-line tool and pass selection.
//
// These tests verify:
// - `--emit unspecialized` runs the scaffold pass only
// - `--emit summary` reports every pass
// - `--verbose` routes the passes' debug events to stderr
// - `--keep-dead-code` leaves unreachable methods in place
// - unreadable or malformed bundles fail with exit code 2

mod common;

use std::process::{Command, Output};

use common::*;

fn dfspec(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dfspec"))
        .args(args)
        .output()
        .expect("failed to run dfspec")
}

fn stdout_of(args: &[&str]) -> String {
    let output = dfspec(args);
    assert!(
        output.status.success(),
        "dfspec {:?} failed.\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn emit_unspecialized_runs_scaffold_only() {
    let path = demo_path("scale");
    let output = dfspec(&["--emit", "unspecialized", "--verbose", path.to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("virtualinvoke g.getToken()"), "{stdout}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dfspec: scaffold complete"), "{stderr}");
    assert!(!stderr.contains("dfspec: resolve complete"), "{stderr}");
}

#[test]
fn verbose_shows_pass_events() {
    let path = demo_path("scale");
    let output = Command::new(env!("CARGO_BIN_EXE_dfspec"))
        .args(["--emit", "summary", "--verbose", path.to_str().unwrap()])
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run dfspec");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("pass complete"), "{stderr}");
    assert!(stderr.contains("lifecycle synthesized"), "{stderr}");

    let quiet = Command::new(env!("CARGO_BIN_EXE_dfspec"))
        .args(["--emit", "summary", path.to_str().unwrap()])
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run dfspec");
    assert!(!String::from_utf8_lossy(&quiet.stderr).contains("pass complete"));
}

#[test]
fn emit_summary_reports_counts() {
    let path = demo_path("scale");
    let stdout = stdout_of(&["--emit", "summary", path.to_str().unwrap()]);
    assert!(stdout.contains("values resolved:      1"), "{stdout}");
    assert!(stdout.contains("composites inlined:   1"), "{stdout}");
    assert!(stdout.contains("removed:"), "{stdout}");
}

#[test]
fn keep_dead_code_skips_the_sweep() {
    let path = demo_path("taps");
    let path = path.to_str().unwrap();
    let swept = stdout_of(&["--emit", "ir", path]);
    let kept = stdout_of(&["--emit", "ir", "--keep-dead-code", path]);
    assert!(kept.len() > swept.len());
    assert!(kept.contains("class Taps"));
    assert!(!swept.contains("class Taps"));
}

#[test]
fn missing_bundle_exits_with_2() {
    let output = dfspec(&["/nonexistent/bundle.json"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn malformed_bundle_exits_with_2() {
    let path = std::env::temp_dir().join("dfspec_malformed_bundle.json");
    std::fs::write(&path, "{\"graph\": []}").unwrap();
    let output = dfspec(&[path.to_str().unwrap()]);
    let _ = std::fs::remove_file(&path);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("parse error"));
}
