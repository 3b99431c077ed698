// Reproducibility tests.
//
// These tests verify that the specializer produces byte-identical outputs
// for identical inputs, both through the library and through the binary.

mod common;

use std::process::Command;

use common::*;
use dfspec::pipeline::{compute_provenance, fingerprint};

fn run_dfspec(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_dfspec"))
        .args(args)
        .output()
        .expect("failed to run dfspec");
    assert!(
        output.status.success(),
        "dfspec failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

/// Specializing the same bundle twice gives the same program.
#[test]
fn same_bundle_identical_program() {
    for name in ["pair", "scale", "taps", "modal", "ramp", "tracker"] {
        let bundle = demo(name);
        let first = specialized(&bundle);
        let second = specialized(&bundle);
        assert_eq!(
            program(&first).to_string(),
            program(&second).to_string(),
            "{name}: printed program differs across runs"
        );
        assert_eq!(fingerprint(program(&first)), fingerprint(program(&second)));
    }
}

/// The input hash depends on the bundle only, not on the options.
#[test]
fn input_hash_ignores_options() {
    let bundle = demo("pair");
    let default = specialized(&bundle);
    let state = run_to(
        &bundle,
        dfspec::pass::PassId::Sweep,
        &dfspec::pipeline::SpecializeOptions {
            threshold: 5,
            ..Default::default()
        },
    );
    let a = compute_provenance(&bundle, program(&default)).unwrap();
    let b = compute_provenance(&bundle, program(&state)).unwrap();
    assert_eq!(a.input_hash_hex(), b.input_hash_hex());
    assert_ne!(a.fingerprint_hex(), b.fingerprint_hex());
}

/// `--emit ir` produces byte-identical output across runs.
#[test]
fn emitted_ir_is_stable() {
    let path = demo_path("scale");
    let path = path.to_str().unwrap();
    let first = run_dfspec(&["--emit", "ir", path]);
    let second = run_dfspec(&["--emit", "ir", path]);
    assert_eq!(first, second, "IR output should be byte-identical across runs");
    assert!(first.contains("class CG_top_s"));
}

/// `--emit fingerprint` matches the library's fingerprint of the same run.
#[test]
fn emitted_fingerprint_matches_library() {
    let path = demo_path("ramp");
    let info = run_dfspec(&["--emit", "fingerprint", path.to_str().unwrap()]);
    let json: serde_json::Value = serde_json::from_str(&info).unwrap();
    let state = specialized(&demo("ramp"));
    assert_eq!(json["fingerprint"], fingerprint(program(&state)).as_str());
    assert_eq!(json["input_hash"].as_str().unwrap().len(), 64);
}
