// Snapshot tests: lock the synthesized lifecycle methods to detect
// unintended changes in the schedule inliner's output.
//
// Uses the library API (bundle → scaffold → resolve → inline_schedule) and
// snapshots the Display output of single methods. Snapshots are managed by
// `insta` and stored under `compiler/tests/snapshots/`.
//
// Run `cargo insta review` after intentional output changes to update baselines.

mod common;

use common::*;
use dfspec::pass::PassId;
use dfspec::pipeline::SpecializeOptions;

fn lifecycle(bundle: &str, name: &str) -> String {
    let state = run_to(&demo(bundle), PassId::InlineSchedule, &SpecializeOptions::default());
    method(&state, "CG_top", name).to_string()
}

#[test]
fn snapshot_dataflow_prefire() {
    insta::assert_snapshot!("dataflow_prefire", lifecycle("pair", "prefire"));
}

#[test]
fn snapshot_dataflow_postfire() {
    insta::assert_snapshot!("dataflow_postfire", lifecycle("pair", "postfire"));
}

#[test]
fn snapshot_modal_postfire() {
    insta::assert_snapshot!("modal_postfire", lifecycle("modal", "postfire"));
}
