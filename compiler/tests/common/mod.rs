// Shared fixtures for integration tests: demo bundles and pipeline drivers.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use dfspec::exec::{execute, Trace};
use dfspec::expr::Value;
use dfspec::ir::{Method, Program};
use dfspec::pass::PassId;
use dfspec::pipeline::{run_pipeline, Bundle, SpecializationState, SpecializeOptions};

pub fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

pub fn demo_path(name: &str) -> PathBuf {
    project_root().join("demos").join(format!("{}.json", name))
}

pub fn demo(name: &str) -> Bundle {
    let path = demo_path(name);
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
    Bundle::from_json(&text).unwrap()
}

/// Run passes up to `terminal`, panicking on any pipeline failure.
pub fn run_to(
    bundle: &Bundle,
    terminal: PassId,
    options: &SpecializeOptions,
) -> SpecializationState {
    let mut state = SpecializationState::from_bundle(bundle).unwrap();
    if let Err(e) = run_pipeline(&mut state, terminal, options, false, |_, _| {}) {
        let diags: Vec<String> = state.diagnostics.iter().map(|d| d.to_string()).collect();
        panic!("pipeline failed: {}\n{}", e, diags.join("\n"));
    }
    state
}

pub fn specialized(bundle: &Bundle) -> SpecializationState {
    run_to(bundle, PassId::Sweep, &SpecializeOptions::default())
}

pub fn program(state: &SpecializationState) -> &Program {
    state.program.as_ref().unwrap()
}

pub fn method<'a>(state: &'a SpecializationState, class: &str, name: &str) -> &'a Method {
    program(state)
        .method(class, name)
        .unwrap_or_else(|| panic!("no method {}::{}", class, name))
}

/// Names of every method called anywhere in `program`.
pub fn called_methods(program: &Program) -> Vec<String> {
    program
        .classes
        .values()
        .flat_map(|c| c.methods.iter())
        .flat_map(|m| m.body.iter())
        .filter_map(|s| s.call())
        .map(|c| c.method.name.clone())
        .collect()
}

/// Execute the scaffolded and the specialized program on the same inputs.
pub fn both_traces(
    state: &SpecializationState,
    inputs: &[(&str, usize, Vec<Value>)],
    iterations: usize,
) -> (Trace, Trace) {
    let before = execute(
        state.unspecialized.as_ref().unwrap(),
        &state.graph,
        &state.schedules,
        inputs,
        iterations,
    )
    .unwrap();
    let after =
        execute(program(state), &state.graph, &state.schedules, inputs, iterations).unwrap();
    (before, after)
}
