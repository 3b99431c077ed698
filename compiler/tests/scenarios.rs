// End-to-end specialization scenarios.
//
// Each test loads a demo bundle from `demos/`, runs the pipeline through the
// library API and checks the shape of the produced program. The equivalence
// tests execute the scaffolded and the specialized program with the
// reference interpreter and compare what leaves the top-level ports.

mod common;

use common::*;
use dfspec::expr::Value;
use dfspec::ir::IrType;
use dfspec::pass::PassId;
use dfspec::pipeline::SpecializeOptions;

fn fire_calls(fire: &str, actor: &str) -> usize {
    fire.lines()
        .map(str::trim)
        .filter(|l| l.starts_with(&format!("virtualinvoke {}", actor)) && l.ends_with(".fire();"))
        .count()
}

// ── Schedule inlining ──────────────────────────────────────────────────────

#[test]
fn short_firings_unroll_and_long_ones_loop() {
    let state = run_to(&demo("pair"), PassId::InlineSchedule, &SpecializeOptions::default());
    let fire = method(&state, "CG_top", "fire").to_string();
    assert_eq!(fire_calls(&fire, "A"), 1, "{fire}");
    assert_eq!(fire_calls(&fire, "B"), 1, "{fire}");
    assert!(fire.contains("if iteration >= 3 goto"), "{fire}");
    assert!(!fire.contains("if iteration >= 1 goto"), "{fire}");
    let a = fire.find("virtualinvoke A.fire();").unwrap();
    let b = fire.find("virtualinvoke B.fire();").unwrap();
    assert!(a < b, "{fire}");
}

#[test]
fn raising_the_threshold_unrolls_everything() {
    let options = SpecializeOptions {
        threshold: 4,
        ..SpecializeOptions::default()
    };
    let state = run_to(&demo("pair"), PassId::InlineSchedule, &options);
    let fire = method(&state, "CG_top", "fire").to_string();
    assert_eq!(fire_calls(&fire, "B"), 3, "{fire}");
    assert!(!fire.contains("iteration"), "{fire}");
}

// ── Attribute accessors ────────────────────────────────────────────────────

#[test]
fn parameter_accessors_become_one_slot() {
    let bundle = demo("scale");
    let state = run_to(&bundle, PassId::InlineCalls, &SpecializeOptions::default());
    let fire = method(&state, "CG_top_s", "fire").to_string();
    assert!(fire.contains("k = this._CGToken_gain;"), "{fire}");
    let init = method(&state, "CG_top_s", "initialize").to_string();
    assert!(init.contains("this._CGToken_gain = k;"), "{init}");

    let unspecialized = called_methods(state.unspecialized.as_ref().unwrap());
    assert!(unspecialized.iter().any(|m| m == "getToken"));
    assert!(unspecialized.iter().any(|m| m == "setToken"));
}

#[test]
fn no_accessor_call_survives_the_sweep() {
    let state = specialized(&demo("scale"));
    let calls = called_methods(program(&state));
    for accessor in ["getToken", "setToken", "getAttribute", "getPort"] {
        assert!(
            !calls.iter().any(|m| m == accessor),
            "`{}` is still called: {:?}",
            accessor,
            calls
        );
    }
    let sweep = state.summary.sweep.as_ref().unwrap();
    assert!(sweep.methods_removed > 0);
}

// ── Unboxing ───────────────────────────────────────────────────────────────

#[test]
fn token_array_field_becomes_native_array() {
    let state = run_to(&demo("taps"), PassId::Unbox, &SpecializeOptions::default());
    let class = state.program.as_ref().unwrap().class("CG_top_f").unwrap();
    assert_eq!(
        class.field("taps$_value$_value").unwrap().ty,
        IrType::array(IrType::Double)
    );
    assert_eq!(class.field("taps$isNull").unwrap().ty, IrType::Bool);
    let fire = method(&state, "CG_top_f", "fire").to_string();
    assert!(fire.contains("lengthof"), "{fire}");
    assert!(!fire.contains("invoke"), "{fire}");
}

#[test]
fn boxed_array_field_is_gone_after_the_sweep() {
    let state = specialized(&demo("taps"));
    let class = program(&state).class("CG_top_f").unwrap();
    assert!(!class.has_field("taps"), "{class}");
    assert!(class.has_field("taps$_value$_value"), "{class}");
}

// ── Mode controllers ───────────────────────────────────────────────────────

#[test]
fn controller_postfire_is_wired_through() {
    let state = run_to(&demo("modal"), PassId::InlineSchedule, &SpecializeOptions::default());
    let postfire = method(&state, "CG_top", "postfire").to_string();
    assert!(postfire.contains("result = virtualinvoke ctrl.postfire();"), "{postfire}");
    assert!(postfire.contains("return result;"), "{postfire}");
    assert!(!postfire.contains("return true;"), "{postfire}");
}

#[test]
fn controller_stops_the_specialized_run() {
    let state = specialized(&demo("modal"));
    let postfire = method(&state, "CG_top", "postfire").to_string();
    assert!(!postfire.contains("return true;"), "{postfire}");
    let (before, after) = both_traces(&state, &[], 10);
    assert_eq!(before.iterations, 3);
    assert_eq!(after.iterations, 3);
}

// ── Equivalence ────────────────────────────────────────────────────────────

#[test]
fn scaled_outputs_match() {
    let state = specialized(&demo("scale"));
    let inputs = [("in", 0, vec![Value::Double(1.0), Value::Double(2.5)])];
    let (before, after) = both_traces(&state, &inputs, 2);
    assert_eq!(
        before.sent["top.out"],
        vec![Value::Double(2.0), Value::Double(5.0)]
    );
    assert_eq!(before.sent["top.out"], after.sent["top.out"]);
    assert_eq!(before.iterations, after.iterations);
}

#[test]
fn ramp_outputs_match() {
    let state = specialized(&demo("ramp"));
    let inputs = [("in", 0, vec![Value::Int(1), Value::Int(2)])];
    let (before, after) = both_traces(&state, &inputs, 2);
    assert_eq!(before.iterations, after.iterations);
    for port in ["top.out", "top.echo"] {
        assert_eq!(before.sent.get(port), after.sent.get(port), "{port}");
    }
    assert_eq!(before.sent["top.echo"][0], Value::Int(1));
}

// ── Attribute writes and null tokens ───────────────────────────────────────

#[test]
fn attribute_writes_notify_once_after_the_write() {
    let state = specialized(&demo("tracker"));
    let calls = called_methods(program(&state));
    for name in ["setToken", "getToken", "attributeChanged"] {
        assert!(
            !calls.iter().any(|m| m == name),
            "`{}` is still called: {:?}",
            name,
            calls
        );
    }
    let fire = method(&state, "CG_top_t", "fire").to_string();
    assert!(!fire.contains("offset"), "{fire}");

    let written = vec![Value::Double(1.5), Value::Double(-4.0), Value::Double(0.25)];
    let inputs = [("in", 0, written.clone())];
    let (before, after) = both_traces(&state, &inputs, 3);
    let hits = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
    for trace in [&before, &after] {
        assert_eq!(trace.iterations, 3);
        // Reads after the write observe it, and so does the notification.
        assert_eq!(trace.sent["top.out"], written);
        assert_eq!(trace.sent["top.seen"], written);
        // One notification per write.
        assert_eq!(trace.sent["top.hits"], hits);
    }
}

#[test]
fn sometimes_null_tokens_keep_their_null_state() {
    let state = specialized(&demo("tracker"));
    let class = program(&state).class("CG_top_l").unwrap();
    assert!(class.has_field("held$isNull"), "{class}");
    assert!(!class.has_field("held"), "{class}");

    let inputs = [("in", 0, vec![Value::Double(0.0); 3])];
    let (before, after) = both_traces(&state, &inputs, 3);
    let empty = vec![Value::Bool(true), Value::Bool(false), Value::Bool(true)];
    let held = vec![Value::Int(-1), Value::Int(1), Value::Int(-1)];
    for trace in [&before, &after] {
        assert_eq!(trace.sent["top.empty"], empty);
        assert_eq!(trace.sent["top.held"], held);
    }
}
