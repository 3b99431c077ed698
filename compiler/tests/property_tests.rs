// Property-based tests for specializer invariants.
//
// Two categories:
// 1. Token type lattice laws: least upper bound is a commutative, idempotent,
//    associative upper bound, and `compare` is antisymmetric
// 2. Schedule inlining: unroll-vs-loop decisions follow the threshold for
//    generated repetition counts, and the threshold never changes what the
//    specialized program computes, zero firings included
//
// Uses proptest with explicit configuration to prevent CI flakiness.

mod common;

use common::*;
use dfspec::exec::{execute, Trace};
use dfspec::expr::Value;
use dfspec::lattice::{compare, least_upper_bound, merge, TokenType, TypeRelation};
use dfspec::model::AttributeSpec;
use dfspec::pass::PassId;
use dfspec::pipeline::{Bundle, SpecializationState, SpecializeOptions};
use dfspec::schedule::{Firing, Schedule, ScheduleSet};
use proptest::prelude::*;

// ── Generators ──────────────────────────────────────────────────────────────

fn arb_token_type() -> impl Strategy<Value = TokenType> {
    let leaf = prop_oneof![
        Just(TokenType::Unknown),
        Just(TokenType::Boolean),
        Just(TokenType::Int),
        Just(TokenType::Long),
        Just(TokenType::Double),
        Just(TokenType::Scalar),
        Just(TokenType::String),
        Just(TokenType::General),
    ];
    leaf.prop_recursive(3, 8, 1, |inner| inner.prop_map(TokenType::array_of))
}

// ── Lattice laws ────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn lub_is_an_upper_bound(a in arb_token_type(), b in arb_token_type()) {
        let j = least_upper_bound(&a, &b);
        prop_assert!(a.leq(&j), "{} is not below {}", a, j);
        prop_assert!(b.leq(&j), "{} is not below {}", b, j);
    }

    #[test]
    fn lub_is_commutative(a in arb_token_type(), b in arb_token_type()) {
        prop_assert_eq!(least_upper_bound(&a, &b), least_upper_bound(&b, &a));
    }

    #[test]
    fn lub_is_idempotent(a in arb_token_type()) {
        prop_assert_eq!(least_upper_bound(&a, &a), a);
    }

    #[test]
    fn lub_is_associative(
        a in arb_token_type(),
        b in arb_token_type(),
        c in arb_token_type(),
    ) {
        let left = least_upper_bound(&least_upper_bound(&a, &b), &c);
        let right = least_upper_bound(&a, &least_upper_bound(&b, &c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn unknown_is_the_identity(a in arb_token_type()) {
        prop_assert_eq!(least_upper_bound(&TokenType::Unknown, &a), a.clone());
        prop_assert_eq!(merge(None, Some(&a)), a);
    }

    #[test]
    fn compare_is_antisymmetric(a in arb_token_type(), b in arb_token_type()) {
        let expected = match compare(&a, &b) {
            TypeRelation::Same => TypeRelation::Same,
            TypeRelation::Lower => TypeRelation::Higher,
            TypeRelation::Higher => TypeRelation::Lower,
            TypeRelation::Incomparable => TypeRelation::Incomparable,
        };
        prop_assert_eq!(compare(&b, &a), expected);
        if compare(&a, &b) == TypeRelation::Same {
            prop_assert_eq!(&a, &b);
        }
    }
}

// ── Schedule inlining ───────────────────────────────────────────────────────

fn fire_calls(fire: &str, actor: &str) -> usize {
    fire.lines()
        .map(str::trim)
        .filter(|l| l.starts_with(&format!("virtualinvoke {}", actor)) && l.ends_with(".fire();"))
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A always fires once (below every threshold tried); B's firings loop
    /// exactly when the count reaches the threshold.
    #[test]
    fn repetitions_follow_the_threshold(b in 1u32..=6, threshold in 2u32..=5) {
        let mut bundle = demo("pair");
        let mut schedules = ScheduleSet::new();
        schedules.insert(
            "top",
            Schedule::Dataflow {
                firings: vec![
                    Firing { actor: "A".into(), repetitions: 1 },
                    Firing { actor: "B".into(), repetitions: b },
                ],
            },
        );
        bundle.schedules = schedules;
        let options = SpecializeOptions { threshold, ..SpecializeOptions::default() };
        let state = run_to(&bundle, PassId::InlineSchedule, &options);
        let fire = method(&state, "CG_top", "fire").to_string();

        prop_assert_eq!(fire_calls(&fire, "A"), 1);
        let looped = b >= threshold;
        let expected = if looped { 1 } else { b as usize };
        prop_assert_eq!(fire_calls(&fire, "B"), expected, "{}", fire);
        let bound = format!("if iteration >= {} goto", b);
        prop_assert_eq!(fire.contains(&bound), looped, "{}", fire);
    }
}

// ── Threshold equivalence ───────────────────────────────────────────────────

/// The ramp demo with A, B and C fired `a`, `b` and `c` times per iteration.
/// Boundary rates follow the firings so every transfer finds its tokens.
fn ramp_with(a: u32, b: u32, c: u32) -> Bundle {
    let mut bundle = demo("ramp");
    let rates = [
        ("in", "tokenConsumptionRate", c),
        ("out", "tokenProductionRate", b),
        ("echo", "tokenProductionRate", c),
    ];
    for (port, attribute, rate) in rates {
        let spec = bundle.graph.ports.iter_mut().find(|p| p.name == port).unwrap();
        let attr: AttributeSpec = serde_json::from_value(serde_json::json!({
            "name": attribute,
            "expression": rate.to_string(),
        }))
        .unwrap();
        spec.attributes.push(attr);
    }
    let mut schedules = ScheduleSet::new();
    let firing = |actor: &str, repetitions| Firing { actor: actor.into(), repetitions };
    schedules.insert(
        "top",
        Schedule::Dataflow {
            firings: vec![firing("A", a), firing("B", b), firing("C", c)],
        },
    );
    bundle.schedules = schedules;
    bundle
}

const ITERATIONS: usize = 3;

fn trace_at(bundle: &Bundle, threshold: u32, inputs: &[(&str, usize, Vec<Value>)]) -> Trace {
    let options = SpecializeOptions { threshold, ..SpecializeOptions::default() };
    let state = run_to(bundle, PassId::Sweep, &options);
    execute(program(&state), &state.graph, &state.schedules, inputs, ITERATIONS).unwrap()
}

fn unspecialized_trace(
    state: &SpecializationState,
    inputs: &[(&str, usize, Vec<Value>)],
) -> Trace {
    let program = state.unspecialized.as_ref().unwrap();
    execute(program, &state.graph, &state.schedules, inputs, ITERATIONS).unwrap()
}

/// Traces at threshold 0 (everything looped) and at a threshold no count
/// reaches (everything unrolled), plus the unspecialized trace.
fn traces(a: u32, b: u32, c: u32) -> (Trace, Trace, Trace) {
    let bundle = ramp_with(a, b, c);
    let fed: Vec<Value> = (0..ITERATIONS as i32 * c as i32).map(Value::Int).collect();
    let inputs = [("in", 0, fed)];
    let looped = trace_at(&bundle, 0, &inputs);
    let unrolled = trace_at(&bundle, 100, &inputs);
    let state = run_to(&bundle, PassId::Scaffold, &SpecializeOptions::default());
    (looped, unrolled, unspecialized_trace(&state, &inputs))
}

fn arb_firings() -> impl Strategy<Value = (u32, u32, u32)> {
    (0u32..=3).prop_flat_map(|a| (Just(a), 0..=a, 0u32..=1))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn threshold_does_not_change_the_trace((a, b, c) in arb_firings()) {
        let (looped, unrolled, reference) = traces(a, b, c);
        prop_assert_eq!(&looped.sent, &unrolled.sent);
        prop_assert_eq!(looped.iterations, unrolled.iterations);
        prop_assert_eq!(looped.iterations, reference.iterations);
        for port in ["top.out", "top.echo"] {
            prop_assert_eq!(looped.sent.get(port), reference.sent.get(port), "{}", port);
        }
    }
}

#[test]
fn zero_firings_match_across_thresholds() {
    // B and C never fire; their boundary ports carry nothing.
    let (looped, unrolled, reference) = traces(2, 0, 0);
    assert_eq!(looped.sent, unrolled.sent);
    assert_eq!(looped.iterations, reference.iterations);
    for port in ["top.out", "top.echo"] {
        assert!(looped.sent.get(port).map_or(true, Vec::is_empty), "{port}");
        assert_eq!(looped.sent.get(port), reference.sent.get(port), "{port}");
    }
    // Ramp stops itself once its count reaches 3: two firings per iteration.
    assert_eq!(looped.iterations, 2);
}
