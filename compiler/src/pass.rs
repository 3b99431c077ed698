// pass.rs — Pass descriptor module: metadata, dependency resolution, certificates
//
// Declares the specializer's six passes (bundle parsing is outside the
// runner), their dependency edges, and the artifacts they produce. The
// pipeline runner uses the table to compute the minimal pass prefix for each
// --emit target. Ordering is part of correctness: every pass consumes the
// program exactly as its input pass left it.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each specialization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Scaffold,
    Resolve,
    InlineSchedule,
    InlineCalls,
    Unbox,
    Sweep,
}

/// Machine-readable artifact identifiers. Each maps to a field of the
/// specialization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Program,      // Program (mutated in place by every later pass)
    Bindings,     // Bindings
    Values,       // ConstantValueMap
    Lifecycle,    // synthesized composite lifecycle methods
    CallSites,    // CallSiteReport
    Replacements, // UnboxReport
    SweepReport,  // SweepReport
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// Postconditions, checked by the pass's certificate.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Scaffold => PassDescriptor {
            name: "scaffold",
            inputs: &[],
            outputs: &[ArtifactId::Program, ArtifactId::Bindings],
            invariants: "one generated class per entity, one bound field per port/attribute/child",
        },
        PassId::Resolve => PassDescriptor {
            name: "resolve",
            inputs: &[PassId::Scaffold],
            outputs: &[ArtifactId::Values],
            invariants: "one declared slot per settable attribute",
        },
        PassId::InlineSchedule => PassDescriptor {
            name: "inline_schedule",
            inputs: &[PassId::Resolve],
            outputs: &[ArtifactId::Lifecycle],
            invariants: "scheduled composites define all lifecycle methods with bodies",
        },
        PassId::InlineCalls => PassDescriptor {
            name: "inline_calls",
            inputs: &[PassId::InlineSchedule],
            outputs: &[ArtifactId::CallSites],
            invariants: "accessors on resolved attributes are field traffic",
        },
        PassId::Unbox => PassDescriptor {
            name: "unbox",
            inputs: &[PassId::InlineCalls],
            outputs: &[ArtifactId::Replacements],
            invariants: "every replaced field has declared component storage",
        },
        PassId::Sweep => PassDescriptor {
            name: "sweep",
            inputs: &[PassId::Unbox],
            outputs: &[ArtifactId::SweepReport],
            invariants: "every call in kept code targets a kept method",
        },
    }
}

// ── Certificates ───────────────────────────────────────────────────────────

/// Machine-checkable evidence that a pass met its postconditions.
pub trait StageCert {
    fn all_pass(&self) -> bool;

    /// Named obligations with their outcome, in a stable order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that failed.
    fn failed(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 6] = [
    PassId::Scaffold,
    PassId::Resolve,
    PassId::InlineSchedule,
    PassId::InlineCalls,
    PassId::Unbox,
    PassId::Sweep,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_scaffold_is_minimal() {
        assert_eq!(required_passes(PassId::Scaffold), vec![PassId::Scaffold]);
    }

    #[test]
    fn required_passes_sweep_includes_all() {
        assert_eq!(required_passes(PassId::Sweep), ALL_PASSES.to_vec());
    }

    #[test]
    fn unbox_runs_after_call_inlining() {
        let passes = required_passes(PassId::Unbox);
        assert_eq!(passes.last(), Some(&PassId::Unbox));
        assert!(!passes.contains(&PassId::Sweep));
        let calls = passes.iter().position(|p| *p == PassId::InlineCalls);
        let schedule = passes.iter().position(|p| *p == PassId::InlineSchedule);
        assert!(schedule < calls);
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(
                !desc.outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            for dep in desc.inputs {
                let order = required_passes(*pass);
                let dep_pos = order.iter().position(|p| p == dep);
                let self_pos = order.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }

    struct Pair(bool, bool);

    impl StageCert for Pair {
        fn all_pass(&self) -> bool {
            self.0 && self.1
        }

        fn obligations(&self) -> Vec<(&'static str, bool)> {
            vec![("first", self.0), ("second", self.1)]
        }
    }

    #[test]
    fn failed_lists_broken_obligations() {
        assert_eq!(Pair(true, false).failed(), vec!["second"]);
        assert!(Pair(true, true).failed().is_empty());
    }
}
