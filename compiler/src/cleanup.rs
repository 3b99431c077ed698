// cleanup.rs — Local simplification of method bodies
//
// Runs a fixed set of rewrites until none applies: constant propagation and
// folding, constant-branch folding, dead pure assignments, unreachable code,
// jumps to the next statement, unused labels and `nop`s. Unused locals are
// compacted at the end.
//
// Preconditions: every jump target is defined by a label in the same body.
// Postconditions: the method computes the same results with the same side
//   effects; no `nop` remains.
// Failure modes: none.
// Side effects: mutates the method.

use std::collections::{HashSet, VecDeque};

use crate::cfg::{use_counts, Cfg};
use crate::id::{Label, LocalId};
use crate::ir::{
    fold_binary, fold_cast, fold_unary, is_pure, Constant, Method, Operand, Place, Program,
    Rvalue, Stmt,
};

/// Clean up one method. Returns whether anything changed.
pub fn cleanup_method(method: &mut Method) -> bool {
    if !method.has_body() {
        return false;
    }
    let mut changed_any = false;
    loop {
        let mut changed = propagate_constants(method);
        changed |= fold_branches(method);
        changed |= remove_dead_assignments(method);
        changed |= remove_unreachable(method);
        changed |= remove_redundant_jumps(method);
        changed |= remove_unused_labels(method);
        changed |= remove_nops(method);
        if !changed {
            break;
        }
        changed_any = true;
    }
    changed_any | compact_locals(method)
}

/// Clean up every method of the named classes. Returns the number of methods
/// that changed.
pub fn cleanup_classes(program: &mut Program, classes: &[String]) -> usize {
    let mut changed = 0;
    for name in classes {
        if let Some(class) = program.class_mut(name) {
            for method in &mut class.methods {
                if cleanup_method(method) {
                    changed += 1;
                }
            }
        }
    }
    changed
}

// ── Constant propagation ───────────────────────────────────────────────────

/// `None` means the local may hold different values at this point.
type Facts = Vec<Option<Constant>>;

fn same_constant(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Double(x), Constant::Double(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

fn meet(into: &mut Facts, other: &Facts) -> bool {
    let mut changed = false;
    for (a, b) in into.iter_mut().zip(other) {
        let keep = matches!((&*a, b), (Some(x), Some(y)) if same_constant(x, y));
        if !keep && a.is_some() {
            *a = None;
            changed = true;
        }
    }
    changed
}

fn operand_fact(op: &Operand, facts: &Facts) -> Option<Constant> {
    match op {
        Operand::Const(c) => Some(c.clone()),
        Operand::Local(l) => facts[l.index()].clone(),
    }
}

fn rvalue_fact(value: &Rvalue, facts: &Facts) -> Option<Constant> {
    match value {
        Rvalue::Use(o) => operand_fact(o, facts),
        Rvalue::Binary(op, a, b) => {
            fold_binary(*op, &operand_fact(a, facts)?, &operand_fact(b, facts)?)
        }
        Rvalue::Unary(op, a) => fold_unary(*op, &operand_fact(a, facts)?),
        Rvalue::Cast(ty, a) => fold_cast(ty, &operand_fact(a, facts)?),
        Rvalue::InstanceOf(_, a) => match operand_fact(a, facts)? {
            Constant::Null => Some(Constant::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn transfer(stmt: &Stmt, input: &Facts) -> Facts {
    let mut out = input.clone();
    if let Stmt::Assign {
        dest: Place::Local(l),
        value,
    } = stmt
    {
        out[l.index()] = rvalue_fact(value, input);
    }
    out
}

/// Facts holding before each statement; `None` for unreachable statements.
fn constant_facts(method: &Method, cfg: &Cfg) -> Vec<Option<Facts>> {
    let n = method.body.len();
    let mut states: Vec<Option<Facts>> = vec![None; n];
    if n == 0 {
        return states;
    }
    states[0] = Some(vec![None; method.locals.len()]);
    let mut queue = VecDeque::from([0]);
    let mut queued = vec![false; n];
    queued[0] = true;
    while let Some(i) = queue.pop_front() {
        queued[i] = false;
        let Some(input) = &states[i] else { continue };
        let out = transfer(&method.body[i], input);
        for &s in &cfg.succs[i] {
            let changed = match &mut states[s] {
                Some(existing) => meet(existing, &out),
                slot @ None => {
                    *slot = Some(out.clone());
                    true
                }
            };
            if changed && !queued[s] {
                queued[s] = true;
                queue.push_back(s);
            }
        }
    }
    states
}

fn propagate_constants(method: &mut Method) -> bool {
    let cfg = Cfg::build(method);
    let states = constant_facts(method, &cfg);
    let mut changed = false;
    for (stmt, state) in method.body.iter_mut().zip(&states) {
        let Some(facts) = state else { continue };
        stmt.for_each_operand_mut(&mut |op| {
            if let Operand::Local(l) = op {
                if let Some(c) = &facts[l.index()] {
                    *op = Operand::Const(c.clone());
                    changed = true;
                }
            }
        });
        if let Stmt::Assign { value, .. } = stmt {
            if matches!(value, Rvalue::Use(Operand::Const(_))) {
                continue;
            }
            if let Some(c) = rvalue_fact(value, facts) {
                *value = Rvalue::Use(Operand::Const(c));
                changed = true;
            }
        }
    }
    changed
}

// ── Control flow ───────────────────────────────────────────────────────────

fn fold_branches(method: &mut Method) -> bool {
    let mut changed = false;
    for stmt in &mut method.body {
        if let Stmt::If {
            op,
            lhs: Operand::Const(a),
            rhs: Operand::Const(b),
            target,
        } = stmt
        {
            match fold_binary(*op, a, b) {
                Some(Constant::Bool(true)) => *stmt = Stmt::Goto(*target),
                Some(Constant::Bool(false)) => *stmt = Stmt::Nop,
                _ => continue,
            }
            changed = true;
        }
    }
    changed
}

fn remove_unreachable(method: &mut Method) -> bool {
    let reachable = Cfg::build(method).reachable();
    let mut changed = false;
    for (stmt, live) in method.body.iter_mut().zip(reachable) {
        if !live && *stmt != Stmt::Nop {
            *stmt = Stmt::Nop;
            changed = true;
        }
    }
    changed
}

/// Whether `label` is defined in the run of labels starting at `from`.
fn label_follows(body: &[Stmt], from: usize, label: Label) -> bool {
    for stmt in &body[from..] {
        match stmt {
            Stmt::Label(l) if *l == label => return true,
            Stmt::Label(_) | Stmt::Nop => {}
            _ => return false,
        }
    }
    false
}

fn remove_redundant_jumps(method: &mut Method) -> bool {
    let mut changed = false;
    for i in 0..method.body.len() {
        let target = match &method.body[i] {
            Stmt::Goto(l) | Stmt::If { target: l, .. } => *l,
            _ => continue,
        };
        if label_follows(&method.body, i + 1, target) {
            method.body[i] = Stmt::Nop;
            changed = true;
        }
    }
    changed
}

fn remove_unused_labels(method: &mut Method) -> bool {
    let targets: HashSet<Label> = method.body.iter().filter_map(|s| s.branch_target()).collect();
    let mut changed = false;
    for stmt in &mut method.body {
        if matches!(stmt, Stmt::Label(l) if !targets.contains(l)) {
            *stmt = Stmt::Nop;
            changed = true;
        }
    }
    changed
}

fn remove_nops(method: &mut Method) -> bool {
    let before = method.body.len();
    method.body.retain(|s| *s != Stmt::Nop);
    method.body.len() != before
}

// ── Locals ─────────────────────────────────────────────────────────────────

fn remove_dead_assignments(method: &mut Method) -> bool {
    let uses = use_counts(method);
    let mut changed = false;
    for stmt in &mut method.body {
        let Stmt::Assign {
            dest: Place::Local(l),
            value,
        } = stmt
        else {
            continue;
        };
        if uses[l.index()] > 0 {
            continue;
        }
        if is_pure(value) {
            *stmt = Stmt::Nop;
        } else if let Rvalue::Call(call) = value {
            *stmt = Stmt::Invoke(call.clone());
        } else {
            continue;
        }
        changed = true;
    }
    changed
}

/// Drop locals that no statement mentions, renumbering the rest.
fn compact_locals(method: &mut Method) -> bool {
    let mut mentioned = vec![false; method.locals.len()];
    for id in method.this_local.iter().chain(&method.params) {
        mentioned[id.index()] = true;
    }
    for stmt in &method.body {
        for l in stmt.used_locals().into_iter().chain(stmt.def_local()) {
            mentioned[l.index()] = true;
        }
    }
    if mentioned.iter().all(|m| *m) {
        return false;
    }
    let mut remap = vec![None; method.locals.len()];
    let mut kept = Vec::new();
    for (i, decl) in method.locals.iter().enumerate() {
        if mentioned[i] {
            remap[i] = Some(LocalId(kept.len() as u32));
            kept.push(decl.clone());
        }
    }
    let renumber = |l: &mut LocalId| {
        if let Some(new) = remap[l.index()] {
            *l = new;
        }
    };
    method.locals = kept;
    if let Some(this) = &mut method.this_local {
        renumber(this);
    }
    for p in &mut method.params {
        renumber(p);
    }
    for stmt in &mut method.body {
        stmt.for_each_local_mut(&mut |l| renumber(l));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::parse_ir;

    fn method(locals: &str, body: &str) -> Method {
        let src = format!(
            "class A {{ method g(): int {{ return 7; }} method f(x: int): int {{ {} {} }} }}",
            locals, body
        );
        let p: Program = parse_ir(&src, &Program::new()).unwrap();
        p.method("A", "f").unwrap().clone()
    }

    fn lines(m: &Method) -> Vec<String> {
        m.body.iter().map(|s| m.display_stmt(s).to_string()).collect()
    }

    #[test]
    fn folds_constant_branch_and_drops_dead_code() {
        let mut m = method(
            "local i: int;",
            "i = 1;
             if i == 1 goto yes;
             return 0;
         yes:
             return i;",
        );
        assert!(cleanup_method(&mut m));
        assert_eq!(lines(&m), vec!["return 1;"]);
        assert!(m.local_by_name("i").is_none());
        assert_eq!(m.params.len(), 1);
    }

    #[test]
    fn flow_sensitive_flags_fold() {
        let mut m = method(
            "local f: boolean; local z: boolean; local r: int;",
            "f = true;
             f = false;
             z = f == false;
             if z == false goto other;
             r = 1;
             goto done;
         other:
             r = 2;
         done:
             return r;",
        );
        cleanup_method(&mut m);
        assert_eq!(lines(&m), vec!["return 1;"]);
        assert_eq!(m.locals.len(), 2);
    }

    #[test]
    fn loop_counter_is_not_folded() {
        let mut m = method(
            "local i: int;",
            "i = 0;
         top:
             if i >= x goto out;
             i = i + 1;
             goto top;
         out:
             return i;",
        );
        let before = lines(&m);
        assert!(!cleanup_method(&mut m));
        assert_eq!(lines(&m), before);
    }

    #[test]
    fn unused_call_result_keeps_the_call() {
        let mut m = method(
            "local t: int;",
            "t = virtualinvoke this.g();
             return 0;",
        );
        cleanup_method(&mut m);
        assert_eq!(lines(&m), vec!["virtualinvoke this.g();", "return 0;"]);
        assert!(m.local_by_name("t").is_none());
    }

    #[test]
    fn division_by_zero_is_left_alone() {
        let mut m = method("local i: int;", "i = 1 / 0; return i;");
        cleanup_method(&mut m);
        assert_eq!(lines(&m), vec!["i = 1 / 0;", "return i;"]);
    }

    #[test]
    fn mixed_operands_promote() {
        assert_eq!(
            fold_binary(crate::ir::BinOp::Add, &Constant::Int(1), &Constant::Double(0.5)),
            Some(Constant::Double(1.5))
        );
        assert_eq!(
            fold_binary(crate::ir::BinOp::Add, &Constant::Str("n=".into()), &Constant::Int(3)),
            Some(Constant::Str("n=3".into()))
        );
        assert_eq!(
            fold_cast(&crate::ir::IrType::Int, &Constant::Double(-2.7)),
            Some(Constant::Int(-2))
        );
    }
}
