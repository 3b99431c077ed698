// dce.rs — Whole-program dead-code elimination
//
// Builds a conservative call graph from the roots (lifecycle methods of the
// top-level class, `<init>` of every entity class, `finalize` methods and
// the `<clinit>` of every class the kept code refers to) and keeps only what
// it reaches. A virtual call reaches every implementation in the subtree of
// its static class and the inherited one above it.
//
// After the sweep:
//   - unreached methods are gone,
//   - fields of entity classes that no kept code reads are gone, with their
//     writes,
//   - unused results of side-effect-free runtime lookups are gone,
//   - classes no kept code refers to are gone. Token classes are kept or
//     dropped together, since the runtime creates tokens of any class.
//
// Preconditions: runs last; no later pass adds calls.
// Postconditions: every call in kept code targets a kept method.
// Failure modes: a root class missing → `SpecializeError::InternalConsistency`.
// Side effects: removes methods, fields, statements and classes.

use std::collections::{BTreeSet, HashSet, VecDeque};

use tracing::debug;

use crate::cleanup::cleanup_method;
use crate::cfg::use_counts;
use crate::error::{Result, SpecializeError};
use crate::ir::{
    CallKind, FieldRef, IrType, Method, MethodRef, Place, Program, Rvalue, Stmt, TOKEN_CLASS,
};
use crate::library::{is_pure_native, LIFECYCLE};

/// Entry points of a sweep.
#[derive(Debug, Clone)]
pub struct Roots {
    /// Class whose lifecycle methods the runtime invokes.
    pub top: String,
    /// Classes the runtime instantiates.
    pub entities: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub methods_removed: usize,
    pub fields_removed: usize,
    pub lookups_removed: usize,
    pub classes_removed: usize,
}

type MethodKey = (String, String);

pub fn sweep(program: &mut Program, roots: &Roots) -> Result<SweepReport> {
    if program.class(&roots.top).is_none() {
        return Err(SpecializeError::internal(format!(
            "top-level class `{}` does not exist",
            roots.top
        )));
    }
    let mut report = SweepReport::default();

    // Dropping lookups and field writes can only shrink the call graph, so
    // one more round after a change is enough to settle.
    loop {
        let reached = reachable_methods(program, roots);
        report.methods_removed += remove_methods(program, &reached);
        let lookups = remove_unused_lookups(program, &roots.entities);
        let fields = remove_unread_fields(program, &roots.entities);
        report.lookups_removed += lookups;
        report.fields_removed += fields;
        if lookups == 0 && fields == 0 {
            break;
        }
    }
    report.classes_removed = remove_classes(program, roots);
    debug!(
        methods = report.methods_removed,
        fields = report.fields_removed,
        classes = report.classes_removed,
        "sweep done"
    );
    Ok(report)
}

// ── Call graph ──────────────────────────────────────────────────────────────

fn root_methods(program: &Program, roots: &Roots) -> Vec<MethodKey> {
    let mut out = Vec::new();
    for name in LIFECYCLE {
        if let Some((decl, _)) = program.lookup_method(&roots.top, name) {
            out.push((decl, name.to_string()));
        }
    }
    for class in &roots.entities {
        for c in program.superclass_chain(class) {
            if program.method(&c, "<init>").is_some() {
                out.push((c.clone(), "<init>".to_string()));
            }
        }
    }
    for (class, name) in program.method_keys() {
        if name == "finalize" {
            out.push((class, name));
        }
    }
    out
}

/// Classes a statement refers to by name.
fn referenced_classes(stmt: &Stmt, out: &mut Vec<String>) {
    let place = |p: &Place, out: &mut Vec<String>| {
        if let Place::Static(f) = p {
            out.push(f.class.clone());
        }
    };
    match stmt {
        Stmt::Assign { dest, value } => {
            place(dest, out);
            match value {
                Rvalue::Load(p) => place(p, out),
                Rvalue::New(c) | Rvalue::InstanceOf(c, _) => out.push(c.clone()),
                Rvalue::NewArray(ty, _) | Rvalue::Cast(ty, _) => out.extend(base_class(ty)),
                Rvalue::Call(c) if c.kind == CallKind::Static => out.push(c.method.class.clone()),
                _ => {}
            }
        }
        Stmt::Invoke(c) if c.kind == CallKind::Static => out.push(c.method.class.clone()),
        _ => {}
    }
}

fn base_class(ty: &IrType) -> Option<String> {
    match ty {
        IrType::Object(c) => Some(c.clone()),
        IrType::Array(e) => base_class(e),
        _ => None,
    }
}

/// Methods a call may reach.
fn call_targets(program: &Program, kind: CallKind, class: &str, name: &str) -> Vec<MethodKey> {
    let mut out = Vec::new();
    if let Some((decl, _)) = program.lookup_method(class, name) {
        out.push((decl, name.to_string()));
    }
    if kind == CallKind::Virtual {
        for sub in program.subclasses(class) {
            if program.method(&sub, name).is_some() {
                let key = (sub, name.to_string());
                if !out.contains(&key) {
                    out.push(key);
                }
            }
        }
    }
    out
}

fn reachable_methods(program: &Program, roots: &Roots) -> HashSet<MethodKey> {
    let mut seen: HashSet<MethodKey> = HashSet::new();
    let mut queue: VecDeque<MethodKey> = root_methods(program, roots).into();
    let mut initialized: HashSet<String> = HashSet::new();
    while let Some(key) = queue.pop_front() {
        if !seen.insert(key.clone()) {
            continue;
        }
        let Some(method) = program.method(&key.0, &key.1) else {
            continue;
        };
        let mut classes = vec![key.0.clone()];
        for stmt in &method.body {
            if let Some(call) = stmt.call() {
                let targets =
                    call_targets(program, call.kind, &call.method.class, &call.method.name);
                queue.extend(targets);
            }
            referenced_classes(stmt, &mut classes);
        }
        for class in classes {
            for c in program.superclass_chain(&class) {
                if initialized.insert(c.clone()) && program.method(&c, "<clinit>").is_some() {
                    queue.push_back((c, "<clinit>".to_string()));
                }
            }
        }
    }
    seen
}

fn remove_methods(program: &mut Program, reached: &HashSet<MethodKey>) -> usize {
    let mut removed = 0;
    for (name, class) in program.classes.iter_mut() {
        let before = class.methods.len();
        class
            .methods
            .retain(|m| reached.contains(&(name.clone(), m.name.clone())));
        removed += before - class.methods.len();
    }
    removed
}

// ── Statements and fields ───────────────────────────────────────────────────

/// Drop `x = <lookup>` when `x` is never read. Returns the number dropped.
fn remove_unused_lookups(program: &mut Program, classes: &[String]) -> usize {
    let mut removed = 0;
    for name in classes {
        let Some(class) = program.class(name) else {
            continue;
        };
        let mut rewritten = Vec::new();
        for method in class.methods.iter().filter(|m| m.has_body()) {
            let uses = use_counts(method);
            let dead: Vec<usize> = method
                .body
                .iter()
                .enumerate()
                .filter(|(_, s)| match s {
                    Stmt::Assign {
                        dest: Place::Local(l),
                        value: Rvalue::Call(c),
                    } => {
                        uses[l.index()] == 0
                            && program
                                .lookup_method(&c.method.class, &c.method.name)
                                .is_some_and(|(decl, _)| {
                                    is_pure_native(&MethodRef::new(&decl, &c.method.name))
                                })
                    }
                    _ => false,
                })
                .map(|(i, _)| i)
                .collect();
            if dead.is_empty() {
                continue;
            }
            let mut m = method.clone();
            for &i in &dead {
                m.body[i] = Stmt::Nop;
            }
            removed += dead.len();
            rewritten.push(m);
        }
        if let Some(class) = program.class_mut(name) {
            for mut m in rewritten {
                cleanup_method(&mut m);
                class.put_method(m);
            }
        }
    }
    removed
}

/// Declaring class of a field reference.
fn declared(program: &Program, field: &FieldRef) -> FieldRef {
    match program.lookup_field(&field.class, &field.name) {
        Some((owner, _)) => FieldRef::new(&owner, &field.name),
        None => field.clone(),
    }
}

fn reads(program: &Program) -> BTreeSet<FieldRef> {
    let mut out = BTreeSet::new();
    for class in program.classes.values() {
        for method in &class.methods {
            for stmt in &method.body {
                let Stmt::Assign { value, .. } = stmt else {
                    continue;
                };
                if let Rvalue::Load(Place::Field { field, .. } | Place::Static(field)) = value {
                    out.insert(declared(program, field));
                }
            }
        }
    }
    out
}

/// Remove fields of `classes` that nothing reads, with their writes.
fn remove_unread_fields(program: &mut Program, classes: &[String]) -> usize {
    let read = reads(program);
    let mut dead: HashSet<FieldRef> = HashSet::new();
    for name in classes {
        if let Some(class) = program.class(name) {
            for f in &class.fields {
                let r = FieldRef::new(name, &f.name);
                if !read.contains(&r) {
                    dead.insert(r);
                }
            }
        }
    }
    if dead.is_empty() {
        return 0;
    }

    let writes_dead = |program: &Program, stmt: &Stmt| match stmt {
        Stmt::Assign {
            dest: Place::Field { field, .. } | Place::Static(field),
            ..
        } => dead.contains(&declared(program, field)),
        _ => false,
    };
    let mut updates: Vec<(String, Method)> = Vec::new();
    for (cname, class) in &program.classes {
        for method in &class.methods {
            if !method.body.iter().any(|s| writes_dead(program, s)) {
                continue;
            }
            let mut m = method.clone();
            for stmt in &mut m.body {
                if writes_dead(program, stmt) {
                    *stmt = match std::mem::replace(stmt, Stmt::Nop) {
                        Stmt::Assign {
                            value: Rvalue::Call(c),
                            ..
                        } => Stmt::Invoke(c),
                        _ => Stmt::Nop,
                    };
                }
            }
            updates.push((cname.clone(), m));
        }
    }
    for (cname, mut m) in updates {
        cleanup_method(&mut m);
        if let Some(class) = program.class_mut(&cname) {
            class.put_method(m);
        }
    }
    let mut removed = 0;
    for name in classes {
        if let Some(class) = program.class_mut(name) {
            let before = class.fields.len();
            class
                .fields
                .retain(|f| !dead.contains(&FieldRef::new(name, &f.name)));
            removed += before - class.fields.len();
        }
    }
    removed
}

// ── Classes ─────────────────────────────────────────────────────────────────

/// Classes the kept program mentions, closed over superclasses.
fn live_classes(program: &Program, roots: &Roots) -> HashSet<String> {
    let mut pending: Vec<String> = vec![roots.top.clone()];
    pending.extend(roots.entities.iter().cloned());
    let mut live: HashSet<String> = HashSet::new();
    while let Some(name) = pending.pop() {
        if !live.insert(name.clone()) {
            continue;
        }
        let Some(class) = program.class(&name) else {
            continue;
        };
        pending.extend(class.superclass.iter().cloned());
        for f in &class.fields {
            pending.extend(base_class(&f.ty));
        }
        for m in &class.methods {
            pending.extend(base_class(&m.return_type));
            for l in &m.locals {
                pending.extend(base_class(&l.ty));
            }
            for stmt in &m.body {
                referenced_classes(stmt, &mut pending);
                if let Some(c) = stmt.call() {
                    pending.push(c.method.class.clone());
                }
                for f in stmt.field_refs() {
                    pending.push(f.class.clone());
                }
            }
        }
        if program.is_token_class(&name) {
            pending.extend(program.subclasses(TOKEN_CLASS));
        }
    }
    live
}

fn remove_classes(program: &mut Program, roots: &Roots) -> usize {
    let live = live_classes(program, roots);
    let before = program.classes.len();
    program.classes.retain(|name, _| live.contains(name));
    before - program.classes.len()
}

// ── Certificate ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for sweep postconditions (D1-D2).
#[derive(Debug, Clone)]
pub struct SweepCert {
    /// D1: every call in kept code resolves to a kept method.
    pub d1_calls_resolve: bool,
    /// D2: the top-level class still answers every lifecycle method.
    pub d2_roots_kept: bool,
}

impl crate::pass::StageCert for SweepCert {
    fn all_pass(&self) -> bool {
        self.d1_calls_resolve && self.d2_roots_kept
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("D1_calls_resolve", self.d1_calls_resolve),
            ("D2_roots_kept", self.d2_roots_kept),
        ]
    }
}

pub fn verify_sweep(program: &Program, roots: &Roots) -> SweepCert {
    let d1 = program.classes.values().all(|class| {
        class.methods.iter().all(|m| {
            m.body.iter().filter_map(Stmt::call).all(|c| {
                program
                    .lookup_method(&c.method.class, &c.method.name)
                    .is_some()
            })
        })
    });
    let d2 = LIFECYCLE
        .iter()
        .all(|m| program.lookup_method(&roots.top, m).is_some());
    SweepCert {
        d1_calls_resolve: d1,
        d2_roots_kept: d2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::runtime_library;
    use crate::lower::parse_ir;

    fn program(src: &str) -> Program {
        let mut p = runtime_library().unwrap();
        let user = parse_ir(src, &p).unwrap();
        p.merge(user);
        p
    }

    fn roots() -> Roots {
        Roots {
            top: "Top".into(),
            entities: vec!["Top".into()],
        }
    }

    const SRC: &str = "
        class Top extends Actor {
            field kept: int;
            field gone: int;
            field gain: Parameter;

            method fire() {
                local a: Attribute;
                local k: int;
                a = virtualinvoke this.getAttribute(\"gain\");
                k = this.kept;
                k = k + 1;
                this.kept = k;
                this.gone = k;
                virtualinvoke this.helper();
                return;
            }

            method helper() {
                return;
            }

            method orphan() {
                virtualinvoke this.orphan2();
                return;
            }

            method orphan2() {
                return;
            }
        }

        class Unused {
            method f() {
                return;
            }
        }
    ";

    #[test]
    fn unreachable_methods_and_classes_go() {
        let mut p = program(SRC);
        let report = sweep(&mut p, &roots()).unwrap();
        let top = p.class("Top").unwrap();
        assert!(top.method("fire").is_some());
        assert!(top.method("helper").is_some());
        assert!(top.method("orphan").is_none());
        assert!(top.method("orphan2").is_none());
        assert!(p.class("Unused").is_none());
        assert!(p.class("Expression").is_none());
        assert!(report.methods_removed >= 2);
        assert!(report.classes_removed >= 2);
    }

    #[test]
    fn unread_fields_and_lookups_go() {
        let mut p = program(SRC);
        let report = sweep(&mut p, &roots()).unwrap();
        let top = p.class("Top").unwrap();
        assert!(top.has_field("kept"));
        assert!(!top.has_field("gone"));
        assert!(!top.has_field("gain"));
        let fire = top.method("fire").unwrap().to_string();
        assert!(!fire.contains("getAttribute"), "{fire}");
        assert!(!fire.contains("this.gone"), "{fire}");
        assert_eq!(report.lookups_removed, 1);
        assert!(report.fields_removed >= 2);
    }

    #[test]
    fn virtual_calls_reach_overrides() {
        let mut p = program(
            "class Top extends Actor {
                field s: Shape;

                method fire() {
                    local s: Shape;
                    local q: Square;
                    local a: double;
                    q = new Square;
                    this.s = q;
                    s = this.s;
                    a = virtualinvoke s.area();
                    return;
                }
            }

            class Shape {
                method area(): double {
                    return 0.0;
                }
            }

            class Square extends Shape {
                method area(): double {
                    return 1.0;
                }

                method side(): double {
                    return 1.0;
                }
            }",
        );
        sweep(&mut p, &roots()).unwrap();
        assert!(p.method("Shape", "area").is_some());
        assert!(p.method("Square", "area").is_some());
        assert!(p.method("Square", "side").is_none());
    }

    #[test]
    fn tokens_are_kept_together() {
        let mut p = program(
            "class Top extends Actor {
                field out: IOPort;

                method fire() {
                    local p: IOPort;
                    local t: Token;
                    p = this.out;
                    t = virtualinvoke p.get(0);
                    virtualinvoke p.send(0, t);
                    return;
                }
            }",
        );
        sweep(&mut p, &roots()).unwrap();
        for c in ["Token", "IntToken", "DoubleToken", "ArrayToken", "BooleanToken"] {
            assert!(p.class(c).is_some(), "{c}");
        }
        assert!(p.class("IOPort").unwrap().method("get").is_some());
    }
}
