// unbox.rs — Replacement of boxed token values by native storage
//
// For each nesting depth from the deepest down to 0, rounds of
//
//   analyze types → inline token methods on exact receivers of that depth →
//   analyze types → choose values → create storage → rewrite accesses →
//   clean up
//
// run until a round chooses nothing. A token value with an exact,
// instantiable shape is replaced by one native component per instance field
// of its class (`x$_value`) plus a null flag (`x$isNull`). At depth 0,
// arrays of tokens whose elements are exact scalars are replaced by one
// native array per component and no flag; their elements are never null.
//
// Values computed by dynamic natives (and everything copied from them) and
// method parameters stay boxed and are reported with `W0303`. Values that
// cross a boundary that stays boxed (unresolved calls, returns, port I/O)
// are boxed or unboxed on the spot by adapter temporaries (`box`, `unbox`).
// An adapter is itself replaced once it no longer touches such a boundary.
// Token arrays that cross a boundary, or get a `null` element, stay boxed
// entirely. Whole sweeps repeat until one changes nothing, so a second run
// over the result is a no-op.
//
// Preconditions: call sites of generated classes are resolved.
// Postconditions: no chosen value is read or written in boxed form.
// Failure modes: a rewrite that needs a replacement never registered, or
//   boxing of an array → `SpecializeError::InternalConsistency`.
// Side effects: adds fields and locals, rewrites method bodies.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::callsite::inline_token_calls;
use crate::cfg::def_counts;
use crate::cleanup::cleanup_classes;
use crate::diag::{codes, Diagnostic, Location};
use crate::error::{Result, SpecializeError};
use crate::id::LocalId;
use crate::ir::{
    BinOp, Call, Constant, FieldRef, IrType, Method, Operand, Place, Program, Rvalue, Stmt,
};
use crate::library::BOOLEAN_TOKEN_CLASS;
use crate::resolve::{append_to_init, token_class};
use crate::typeflow::{analyze, ArrayKey, Shape, SpecializedTypeMap, TypeContext};

/// Suffix of the null flag of a replaced token.
pub const IS_NULL: &str = "isNull";

/// Adapter temporary holding a token built from replaced storage.
const BOX_TEMP: &str = "box";
/// Adapter temporary holding a boxed token about to be taken apart.
const UNBOX_TEMP: &str = "unbox";

// ── Replacement map ─────────────────────────────────────────────────────────

/// A boxed value: a local of one method or a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKey {
    Local {
        class: String,
        method: String,
        name: String,
    },
    Field(FieldRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Instance field of the token class this component stands for.
    pub field: FieldRef,
    pub name: String,
    pub ty: IrType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    /// Token class of the value (element class for arrays).
    pub token_class: String,
    pub components: Vec<Component>,
    /// Name of the null flag; arrays have none.
    pub is_null: Option<String>,
    pub array: bool,
}

/// Boxed value → native storage, registered once per value.
#[derive(Debug, Default)]
pub struct ReplacementMap {
    entries: HashMap<ValueKey, Replacement>,
}

impl ReplacementMap {
    pub fn get(&self, key: &ValueKey) -> Option<&Replacement> {
        self.entries.get(key)
    }

    pub fn lookup(&self, key: &ValueKey) -> Result<&Replacement> {
        self.entries
            .get(key)
            .ok_or_else(|| {
                SpecializeError::internal(format!("no replacement registered for {:?}", key))
            })
    }

    /// Register `fresh` unless an identical replacement exists. A different
    /// one means the name now denotes another value and is overwritten.
    fn register(&mut self, key: ValueKey, fresh: Replacement) {
        match self.entries.get(&key) {
            Some(existing) if *existing == fresh => {}
            _ => {
                self.entries.insert(key, fresh);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by key.
    pub fn entries(&self) -> Vec<(&ValueKey, &Replacement)> {
        let mut out: Vec<_> = self.entries.iter().collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }
}

fn replacement_for(
    program: &Program,
    base: &str,
    token: &str,
    shape: &Shape,
    array: bool,
) -> Replacement {
    let components = program
        .instance_fields(token)
        .into_iter()
        .map(|field| {
            let declared = program.field_type(&field).cloned().unwrap_or(IrType::Void);
            let ty = if program.is_token_array_type(&declared) {
                IrType::array(IrType::object(token_class(&shape.element().ty)))
            } else {
                declared
            };
            Component {
                name: format!("{}${}", base, field.name),
                ty: if array { IrType::array(ty) } else { ty },
                field,
            }
        })
        .collect();
    Replacement {
        token_class: token.to_string(),
        components,
        is_null: (!array).then(|| format!("{}${}", base, IS_NULL)),
        array,
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct UnboxOptions {
    pub max_depth: usize,
    /// Bound on rounds per depth, and on inlining rounds per step.
    pub max_rounds: usize,
}

#[derive(Debug, Default)]
pub struct UnboxReport {
    pub unboxed: usize,
    pub inlined: usize,
    pub replacements: ReplacementMap,
    pub diagnostics: Vec<Diagnostic>,
}

/// Unbox token values of the generated `classes`.
pub fn unbox(
    program: &mut Program,
    classes: &[String],
    ctx: &TypeContext,
    options: UnboxOptions,
) -> Result<UnboxReport> {
    let mut unboxer = Unboxer {
        classes: classes.to_vec(),
        ctx,
        options,
        reported: HashSet::new(),
        report: UnboxReport::default(),
    };
    for sweep in 0..options.max_rounds {
        let before = (unboxer.report.unboxed, unboxer.report.inlined);
        let top = analyze(program, classes, ctx).max_depth(options.max_depth);
        for depth in (0..=top).rev() {
            for round in 0..options.max_rounds {
                unboxer.inline_at(program, depth)?;
                let types = analyze(program, classes, ctx);
                let plan = unboxer.plan(program, &types, depth);
                if plan.is_empty() {
                    break;
                }
                debug!(sweep, depth, round, values = plan.len(), "unbox round");
                unboxer.report.unboxed += plan.len();
                unboxer.apply(program, plan)?;
                cleanup_classes(program, classes);
            }
        }
        if (unboxer.report.unboxed, unboxer.report.inlined) == before {
            break;
        }
    }
    Ok(unboxer.report)
}

const DYNAMIC_HINT: &str = "the value flows from a dynamic call such as Expression::evaluate";

struct Candidate {
    key: ValueKey,
    token_class: String,
    shape: Shape,
    array: bool,
}

/// Values computed by dynamic natives, directly or through copies.
#[derive(Default)]
struct Taint {
    locals: HashSet<(String, String, LocalId)>,
    fields: HashSet<FieldRef>,
}

struct Unboxer<'a> {
    classes: Vec<String>,
    ctx: &'a TypeContext,
    options: UnboxOptions,
    reported: HashSet<String>,
    report: UnboxReport,
}

impl Unboxer<'_> {
    fn inline_at(&mut self, program: &mut Program, depth: usize) -> Result<()> {
        let mut unused = Vec::new();
        let mut seen = HashSet::new();
        for _ in 0..self.options.max_rounds {
            let types = analyze(program, &self.classes, self.ctx);
            let n = inline_token_calls(
                program,
                &self.classes,
                &types,
                Some(depth),
                &mut unused,
                &mut seen,
            )?;
            if n == 0 {
                break;
            }
            self.report.inlined += n;
        }
        Ok(())
    }

    // ── Choosing values ─────────────────────────────────────────────────────

    fn plan(
        &mut self,
        program: &Program,
        types: &SpecializedTypeMap,
        depth: usize,
    ) -> Vec<Candidate> {
        let taint = dynamic_taint(program, &self.classes);
        self.report_unsafe(program, &taint);
        let excluded = excluded_locals(program, &self.classes);
        let mut out = Vec::new();
        for class in &self.classes {
            let Some(k) = program.class(class) else {
                continue;
            };
            for method in k.methods.iter().filter(|m| m.has_body()) {
                let defs = def_counts(method);
                for (i, decl) in method.locals.iter().enumerate() {
                    let l = LocalId(i as u32);
                    if method.is_entry_bound(l)
                        || defs[i] == 0
                        || !program.is_token_type(&decl.ty)
                        || is_live_adapter(method, l)
                    {
                        continue;
                    }
                    let id = (class.clone(), method.name.clone(), l);
                    if taint.locals.contains(&id) || excluded.contains(&id) {
                        continue;
                    }
                    let shape = types.local(class, &method.name, l);
                    if let Some(c) = candidate(&shape, depth) {
                        out.push(Candidate {
                            key: ValueKey::Local {
                                class: class.clone(),
                                method: method.name.clone(),
                                name: decl.name.clone(),
                            },
                            token_class: c,
                            shape,
                            array: false,
                        });
                    }
                }
            }
            for f in k.fields.iter().filter(|f| !f.is_static && program.is_token_type(&f.ty)) {
                let field = FieldRef::new(class, &f.name);
                if taint.fields.contains(&field) {
                    continue;
                }
                let shape = types.field(&field);
                if let Some(c) = candidate(&shape, depth) {
                    out.push(Candidate {
                        key: ValueKey::Field(field),
                        token_class: c,
                        shape,
                        array: false,
                    });
                }
            }
        }
        if depth == 0 {
            out.extend(self.plan_arrays(program, types));
        }
        out
    }

    fn plan_arrays(&self, program: &Program, types: &SpecializedTypeMap) -> Vec<Candidate> {
        let boundary = array_boundaries(program, &self.classes);
        let mut keys = Vec::new();
        for class in &self.classes {
            let Some(k) = program.class(class) else {
                continue;
            };
            for method in k.methods.iter().filter(|m| m.has_body()) {
                for (i, decl) in method.locals.iter().enumerate() {
                    if program.is_token_array_type(&decl.ty) {
                        keys.push(ArrayKey::local(class, &method.name, LocalId(i as u32)));
                    }
                }
            }
            for f in &k.fields {
                if program.is_token_array_type(&f.ty) {
                    keys.push(ArrayKey::Field(FieldRef::new(class, &f.name)));
                }
            }
        }

        let mut seen: HashSet<ArrayKey> = HashSet::new();
        let mut out = Vec::new();
        for key in keys {
            if seen.contains(&key) {
                continue;
            }
            let members = types.aliases(&key);
            seen.extend(members.iter().cloned());
            let elements = types.elements(&key);
            if !(elements.is_specializable() && elements.ty.depth() == 0) {
                continue;
            }
            if members
                .iter()
                .any(|m| boundary.contains(m) || !self.array_member_ok(program, m))
            {
                continue;
            }
            let Some(elem_class) = elements.ty.token_class() else {
                continue;
            };
            for m in members {
                let key = match m {
                    ArrayKey::Local { class, method, local } => {
                        let Some(name) = program
                            .method(&class, &method)
                            .map(|mm| mm.local_name(local).to_string())
                        else {
                            continue;
                        };
                        ValueKey::Local { class, method, name }
                    }
                    ArrayKey::Field(f) => ValueKey::Field(f),
                };
                out.push(Candidate {
                    key,
                    token_class: elem_class.to_string(),
                    shape: elements.clone(),
                    array: true,
                });
            }
        }
        out
    }

    fn array_member_ok(&self, program: &Program, key: &ArrayKey) -> bool {
        match key {
            ArrayKey::Local { class, method, local } => {
                self.classes.contains(class)
                    && program.method(class, method).is_some_and(|m| {
                        local.index() < m.locals.len()
                            && !m.is_entry_bound(*local)
                            && !is_live_adapter(m, *local)
                    })
            }
            ArrayKey::Field(f) => {
                self.classes.contains(&f.class)
                    && program
                        .class(&f.class)
                        .and_then(|k| k.field(&f.name))
                        .is_some_and(|d| !d.is_static)
            }
        }
    }

    fn report_unsafe(&mut self, program: &Program, taint: &Taint) {
        let mut found = Vec::new();
        for class in &self.classes {
            let Some(k) = program.class(class) else {
                continue;
            };
            for method in k.methods.iter().filter(|m| m.has_body()) {
                for p in &method.params {
                    if program.is_token_type(method.local_type(*p)) {
                        found.push(Diagnostic::warning(
                            codes::W0303,
                            Location::method(class, &method.name),
                            format!("parameter `{}` stays boxed", method.local_name(*p)),
                        ));
                    }
                }
                for (c, m, l) in &taint.locals {
                    let here = c == class && *m == method.name;
                    if here && program.is_token_type(method.local_type(*l)) {
                        found.push(
                            Diagnostic::warning(
                                codes::W0303,
                                Location::method(class, &method.name),
                                format!(
                                    "`{}` holds a value computed at run time; it stays boxed",
                                    method.local_name(*l)
                                ),
                            )
                            .with_hint(DYNAMIC_HINT),
                        );
                    }
                }
            }
        }
        for f in &taint.fields {
            found.push(
                Diagnostic::warning(
                    codes::W0303,
                    Location::class(&f.class),
                    format!(
                        "field `{}` holds a value computed at run time; it stays boxed",
                        f.name
                    ),
                )
                .with_hint(DYNAMIC_HINT),
            );
        }
        found.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        for d in found {
            if self.reported.insert(d.to_string()) {
                self.report.diagnostics.push(d);
            }
        }
    }

    // ── Storage and rewriting ───────────────────────────────────────────────

    fn apply(&mut self, program: &mut Program, plan: Vec<Candidate>) -> Result<()> {
        let mut field_repls: HashMap<FieldRef, FieldRepl> = HashMap::new();
        let mut local_keys: HashMap<(String, String), Vec<(String, Replacement)>> = HashMap::new();
        for c in plan {
            let base = match &c.key {
                ValueKey::Local { name, .. } => name.clone(),
                ValueKey::Field(f) => f.name.clone(),
            };
            let fresh = replacement_for(program, &base, &c.token_class, &c.shape, c.array);
            self.report.replacements.register(c.key.clone(), fresh);
            let repl = self.report.replacements.lookup(&c.key)?.clone();
            match c.key {
                ValueKey::Field(f) => {
                    field_repls.insert(f.clone(), materialize_field(program, &f, &repl)?);
                }
                ValueKey::Local { class, method, name } => {
                    local_keys.entry((class, method)).or_default().push((name, repl));
                }
            }
        }

        for class in self.classes.clone() {
            let names: Vec<String> = match program.class(&class) {
                Some(k) => k
                    .methods
                    .iter()
                    .filter(|m| m.has_body())
                    .map(|m| m.name.clone())
                    .collect(),
                None => continue,
            };
            for name in names {
                let Some(mut method) = program.method(&class, &name).cloned() else {
                    continue;
                };
                let mut locals = HashMap::new();
                let mut entry = Vec::new();
                let keys = local_keys.remove(&(class.clone(), name.clone())).unwrap_or_default();
                for (local, repl) in keys {
                    let id = method.local_by_name(&local).ok_or_else(|| {
                        SpecializeError::internal(format!(
                            "local `{}` of `{}::{}` vanished",
                            local, class, name
                        ))
                    })?;
                    let r = materialize_local(&mut method, &repl);
                    if let Some(flag) = r.flag {
                        entry.push(Stmt::copy(flag, Constant::Bool(true)));
                    }
                    locals.insert(id, r);
                }
                if locals.is_empty() && field_repls.is_empty() {
                    continue;
                }
                let mut rw = Rewriter {
                    program,
                    fields: &field_repls,
                    locals,
                    method,
                };
                rw.rewrite()?;
                let Rewriter { mut method, .. } = rw;
                method.body.splice(0..0, entry);
                if let Some(k) = program.class_mut(&class) {
                    k.put_method(method);
                }
            }
        }
        Ok(())
    }
}

fn candidate(shape: &Shape, depth: usize) -> Option<String> {
    if shape.is_specializable() && shape.ty.depth() == depth {
        shape.ty.token_class().map(str::to_string)
    } else {
        None
    }
}

fn dynamic_taint(program: &Program, classes: &[String]) -> Taint {
    let mut taint = Taint::default();
    loop {
        let mut changed = false;
        for class in classes {
            let Some(k) = program.class(class) else {
                continue;
            };
            for method in k.methods.iter().filter(|m| m.has_body()) {
                for stmt in &method.body {
                    let Stmt::Assign { dest, value } = stmt else {
                        continue;
                    };
                    let tainted = match value {
                        Rvalue::Call(c) => program
                            .lookup_method(&c.method.class, &c.method.name)
                            .is_some_and(|(_, m)| m.is_dynamic()),
                        Rvalue::Use(Operand::Local(y)) | Rvalue::Cast(_, Operand::Local(y)) => {
                            taint.locals.contains(&(class.clone(), method.name.clone(), *y))
                        }
                        Rvalue::Load(Place::Field { field, .. } | Place::Static(field)) => {
                            taint.fields.contains(field)
                        }
                        _ => false,
                    };
                    if !tainted {
                        continue;
                    }
                    changed |= match dest {
                        Place::Local(l) => {
                            taint.locals.insert((class.clone(), method.name.clone(), *l))
                        }
                        Place::Field { field, .. } | Place::Static(field) => {
                            taint.fields.insert(field.clone())
                        }
                        Place::Elem { .. } => false,
                    };
                }
            }
        }
        if !changed {
            return taint;
        }
    }
}

/// Token locals that must keep their identity: receivers of a constructor
/// that is still a call, and operands of reference comparisons.
fn excluded_locals(program: &Program, classes: &[String]) -> HashSet<(String, String, LocalId)> {
    let mut out = HashSet::new();
    for class in classes {
        let Some(k) = program.class(class) else {
            continue;
        };
        for method in k.methods.iter().filter(|m| m.has_body()) {
            let mut add = |l: LocalId| {
                out.insert((class.clone(), method.name.clone(), l));
            };
            let is_token = |l: &LocalId| program.is_token_type(method.local_type(*l));
            for stmt in &method.body {
                match stmt {
                    Stmt::Invoke(c) if c.method.name == "<init>" => {
                        if let Some(r) = c.receiver {
                            add(r);
                        }
                    }
                    Stmt::If {
                        op: BinOp::Eq | BinOp::Ne,
                        lhs: Operand::Local(a),
                        rhs: Operand::Local(b),
                        ..
                    }
                    | Stmt::Assign {
                        value:
                            Rvalue::Binary(
                                BinOp::Eq | BinOp::Ne,
                                Operand::Local(a),
                                Operand::Local(b),
                            ),
                        ..
                    } if is_token(a) || is_token(b) => {
                        add(*a);
                        add(*b);
                    }
                    _ => {}
                }
            }
        }
    }
    out
}

/// Token-array locations whose storage is visible outside the analyzed code
/// or that receive `null` elements.
fn array_boundaries(program: &Program, classes: &[String]) -> HashSet<ArrayKey> {
    let mut out = HashSet::new();
    let tracked_field = |f: &FieldRef| {
        classes.contains(&f.class)
            && program
                .field_type(f)
                .is_some_and(|t| program.is_token_array_type(t))
    };
    for class in classes {
        let Some(k) = program.class(class) else {
            continue;
        };
        for method in k.methods.iter().filter(|m| m.has_body()) {
            let key = |l: LocalId| {
                program
                    .is_token_array_type(method.local_type(l))
                    .then(|| ArrayKey::local(class, &method.name, l))
            };
            let call_uses = |c: &Call, out: &mut HashSet<ArrayKey>| {
                let ops = c.args.iter().filter_map(Operand::as_local).chain(c.receiver);
                out.extend(ops.filter_map(key));
            };
            for stmt in &method.body {
                match stmt {
                    Stmt::Assign { dest, value } => {
                        let dest_key = match dest {
                            Place::Local(l) => key(*l),
                            Place::Field { field, .. } | Place::Static(field)
                                if tracked_field(field) =>
                            {
                                Some(ArrayKey::Field(field.clone()))
                            }
                            _ => None,
                        };
                        match value {
                            Rvalue::Use(Operand::Local(a))
                            | Rvalue::Cast(_, Operand::Local(a))
                            | Rvalue::Load(Place::Local(a)) => {
                                if let (Some(ka), None) = (key(*a), &dest_key) {
                                    out.insert(ka);
                                }
                            }
                            Rvalue::Use(Operand::Const(_)) | Rvalue::Cast(_, Operand::Const(_)) => {
                                if let Place::Elem { base, .. } = dest {
                                    if value_is_null(value) {
                                        out.extend(key(*base));
                                    }
                                }
                            }
                            Rvalue::NewArray(..) => {}
                            Rvalue::Load(Place::Field { field, .. } | Place::Static(field)) => {
                                if let Some(kd) = &dest_key {
                                    if !tracked_field(field) {
                                        out.insert(kd.clone());
                                    }
                                }
                            }
                            Rvalue::Call(c) => {
                                call_uses(c, &mut out);
                                if let Some(kd) = dest_key {
                                    out.insert(kd);
                                }
                            }
                            Rvalue::Binary(_, Operand::Local(a), Operand::Local(b)) => {
                                if let (Some(ka), Some(kb)) = (key(*a), key(*b)) {
                                    out.insert(ka);
                                    out.insert(kb);
                                }
                            }
                            _ => {
                                if let Some(kd) = dest_key {
                                    out.insert(kd);
                                }
                            }
                        }
                    }
                    Stmt::Invoke(c) => call_uses(c, &mut out),
                    Stmt::Return(Some(Operand::Local(a))) => out.extend(key(*a)),
                    Stmt::If {
                        lhs: Operand::Local(a),
                        rhs: Operand::Local(b),
                        ..
                    } => {
                        if let (Some(ka), Some(kb)) = (key(*a), key(*b)) {
                            out.insert(ka);
                            out.insert(kb);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    out
}

fn value_is_null(value: &Rvalue) -> bool {
    matches!(
        value,
        Rvalue::Use(Operand::Const(Constant::Null))
            | Rvalue::Cast(_, Operand::Const(Constant::Null))
    )
}

// ── Adapters ────────────────────────────────────────────────────────────────

/// `box`, `unbox`, or either with the `$n` suffix of a repeated name.
fn is_adapter_name(name: &str) -> bool {
    [BOX_TEMP, UNBOX_TEMP].iter().any(|base| match name.strip_prefix(base) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('$')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    })
}

/// Whether `l` is an adapter temporary that still converts between replaced
/// storage and a boxed boundary. Replacing such a local would only move the
/// conversion into a fresh adapter.
fn is_live_adapter(method: &Method, l: LocalId) -> bool {
    if !is_adapter_name(method.local_name(l)) {
        return false;
    }
    method.body.iter().any(|stmt| {
        let boxed_def = match stmt {
            Stmt::Assign {
                dest: Place::Local(d),
                value,
            } if *d == l => !matches!(value, Rvalue::New(_)) && !value_is_null(value),
            _ => false,
        };
        boxed_def || (stmt.used_locals().contains(&l) && !is_unboxed_use(stmt, l))
    })
}

/// Whether every use of `l` in `stmt` has an unboxed rewrite: component
/// reads and writes, null tests, `instanceof`, copies into locals, and the
/// receiver of a constructor.
fn is_unboxed_use(stmt: &Stmt, l: LocalId) -> bool {
    let is_l = |op: &Operand| *op == Operand::Local(l);
    let null_test = |op: BinOp, a: &Operand, b: &Operand| {
        matches!(op, BinOp::Eq | BinOp::Ne)
            && ((is_l(a) && b.is_null()) || (a.is_null() && is_l(b)))
    };
    match stmt {
        Stmt::Assign { dest, value } => {
            if let Place::Elem { base, index } = dest {
                if *base == l || is_l(index) {
                    return false;
                }
            }
            if !value.used_locals().contains(&l) {
                return true;
            }
            match value {
                Rvalue::Use(_) | Rvalue::Cast(..) => matches!(dest, Place::Local(_)),
                Rvalue::Load(Place::Field { base, .. }) => *base == l,
                Rvalue::Binary(op, a, b) => null_test(*op, a, b),
                Rvalue::InstanceOf(..) => true,
                _ => false,
            }
        }
        Stmt::Invoke(c) => {
            c.method.name == "<init>" && c.receiver == Some(l) && !c.args.iter().any(is_l)
        }
        Stmt::If { op, lhs, rhs, .. } => null_test(*op, lhs, rhs),
        _ => false,
    }
}

// ── Materialization ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LocalRepl {
    class: String,
    fields: Vec<FieldRef>,
    parts: Vec<LocalId>,
    types: Vec<IrType>,
    flag: Option<LocalId>,
    array: bool,
}

#[derive(Debug, Clone)]
struct FieldRepl {
    class: String,
    fields: Vec<FieldRef>,
    parts: Vec<FieldRef>,
    types: Vec<IrType>,
    flag: Option<FieldRef>,
    array: bool,
}

fn ensure_local(method: &mut Method, name: &str, ty: &IrType) -> LocalId {
    match method.local_by_name(name) {
        Some(l) if method.local_type(l) == ty && !method.is_entry_bound(l) => l,
        _ => method.add_local(name, ty.clone()),
    }
}

fn materialize_local(method: &mut Method, repl: &Replacement) -> LocalRepl {
    let parts = repl
        .components
        .iter()
        .map(|c| ensure_local(method, &c.name, &c.ty))
        .collect();
    let flag = repl
        .is_null
        .as_ref()
        .map(|n| ensure_local(method, n, &IrType::Bool));
    LocalRepl {
        class: repl.token_class.clone(),
        fields: repl.components.iter().map(|c| c.field.clone()).collect(),
        parts,
        types: repl.components.iter().map(|c| c.ty.clone()).collect(),
        flag,
        array: repl.array,
    }
}

fn ensure_field(program: &mut Program, class: &str, name: &str, ty: &IrType) -> Result<FieldRef> {
    let k = program
        .class_mut(class)
        .ok_or_else(|| SpecializeError::internal(format!("class `{}` vanished", class)))?;
    match k.field(name) {
        Some(f) if f.ty == *ty => {}
        Some(_) => {
            return Err(SpecializeError::configuration(
                class,
                format!("field `{}` already exists with another type", name),
            ))
        }
        None => k.add_field(name, ty.clone()),
    }
    Ok(FieldRef::new(class, name))
}

fn materialize_field(
    program: &mut Program,
    field: &FieldRef,
    repl: &Replacement,
) -> Result<FieldRepl> {
    let parts = repl
        .components
        .iter()
        .map(|c| ensure_field(program, &field.class, &c.name, &c.ty))
        .collect::<Result<Vec<_>>>()?;
    let flag = match &repl.is_null {
        Some(n) => {
            let f = ensure_field(program, &field.class, n, &IrType::Bool)?;
            init_flag(program, &f)?;
            Some(f)
        }
        None => None,
    };
    Ok(FieldRepl {
        class: repl.token_class.clone(),
        fields: repl.components.iter().map(|c| c.field.clone()).collect(),
        parts,
        types: repl.components.iter().map(|c| c.ty.clone()).collect(),
        flag,
        array: repl.array,
    })
}

/// Start the class's own `<init>` by marking the flag field null.
fn init_flag(program: &mut Program, flag: &FieldRef) -> Result<()> {
    append_to_init(program, &flag.class, |_, _| Ok(()))?;
    let init = program
        .method_mut(&flag.class, "<init>")
        .ok_or_else(|| SpecializeError::internal(format!("`{}` has no constructor", flag.class)))?;
    let this = init
        .this()
        .ok_or_else(|| SpecializeError::internal("constructor without `this`"))?;
    let stmt = Stmt::store_field(this, flag.clone(), Constant::Bool(true));
    if !init.body.contains(&stmt) {
        init.body.insert(0, stmt);
    }
    Ok(())
}

// ── Rewriting ───────────────────────────────────────────────────────────────

enum Flag {
    None,
    At(Place),
    /// Never null (array elements).
    False,
}

/// Where the components of one replaced value live at a statement.
struct View {
    class: String,
    fields: Vec<FieldRef>,
    types: Vec<IrType>,
    parts: Vec<Place>,
    flag: Flag,
    array: bool,
}

struct Rewriter<'a> {
    program: &'a Program,
    fields: &'a HashMap<FieldRef, FieldRepl>,
    locals: HashMap<LocalId, LocalRepl>,
    method: Method,
}

fn read(place: &Place) -> Rvalue {
    match place {
        Place::Local(l) => Rvalue::Use(Operand::Local(*l)),
        p => Rvalue::Load(p.clone()),
    }
}

fn assign(dest: &Place, value: Rvalue) -> Stmt {
    Stmt::Assign {
        dest: dest.clone(),
        value,
    }
}

fn null() -> Rvalue {
    Rvalue::Use(Operand::Const(Constant::Null))
}

impl Rewriter<'_> {
    fn rewrite(&mut self) -> Result<()> {
        let body = std::mem::take(&mut self.method.body);
        let mut out = Vec::with_capacity(body.len());
        for stmt in body {
            self.stmt(stmt, &mut out)?;
        }
        self.method.body = out;
        Ok(())
    }

    fn temp(&mut self, name: &str, ty: IrType) -> LocalId {
        self.method.add_local(name, ty)
    }

    fn local_view(&self, l: LocalId) -> Option<View> {
        let r = self.locals.get(&l)?;
        Some(View {
            class: r.class.clone(),
            fields: r.fields.clone(),
            types: r.types.clone(),
            parts: r.parts.iter().map(|p| Place::Local(*p)).collect(),
            flag: r.flag.map_or(Flag::None, |f| Flag::At(Place::Local(f))),
            array: r.array,
        })
    }

    fn field_view(&self, base: Option<LocalId>, field: &FieldRef) -> Option<View> {
        let r = self.fields.get(field)?;
        let at = |f: &FieldRef| match base {
            Some(b) => Place::Field {
                base: b,
                field: f.clone(),
            },
            None => Place::Static(f.clone()),
        };
        Some(View {
            class: r.class.clone(),
            fields: r.fields.clone(),
            types: r.types.clone(),
            parts: r.parts.iter().map(at).collect(),
            flag: r.flag.as_ref().map_or(Flag::None, |f| Flag::At(at(f))),
            array: r.array,
        })
    }

    fn elem_view(&self, base: LocalId, index: &Operand) -> Option<View> {
        let r = self.locals.get(&base).filter(|r| r.array)?;
        Some(View {
            class: r.class.clone(),
            fields: r.fields.clone(),
            types: r
                .types
                .iter()
                .map(|t| t.element().cloned().unwrap_or(IrType::Void))
                .collect(),
            parts: r
                .parts
                .iter()
                .map(|p| Place::Elem {
                    base: *p,
                    index: index.clone(),
                })
                .collect(),
            flag: Flag::False,
            array: false,
        })
    }

    /// View of the replaced value a place denotes.
    fn place_view(&self, place: &Place) -> Option<View> {
        match place {
            Place::Local(l) => self.local_view(*l),
            Place::Field { base, field } => self.field_view(Some(*base), field),
            Place::Static(field) => self.field_view(None, field),
            Place::Elem { base, index } => self.elem_view(*base, index),
        }
    }

    /// View of the replaced value an rvalue reads, if it only moves one.
    fn source_view(&self, value: &Rvalue) -> Option<View> {
        match value {
            Rvalue::Use(Operand::Local(y)) | Rvalue::Cast(_, Operand::Local(y)) => {
                self.local_view(*y)
            }
            Rvalue::Load(p) => self.place_view(p),
            _ => None,
        }
    }

    /// Component `field` of replaced token `base`, for `base.K::c` accesses.
    fn component(&self, base: LocalId, field: &FieldRef) -> Option<(LocalId, IrType)> {
        let r = self.locals.get(&base).filter(|r| !r.array)?;
        let i = r.fields.iter().position(|f| f.name == field.name)?;
        Some((r.parts[i], r.types[i].clone()))
    }

    fn to_operand(&mut self, place: &Place, ty: &IrType, out: &mut Vec<Stmt>) -> Operand {
        match place {
            Place::Local(l) => Operand::Local(*l),
            p => {
                let t = self.temp("ld", ty.clone());
                out.push(Stmt::assign(t, Rvalue::Load(p.clone())));
                Operand::Local(t)
            }
        }
    }

    fn copy(&mut self, dest: &View, src: &View, out: &mut Vec<Stmt>) {
        for (d, s) in dest.parts.iter().zip(&src.parts) {
            out.push(assign(d, read(s)));
        }
        if let Flag::At(d) = &dest.flag {
            let value = match &src.flag {
                Flag::At(s) => read(s),
                Flag::False | Flag::None => Rvalue::Use(Operand::Const(Constant::Bool(false))),
            };
            out.push(assign(d, value));
        }
    }

    /// Build a boxed token from `src`; returns the local holding it.
    fn box_view(&mut self, src: &View, out: &mut Vec<Stmt>) -> Result<LocalId> {
        if src.array {
            return Err(SpecializeError::internal(format!(
                "array of `{}` crosses a boxed boundary in `{}`",
                src.class, self.method.name
            )));
        }
        let t = self.temp(BOX_TEMP, IrType::object(&src.class));
        self.box_into(src, t, out);
        Ok(t)
    }

    /// Build a boxed token from `src` directly in `t`.
    fn box_into(&mut self, src: &View, t: LocalId, out: &mut Vec<Stmt>) {
        out.push(Stmt::assign(t, null()));
        let skip = match &src.flag {
            Flag::At(p) => {
                let f = self.to_operand(p, &IrType::Bool, out);
                let l = self.method.fresh_label();
                out.push(Stmt::If {
                    op: BinOp::Ne,
                    lhs: f,
                    rhs: Operand::Const(Constant::Bool(false)),
                    target: l,
                });
                Some(l)
            }
            Flag::False | Flag::None => None,
        };
        out.push(Stmt::assign(t, Rvalue::New(src.class.clone())));
        let mut args = Vec::new();
        for (p, ty) in src.parts.iter().zip(&src.types) {
            args.push(self.to_operand(p, ty, out));
        }
        out.push(Stmt::Invoke(Call::special_call(t, &src.class, "<init>", args)));
        if let Some(l) = skip {
            out.push(Stmt::Label(l));
        }
    }

    /// Store the components of boxed `token` into `dest`.
    fn unbox_into(&mut self, dest: &View, token: LocalId, out: &mut Vec<Stmt>) -> Result<()> {
        if dest.array {
            return Err(SpecializeError::internal(format!(
                "array of `{}` crosses a boxed boundary in `{}`",
                dest.class, self.method.name
            )));
        }
        let skip = match &dest.flag {
            Flag::At(p) => {
                let n = self.temp("isnull", IrType::Bool);
                out.push(Stmt::assign(
                    n,
                    Rvalue::Binary(
                        BinOp::Eq,
                        Operand::Local(token),
                        Operand::Const(Constant::Null),
                    ),
                ));
                out.push(assign(p, Rvalue::Use(Operand::Local(n))));
                let l = self.method.fresh_label();
                out.push(Stmt::If {
                    op: BinOp::Ne,
                    lhs: Operand::Local(n),
                    rhs: Operand::Const(Constant::Bool(false)),
                    target: l,
                });
                Some(l)
            }
            Flag::False | Flag::None => None,
        };
        for (p, field) in dest.parts.iter().zip(&dest.fields) {
            out.push(assign(
                p,
                Rvalue::Load(Place::Field {
                    base: token,
                    field: field.clone(),
                }),
            ));
        }
        if let Some(l) = skip {
            out.push(Stmt::Label(l));
        }
        Ok(())
    }

    /// Replace every replaced token among the operands of `stmt` by a boxed
    /// copy.
    fn box_operands(&mut self, stmt: &mut Stmt, out: &mut Vec<Stmt>) -> Result<()> {
        let mut found: Vec<LocalId> = Vec::new();
        {
            let locals = &self.locals;
            stmt.clone().for_each_operand_mut(&mut |op| {
                if let Operand::Local(l) = op {
                    if locals.contains_key(l) && !found.contains(l) {
                        found.push(*l);
                    }
                }
            });
        }
        if let Some(r) = stmt.call().and_then(|c| c.receiver) {
            if self.locals.contains_key(&r) && !found.contains(&r) {
                found.push(r);
            }
        }
        let mut boxed = HashMap::new();
        for l in found {
            let view = self
                .local_view(l)
                .ok_or_else(|| SpecializeError::internal("replacement lookup failed"))?;
            boxed.insert(l, self.box_view(&view, out)?);
        }
        if boxed.is_empty() {
            return Ok(());
        }
        stmt.for_each_operand_mut(&mut |op| {
            if let Operand::Local(l) = op {
                if let Some(t) = boxed.get(l) {
                    *l = *t;
                }
            }
        });
        if let Some(call) = stmt.call_mut() {
            if let Some(t) = call.receiver.and_then(|r| boxed.get(&r)) {
                call.receiver = Some(*t);
            }
        }
        Ok(())
    }

    /// `(local, is_eq)` when `a op b` compares a replaced value with null.
    fn null_test(&self, op: BinOp, a: &Operand, b: &Operand) -> Option<(LocalId, bool)> {
        if !matches!(op, BinOp::Eq | BinOp::Ne) {
            return None;
        }
        match (a, b) {
            (Operand::Local(x), Operand::Const(Constant::Null))
            | (Operand::Const(Constant::Null), Operand::Local(x))
                if self.locals.contains_key(x) =>
            {
                Some((*x, op == BinOp::Eq))
            }
            _ => None,
        }
    }

    /// Operands testing the null-ness of replaced `x`: `(lhs, op, rhs)`
    /// true exactly when `x == null` equals `is_eq`.
    fn null_check(&self, x: LocalId, is_eq: bool) -> (Operand, BinOp, Operand) {
        let r = &self.locals[&x];
        match (r.flag, r.parts.first()) {
            (Some(f), _) => (
                Operand::Local(f),
                BinOp::Eq,
                Operand::Const(Constant::Bool(is_eq)),
            ),
            (None, Some(p)) => (
                Operand::Local(*p),
                if is_eq { BinOp::Eq } else { BinOp::Ne },
                Operand::Const(Constant::Null),
            ),
            (None, None) => (
                Operand::Const(Constant::Bool(false)),
                BinOp::Eq,
                Operand::Const(Constant::Bool(!is_eq)),
            ),
        }
    }

    fn stmt(&mut self, stmt: Stmt, out: &mut Vec<Stmt>) -> Result<()> {
        match stmt {
            Stmt::Assign { dest, value } => self.assign(dest, value, out),
            Stmt::If {
                op,
                lhs,
                rhs,
                target,
            } => {
                if let Some((x, is_eq)) = self.null_test(op, &lhs, &rhs) {
                    let (lhs, op, rhs) = self.null_check(x, is_eq);
                    out.push(Stmt::If {
                        op,
                        lhs,
                        rhs,
                        target,
                    });
                    return Ok(());
                }
                let mut s = Stmt::If {
                    op,
                    lhs,
                    rhs,
                    target,
                };
                self.box_operands(&mut s, out)?;
                out.push(s);
                Ok(())
            }
            Stmt::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } if self.locals.contains_key(&src) || self.locals.contains_key(&dst) => {
                let (Some(a), Some(b)) = (self.locals.get(&src), self.locals.get(&dst)) else {
                    return Err(SpecializeError::internal(format!(
                        "arraycopy between replaced and boxed arrays in `{}`",
                        self.method.name
                    )));
                };
                for (s, d) in a.parts.iter().zip(&b.parts) {
                    out.push(Stmt::ArrayCopy {
                        src: *s,
                        src_pos: src_pos.clone(),
                        dst: *d,
                        dst_pos: dst_pos.clone(),
                        len: len.clone(),
                    });
                }
                Ok(())
            }
            mut other => {
                self.box_operands(&mut other, out)?;
                out.push(other);
                Ok(())
            }
        }
    }

    fn assign(&mut self, dest: Place, value: Rvalue, out: &mut Vec<Stmt>) -> Result<()> {
        // `t.K::c = v` on a replaced token writes the component.
        if let Place::Field { base, field } = &dest {
            if let Some((part, _)) = self.component(*base, field) {
                let mut s = Stmt::Assign {
                    dest: Place::Local(part),
                    value,
                };
                self.box_operands(&mut s, out)?;
                out.push(s);
                return Ok(());
            }
        }

        if let Some(dv) = self.place_view(&dest) {
            return self.assign_replaced(&dest, &dv, value, out);
        }

        let value = match value {
            Rvalue::Load(Place::Field { base, field })
                if self.component(base, &field).is_some() =>
            {
                let (part, _) = self
                    .component(base, &field)
                    .ok_or_else(|| SpecializeError::internal("component lookup failed"))?;
                Rvalue::Use(Operand::Local(part))
            }
            Rvalue::Length(a) if self.locals.get(&a).is_some_and(|r| r.array) => {
                let first = self.locals[&a].parts.first().copied().ok_or_else(|| {
                    SpecializeError::internal(format!(
                        "array `{}` has no components",
                        self.method.local_name(a)
                    ))
                })?;
                Rvalue::Length(first)
            }
            Rvalue::Binary(op, a, b) if self.null_test(op, &a, &b).is_some() => {
                let (x, is_eq) = self
                    .null_test(op, &a, &b)
                    .ok_or_else(|| SpecializeError::internal("null test lookup failed"))?;
                let (lhs, op, rhs) = self.null_check(x, is_eq);
                Rvalue::Binary(op, lhs, rhs)
            }
            Rvalue::InstanceOf(c, Operand::Local(x))
                if self.locals.get(&x).is_some_and(|r| !r.array) =>
            {
                let r = &self.locals[&x];
                if self.program.is_subclass_of(&r.class, &c) {
                    let flag = r.flag.map_or(Operand::Const(Constant::Bool(false)), Operand::Local);
                    Rvalue::Binary(BinOp::Eq, flag, Operand::Const(Constant::Bool(false)))
                } else {
                    Rvalue::Use(Operand::Const(Constant::Bool(false)))
                }
            }
            value => {
                if let Some(sv) = self.source_view(&value) {
                    // A plain local receives the box itself and may be
                    // replaced in a later round.
                    if let Place::Local(d) = dest {
                        if !sv.array {
                            self.box_into(&sv, d, out);
                            return Ok(());
                        }
                    }
                    let t = self.box_view(&sv, out)?;
                    let boxed = match value {
                        Rvalue::Cast(ty, _) => Rvalue::Cast(ty, Operand::Local(t)),
                        _ => Rvalue::Use(Operand::Local(t)),
                    };
                    out.push(assign(&dest, boxed));
                    return Ok(());
                }
                value
            }
        };
        let mut s = Stmt::Assign { dest, value };
        self.box_operands(&mut s, out)?;
        out.push(s);
        Ok(())
    }

    fn assign_replaced(
        &mut self,
        dest: &Place,
        dv: &View,
        value: Rvalue,
        out: &mut Vec<Stmt>,
    ) -> Result<()> {
        if let Some(sv) = self.source_view(&value) {
            if sv.array != dv.array {
                return Err(SpecializeError::internal(format!(
                    "array and token storage mixed in `{}`",
                    self.method.name
                )));
            }
            self.copy(dv, &sv, out);
            return Ok(());
        }
        match value {
            v if value_is_null(&v) => {
                if dv.array {
                    for p in &dv.parts {
                        out.push(assign(p, null()));
                    }
                } else if let Flag::At(f) = &dv.flag {
                    out.push(assign(f, Rvalue::Use(Operand::Const(Constant::Bool(true)))));
                }
                Ok(())
            }
            Rvalue::New(_) if !dv.array => {
                if let Flag::At(f) = &dv.flag {
                    out.push(assign(f, Rvalue::Use(Operand::Const(Constant::Bool(false)))));
                }
                Ok(())
            }
            Rvalue::NewArray(_, n) if dv.array => {
                for (p, ty) in dv.parts.iter().zip(&dv.types) {
                    let elem = ty.element().cloned().unwrap_or(IrType::Void);
                    out.push(assign(p, Rvalue::NewArray(elem, n.clone())));
                }
                Ok(())
            }
            Rvalue::Load(Place::Static(f))
                if f.class == BOOLEAN_TOKEN_CLASS
                    && (f.name == "TRUE" || f.name == "FALSE")
                    && !dv.array
                    && dv.parts.len() == 1 =>
            {
                out.push(assign(
                    &dv.parts[0],
                    Rvalue::Use(Operand::Const(Constant::Bool(f.name == "TRUE"))),
                ));
                if let Flag::At(flag) = &dv.flag {
                    out.push(assign(flag, Rvalue::Use(Operand::Const(Constant::Bool(false)))));
                }
                Ok(())
            }
            value => {
                if dv.array {
                    return Err(SpecializeError::internal(format!(
                        "replaced array `{}` assigned from a boxed source",
                        crate::ir::Method::display_stmt(
                            &self.method,
                            &Stmt::Assign {
                                dest: dest.clone(),
                                value: value.clone()
                            }
                        )
                    )));
                }
                let t = self.temp(UNBOX_TEMP, IrType::object(&dv.class));
                let mut s = Stmt::assign(t, value);
                self.box_operands(&mut s, out)?;
                out.push(s);
                self.unbox_into(dv, t, out)
            }
        }
    }
}

// ── Certificate ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for unboxing postconditions (U1).
#[derive(Debug, Clone)]
pub struct UnboxCert {
    /// U1: every replaced field has its components and flag declared.
    pub u1_storage_declared: bool,
}

impl crate::pass::StageCert for UnboxCert {
    fn all_pass(&self) -> bool {
        self.u1_storage_declared
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![("U1_storage_declared", self.u1_storage_declared)]
    }
}

pub fn verify_unbox(program: &Program, replacements: &ReplacementMap) -> UnboxCert {
    let u1 = replacements.entries().into_iter().all(|(key, r)| match key {
        ValueKey::Field(f) => {
            let declared = |name: &str| program.lookup_field(&f.class, name).is_some();
            r.components.iter().all(|c| declared(&c.name))
                && r.is_null.as_deref().map_or(true, declared)
        }
        ValueKey::Local { .. } => true,
    });
    UnboxCert {
        u1_storage_declared: u1,
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

    fn run(p: &mut Program) -> UnboxReport {
        let options = UnboxOptions {
            max_depth: 4,
            max_rounds: 20,
        };
        unbox(p, &["A".to_string()], &TypeContext::default(), options).unwrap()
    }

    #[test]
    fn scalar_tokens_become_fields_and_locals() {
        let mut p = program(
            "class A extends Actor {
                field acc: Token;

                method <init>() {
                    local a: DoubleToken;
                    a = new DoubleToken;
                    specialinvoke a.<init>(1.5);
                    this.acc = a;
                    return;
                }

                method step(): double {
                    local x: Token;
                    local y: Token;
                    local z: Token;
                    local s: ScalarToken;
                    local d: double;
                    x = this.acc;
                    y = new DoubleToken;
                    specialinvoke y.DoubleToken::<init>(2.0);
                    z = virtualinvoke x.add(y);
                    this.acc = z;
                    s = (ScalarToken) z;
                    d = virtualinvoke s.doubleValue();
                    return d;
                }
            }",
        );
        let report = run(&mut p);
        assert!(report.unboxed >= 3, "{report:?}");
        let a = p.class("A").unwrap();
        assert_eq!(a.field("acc$_value").unwrap().ty, IrType::Double);
        assert_eq!(a.field("acc$isNull").unwrap().ty, IrType::Bool);
        let step = a.method("step").unwrap().to_string();
        assert!(!step.contains("invoke"), "{step}");
        assert!(!step.contains("new "), "{step}");
        assert!(step.contains("this.acc$_value"), "{step}");
        let init = a.method("<init>").unwrap().to_string();
        let flag = init.find("this.acc$isNull = true;").expect("flag initialized");
        let value = init.find("this.acc$_value = ").expect("value stored");
        assert!(flag < value, "{init}");
        for body in [&init, &step] {
            assert!(!body.contains("this.acc = "), "{body}");
            assert!(!body.contains("nop"), "{body}");
        }
    }

    /// A token boxed into an adapter and stored into a field: what a round
    /// leaves behind while the constructor is still a call.
    const ADAPTERS: &str = "class A extends Actor {
        field acc: Token;
        field out: IOPort;

        method <init>() {
            local box: DoubleToken;
            box = null;
            box = new DoubleToken;
            specialinvoke box.<init>(1.5);
            this.acc = box;
            return;
        }

        method emit() {
            local p: IOPort;
            local t: Token;
            local k: DoubleToken;
            local r: Token;
            t = this.acc;
            k = new DoubleToken;
            specialinvoke k.<init>(2.0);
            r = virtualinvoke t.add(k);
            p = this.out;
            virtualinvoke p.send(0, r);
            return;
        }
    }";

    #[test]
    fn adapters_are_replaced_once_they_stop_adapting() {
        let mut p = program(ADAPTERS);
        run(&mut p);
        let init = p.method("A", "<init>").unwrap().to_string();
        assert!(!init.contains("new "), "{init}");
        assert!(!init.contains("invoke"), "{init}");
        assert!(!init.contains("._value"), "{init}");
        assert!(init.contains("this.acc$_value = "), "{init}");
        // The adapter feeding the port stays a token.
        let emit = p.method("A", "emit").unwrap().to_string();
        assert!(emit.contains("virtualinvoke p.send(0, box);"), "{emit}");
    }

    #[test]
    fn a_second_run_changes_nothing() {
        for src in [ADAPTERS, ARRAYS] {
            let mut p = program(src);
            let first = run(&mut p);
            assert!(first.unboxed > 0);
            let once = p.clone();
            let second = run(&mut p);
            assert_eq!(second.unboxed, 0);
            assert_eq!(second.inlined, 0);
            assert_eq!(p, once);
        }
    }

    #[test]
    fn storage_is_created_once() {
        let mut p = program(
            "class A extends Actor {
                field acc: Token;

                method <init>() {
                    return;
                }
            }",
        );
        let field = FieldRef::new("A", "acc");
        let key = ValueKey::Field(field.clone());
        let shape = Shape::exact(crate::lattice::TokenType::Double);
        let mut map = ReplacementMap::default();
        for _ in 0..2 {
            map.register(key.clone(), replacement_for(&p, "acc", "DoubleToken", &shape, false));
        }
        assert_eq!(map.len(), 1);
        let repl = map.lookup(&key).unwrap().clone();

        materialize_field(&mut p, &field, &repl).unwrap();
        let once = p.clone();
        materialize_field(&mut p, &field, &repl).unwrap();
        assert_eq!(p, once);

        let a = p.class("A").unwrap();
        for name in ["acc$_value", "acc$isNull"] {
            assert_eq!(a.fields.iter().filter(|f| f.name == name).count(), 1, "{name}");
        }
        let init = a.method("<init>").unwrap().to_string();
        assert_eq!(init.matches("this.acc$isNull = true;").count(), 1, "{init}");
    }

    #[test]
    fn adapter_names() {
        for name in ["box", "unbox", "box$1", "unbox$12"] {
            assert!(is_adapter_name(name), "{name}");
        }
        for name in ["boxes", "box$", "box$_value", "unbox$1$isNull", "inbox"] {
            assert!(!is_adapter_name(name), "{name}");
        }
    }

    #[test]
    fn boundaries_get_adapters() {
        let mut p = program(
            "class A extends Actor {
                field out: IOPort;

                method emit(t: Token) {
                    local p: IOPort;
                    local k: IntToken;
                    local r: Token;
                    k = new IntToken;
                    specialinvoke k.<init>(3);
                    r = virtualinvoke k.add(k);
                    p = this.out;
                    virtualinvoke p.send(0, r);
                    return;
                }
            }",
        );
        let report = run(&mut p);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::W0303) && d.message.contains("`t`")));
        let emit = p.method("A", "emit").unwrap().to_string();
        assert!(emit.contains("box = new IntToken;"), "{emit}");
        assert!(emit.contains("virtualinvoke p.send(0, box);"), "{emit}");
        assert!(!emit.contains("add("), "{emit}");
    }

    #[test]
    fn dynamic_values_stay_boxed() {
        let mut p = program(
            "class A extends Actor {
                method f(): Token {
                    local t: Token;
                    local u: Token;
                    t = staticinvoke Expression::evaluate(this, \"1\");
                    u = t;
                    return u;
                }
            }",
        );
        let report = run(&mut p);
        assert_eq!(report.unboxed, 0);
        let names: Vec<&str> = report
            .diagnostics
            .iter()
            .filter(|d| d.code == Some(codes::W0303))
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(names.len(), 2, "{names:?}");
    }

    const ARRAYS: &str = "class A extends Actor {
                field taps: ArrayToken;

                method <init>() {
                    local e: DoubleToken[];
                    local d: DoubleToken;
                    local t: ArrayToken;
                    e = newarray DoubleToken[2];
                    d = new DoubleToken;
                    specialinvoke d.<init>(0.5);
                    e[0] = d;
                    d = new DoubleToken;
                    specialinvoke d.<init>(0.25);
                    e[1] = d;
                    t = new ArrayToken;
                    specialinvoke t.<init>(e);
                    this.taps = t;
                    return;
                }

                method sum(): double {
                    local t: ArrayToken;
                    local n: int;
                    local i: int;
                    local x: Token;
                    local s: ScalarToken;
                    local v: double;
                    local acc: double;
                    t = this.taps;
                    n = virtualinvoke t.length();
                    acc = 0.0;
                    i = 0;
                loop:
                    if i >= n goto done;
                    x = virtualinvoke t.getElement(i);
                    s = (ScalarToken) x;
                    v = virtualinvoke s.doubleValue();
                    acc = acc + v;
                    i = i + 1;
                    goto loop;
                done:
                    return acc;
                }
            }";

    #[test]
    fn token_arrays_become_native_arrays() {
        let mut p = program(ARRAYS);
        let report = run(&mut p);
        assert!(report.unboxed > 0);
        let a = p.class("A").unwrap();
        assert_eq!(
            a.field("taps$_value$_value").unwrap().ty,
            IrType::array(IrType::Double)
        );
        assert!(a.has_field("taps$isNull"));
        let sum = a.method("sum").unwrap().to_string();
        assert!(!sum.contains("invoke"), "{sum}");
        assert!(sum.contains("lengthof"), "{sum}");
        assert!(sum.contains("this.taps$_value$_value"), "{sum}");
    }
}
