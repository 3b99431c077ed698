// callsite.rs — Call-site resolution and token-method inlining
//
// Two rewrites over the generated classes:
//
// - Accessors. `getAttribute("n")`/`getPort("n")` on an entity become reads
//   of the entity's attribute or port field. Calls on a value loaded from an
//   attribute field then become slot traffic: `getToken` reads the attribute's
//   slot (or evaluates its expression text when the value is dynamic),
//   `setToken(t)` writes the slot and then notifies the owner with
//   `attributeChanged`, and `getName`/`getExpression` become literals.
// - Notifications. An `attributeChanged` call on a known entity is inlined
//   when its target neither writes attributes nor notifies. Identity tests
//   (`==`, `!=`) between named objects loaded from the same base then fold
//   to constants, so the branches for other attributes disappear.
// - Token calls. A call on a token receiver whose target is unique, either
//   because the receiver's specialized shape is exact or because a single
//   implementation exists below its declared class, is inlined.
//
// Inlining runs in rounds: every round re-analyzes types, inlines every
// resolvable site and cleans up the changed methods. Rounds stop when
// nothing was inlined or the round bound is reached (`W0302`).
//
// Preconditions: `resolve` has run; `bindings` match `program`.
// Postconditions: method signatures are unchanged.
// Failure modes: inlining a site whose callee vanished →
//   `SpecializeError::InternalConsistency`.
// Side effects: rewrites method bodies.

use std::collections::HashSet;

use tracing::debug;

use crate::cfg::{defs_of, traced_field};
use crate::cleanup::cleanup_method;
use crate::diag::{codes, Diagnostic, Location};
use crate::error::{Result, SpecializeError};
use crate::expr::Value;
use crate::id::{AttrId, EntityId, LocalId};
use crate::inline::inline_call;
use crate::ir::{
    BinOp, Call, CallKind, Constant, FieldRef, IrType, Method, Operand, Place, Program, Rvalue,
    Stmt,
};
use crate::lattice::TokenType;
use crate::library::EXPRESSION_CLASS;
use crate::model::{ActorGraph, AttrOwner};
use crate::resolve::{AttributeValue, ConstantValueMap};
use crate::scaffold::Bindings;
use crate::typeflow::{analyze, SpecializedTypeMap, TypeContext};

/// Outcome of call-site resolution.
#[derive(Debug, Default)]
pub struct CallSiteReport {
    /// Accessor and lookup calls rewritten to field traffic or literals.
    pub accessors: usize,
    /// `attributeChanged` call sites inlined.
    pub notifications: usize,
    /// Identity tests between named objects folded to constants.
    pub identities: usize,
    /// Token call sites inlined.
    pub inlined: usize,
    pub rounds: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// Resolve accessors, then inline token calls to a fixed point or until
/// `max_rounds` rounds have run.
pub fn resolve_call_sites(
    program: &mut Program,
    graph: &ActorGraph,
    bindings: &Bindings,
    values: &ConstantValueMap,
    ctx: &TypeContext,
    max_rounds: usize,
) -> Result<CallSiteReport> {
    let classes = bindings.generated_classes().to_vec();
    let mut report = CallSiteReport {
        accessors: rewrite_accessors(program, graph, bindings, values),
        ..CallSiteReport::default()
    };
    report.notifications = inline_notifications(program, bindings)?;
    report.identities = fold_identities(program, bindings);
    let mut reported = HashSet::new();
    let mut converged = false;
    while report.rounds < max_rounds {
        let types = analyze(program, &classes, ctx);
        let n = inline_token_calls(
            program,
            &classes,
            &types,
            None,
            &mut report.diagnostics,
            &mut reported,
        )?;
        report.rounds += 1;
        debug!(round = report.rounds, inlined = n, "call-site round");
        if n == 0 {
            converged = true;
            break;
        }
        report.inlined += n;
    }
    if !converged {
        let types = analyze(program, &classes, ctx);
        let pending: usize = classes
            .iter()
            .filter_map(|c| program.class(c).map(|k| (c, k)))
            .flat_map(|(c, k)| k.methods.iter().map(move |m| (c, m)))
            .map(|(c, m)| resolvable_sites(program, &types, c, m, None).len())
            .sum();
        if pending > 0 {
            report.diagnostics.push(
                Diagnostic::warning(
                    codes::W0302,
                    Location::default(),
                    format!(
                        "inlining stopped after {} rounds with {} resolvable call sites left",
                        max_rounds, pending
                    ),
                )
                .with_hint("raise --max-inline-rounds to continue inlining"),
            );
        }
    }
    Ok(report)
}

// ── Accessors ───────────────────────────────────────────────────────────────

/// Entity whose object `local` holds: `this` of a generated class, or a value
/// loaded from a child-entity field.
fn entity_of_local(
    bindings: &Bindings,
    class: &str,
    method: &Method,
    local: LocalId,
) -> Option<EntityId> {
    if method.this() == Some(local) {
        return bindings.entity_of_class(class);
    }
    traced_field(method, local).and_then(|f| bindings.child_of_field(&f))
}

/// `(base, field)` when `local` holds `base.field` loaded at a unique
/// definition, directly or through copies and casts.
fn loaded_from(method: &Method, local: LocalId) -> Option<(LocalId, FieldRef)> {
    let mut cur = local;
    for _ in 0..8 {
        let defs = defs_of(method, cur);
        let [def] = defs.as_slice() else {
            return None;
        };
        match &method.body[*def] {
            Stmt::Assign {
                value: Rvalue::Load(Place::Field { base, field }),
                ..
            } => {
                let stable = method.is_entry_bound(*base) || defs_of(method, *base).len() <= 1;
                return stable.then(|| (*base, field.clone()));
            }
            Stmt::Assign {
                value: Rvalue::Use(Operand::Local(src)) | Rvalue::Cast(_, Operand::Local(src)),
                ..
            } => cur = *src,
            _ => return None,
        }
    }
    None
}

/// Statements replacing `dest = value`, through a fresh local when `dest`
/// is not a local.
fn assign_to(method: &mut Method, dest: &Place, value: Rvalue, ty: IrType) -> Vec<Stmt> {
    match dest {
        Place::Local(l) => vec![Stmt::assign(*l, value)],
        place => {
            let tmp = method.add_local("acc", ty);
            vec![
                Stmt::assign(tmp, value),
                Stmt::Assign {
                    dest: place.clone(),
                    value: Rvalue::Use(Operand::Local(tmp)),
                },
            ]
        }
    }
}

/// Rewrite lookups and attribute accessors in every generated class.
/// Returns the number of rewritten calls.
pub fn rewrite_accessors(
    program: &mut Program,
    graph: &ActorGraph,
    bindings: &Bindings,
    values: &ConstantValueMap,
) -> usize {
    let mut count = 0;
    for class in bindings.generated_classes() {
        let Some(k) = program.class_mut(class) else {
            continue;
        };
        for method in k.methods.iter_mut().filter(|m| m.has_body()) {
            count += rewrite_lookups(graph, bindings, class, method);
        }
    }
    let frozen = dynamic_attributes_written(program, bindings, values);
    for class in bindings.generated_classes() {
        let Some(k) = program.class_mut(class) else {
            continue;
        };
        for method in k.methods.iter_mut().filter(|m| m.has_body()) {
            count += rewrite_attribute_calls(graph, bindings, values, &frozen, method);
        }
    }
    count
}

fn rewrite_lookups(
    graph: &ActorGraph,
    bindings: &Bindings,
    class: &str,
    method: &mut Method,
) -> usize {
    let mut count = 0;
    for i in 0..method.body.len() {
        let Stmt::Assign {
            dest: Place::Local(dest),
            value: Rvalue::Call(call),
        } = &method.body[i]
        else {
            continue;
        };
        let (Some(base), [Operand::Const(Constant::Str(name))]) =
            (call.receiver, call.args.as_slice())
        else {
            continue;
        };
        let Some(entity) = entity_of_local(bindings, class, method, base) else {
            continue;
        };
        let field = match call.method.name.as_str() {
            "getAttribute" => graph
                .attribute_by_name(AttrOwner::Entity(entity), name)
                .and_then(|a| bindings.attribute_field(a)),
            "getPort" => graph
                .port_by_name(entity, name)
                .and_then(|p| bindings.port_field(p)),
            _ => None,
        };
        if let Some(field) = field {
            method.body[i] = Stmt::assign(
                *dest,
                Rvalue::Load(Place::Field {
                    base,
                    field: field.clone(),
                }),
            );
            count += 1;
        }
    }
    count
}

/// Dynamic attributes that some code writes with `setToken`; their accessors
/// stay calls so reads observe the written token.
fn dynamic_attributes_written(
    program: &Program,
    bindings: &Bindings,
    values: &ConstantValueMap,
) -> HashSet<AttrId> {
    let mut out = HashSet::new();
    for class in bindings.generated_classes() {
        let Some(k) = program.class(class) else {
            continue;
        };
        for method in k.methods.iter().filter(|m| m.has_body()) {
            for stmt in &method.body {
                let Some(call) = stmt.call() else { continue };
                if call.method.name != "setToken" {
                    continue;
                }
                let attr = call
                    .receiver
                    .and_then(|r| loaded_from(method, r))
                    .and_then(|(_, f)| bindings.attribute_of_field(&f));
                if let Some(a) = attr {
                    if values.get(a).is_some_and(|e| e.value.is_dynamic()) {
                        out.insert(a);
                    }
                }
            }
        }
    }
    out
}

fn rewrite_attribute_calls(
    graph: &ActorGraph,
    bindings: &Bindings,
    values: &ConstantValueMap,
    frozen: &HashSet<AttrId>,
    method: &mut Method,
) -> usize {
    let mut count = 0;
    let mut i = method.body.len();
    while i > 0 {
        i -= 1;
        let stmt = method.body[i].clone();
        let (dest, call) = match &stmt {
            Stmt::Invoke(c) => (None, c),
            Stmt::Assign {
                dest,
                value: Rvalue::Call(c),
            } => (Some(dest), c),
            _ => continue,
        };
        let Some(receiver) = call.receiver else { continue };
        let Some((base, field)) = loaded_from(method, receiver) else {
            continue;
        };
        let Some(attr) = bindings.attribute_of_field(&field) else {
            continue;
        };
        let Some(entry) = values.get(attr) else { continue };
        let a = graph.attribute(attr);
        let literal = |s: &str| Rvalue::Use(Operand::Const(Constant::Str(s.to_string())));

        let code = match (call.method.name.as_str(), call.args.as_slice(), &entry.value) {
            ("getToken", [], _) if frozen.contains(&attr) => continue,
            ("getToken", [], AttributeValue::DynamicExpression(_)) => {
                let text = method.add_local("expr", IrType::Str);
                let mut code = vec![Stmt::load_field(text, base, entry.slot.clone())];
                let eval = Rvalue::Call(Call::static_call(
                    EXPRESSION_CLASS,
                    "evaluate",
                    vec![Operand::Local(base), Operand::Local(text)],
                ));
                match dest {
                    Some(d) => code.extend(assign_to(method, d, eval, IrType::object("Token"))),
                    None => code.push(Stmt::Invoke(Call::static_call(
                        EXPRESSION_CLASS,
                        "evaluate",
                        vec![Operand::Local(base), Operand::Local(text)],
                    ))),
                }
                code
            }
            ("getToken", [], _) => match dest {
                Some(d) => {
                    let ty = IrType::object(&slot_class(entry.value.constant()));
                    let load = Rvalue::Load(Place::Field {
                        base,
                        field: entry.slot.clone(),
                    });
                    assign_to(method, d, load, ty)
                }
                None => vec![Stmt::Nop],
            },
            ("setToken", [token], v) if !v.is_dynamic() => vec![
                Stmt::Assign {
                    dest: Place::Field {
                        base,
                        field: entry.slot.clone(),
                    },
                    value: Rvalue::Use(token.clone()),
                },
                Stmt::Invoke(Call::virtual_call(
                    base,
                    &entry.owner,
                    "attributeChanged",
                    vec![Operand::Local(receiver)],
                )),
            ],
            ("getName", [], _) => match dest {
                Some(d) => assign_to(method, d, literal(&a.name), IrType::Str),
                None => vec![Stmt::Nop],
            },
            ("getExpression", [], _) => match dest {
                Some(d) => assign_to(method, d, literal(&a.expression), IrType::Str),
                None => vec![Stmt::Nop],
            },
            _ => continue,
        };
        method.body.splice(i..=i, code);
        count += 1;
    }
    count
}

fn slot_class(value: Option<&Value>) -> String {
    match value {
        Some(v) => crate::resolve::token_class(&v.token_type()).to_string(),
        None => "Token".to_string(),
    }
}

// ── Notifications ───────────────────────────────────────────────────────────

const NOTIFY: &str = "attributeChanged";

/// Whether `method` writes an attribute or notifies.
fn notifies(method: &Method) -> bool {
    method
        .body
        .iter()
        .filter_map(Stmt::call)
        .any(|c| c.method.name == NOTIFY || c.method.name == "setToken")
}

/// Inline `attributeChanged` calls on known entities whose target neither
/// writes attributes nor notifies. Returns the number of inlined sites.
pub fn inline_notifications(program: &mut Program, bindings: &Bindings) -> Result<usize> {
    let mut total = 0;
    for class in bindings.generated_classes() {
        let names: Vec<String> = match program.class(class) {
            Some(k) => k
                .methods
                .iter()
                .filter(|m| m.has_body())
                .map(|m| m.name.clone())
                .collect(),
            None => continue,
        };
        for name in names {
            let Some(method) = program.method(class, &name) else {
                continue;
            };
            let mut callees = Vec::new();
            for (i, stmt) in method.body.iter().enumerate() {
                let Stmt::Invoke(call) = stmt else { continue };
                if call.method.name != NOTIFY {
                    continue;
                }
                let Some(entity) = call
                    .receiver
                    .and_then(|r| entity_of_local(bindings, class, method, r))
                else {
                    continue;
                };
                match program.lookup_method(bindings.class_of(entity), NOTIFY) {
                    Some((_, callee)) if callee.has_body() && !notifies(callee) => {
                        callees.push((i, callee.clone()));
                    }
                    _ => {}
                }
            }
            if callees.is_empty() {
                continue;
            }
            let method = program.method_mut(class, &name).ok_or_else(|| {
                SpecializeError::internal(format!("method `{}::{}` vanished", class, name))
            })?;
            for (i, callee) in callees.iter().rev() {
                debug!(class = %class, method = %name, "inline notification");
                inline_call(method, *i, callee)?;
            }
            cleanup_method(method);
            total += callees.len();
        }
    }
    Ok(total)
}

// ── Identity tests ──────────────────────────────────────────────────────────

/// Whether `field` holds an attribute, port or child entity of the graph.
fn names_object(bindings: &Bindings, field: &FieldRef) -> bool {
    bindings.attribute_of_field(field).is_some()
        || bindings.port_of_field(field).is_some()
        || bindings.child_of_field(field).is_some()
}

/// Whether `a` and `b` hold the same named object, when both are loaded
/// from named-object fields of one base. Distinct fields hold distinct
/// objects.
fn same_object(bindings: &Bindings, method: &Method, a: LocalId, b: LocalId) -> Option<bool> {
    let (base_a, field_a) = loaded_from(method, a)?;
    let (base_b, field_b) = loaded_from(method, b)?;
    let named = names_object(bindings, &field_a) && names_object(bindings, &field_b);
    (base_a == base_b && named).then(|| field_a == field_b)
}

/// Replace identity tests between named objects by their outcome. Returns
/// the number of folded tests.
fn fold_identity_tests(bindings: &Bindings, method: &mut Method) -> usize {
    let mut count = 0;
    for i in 0..method.body.len() {
        let folded = match &method.body[i] {
            Stmt::If {
                op: op @ (BinOp::Eq | BinOp::Ne),
                lhs: Operand::Local(a),
                rhs: Operand::Local(b),
                target,
            } => same_object(bindings, method, *a, *b).map(|same| {
                if same == (*op == BinOp::Eq) {
                    Stmt::Goto(*target)
                } else {
                    Stmt::Nop
                }
            }),
            Stmt::Assign {
                dest: Place::Local(d),
                value:
                    Rvalue::Binary(
                        op @ (BinOp::Eq | BinOp::Ne),
                        Operand::Local(a),
                        Operand::Local(b),
                    ),
            } => same_object(bindings, method, *a, *b)
                .map(|same| Stmt::copy(*d, Constant::Bool(same == (*op == BinOp::Eq)))),
            _ => None,
        };
        if let Some(stmt) = folded {
            method.body[i] = stmt;
            count += 1;
        }
    }
    count
}

/// Fold identity tests in every generated class and clean up the methods
/// that changed. Returns the number of folded tests.
pub fn fold_identities(program: &mut Program, bindings: &Bindings) -> usize {
    let mut total = 0;
    for class in bindings.generated_classes() {
        let Some(k) = program.class_mut(class) else {
            continue;
        };
        for method in k.methods.iter_mut().filter(|m| m.has_body()) {
            let n = fold_identity_tests(bindings, method);
            if n > 0 {
                cleanup_method(method);
                total += n;
            }
        }
    }
    total
}

// ── Token calls ─────────────────────────────────────────────────────────────

/// Concrete class a token call at `stmt` dispatches to, if unique.
/// `depth` restricts resolution to receivers whose summary shape is exact,
/// instantiable and of exactly that nesting depth.
fn resolve_target(
    program: &Program,
    types: &SpecializedTypeMap,
    class: &str,
    method: &Method,
    stmt: usize,
    call: &Call,
    depth: Option<usize>,
) -> Target {
    let Some(receiver) = call.receiver else {
        return Target::None;
    };
    if !program.is_token_class(&call.method.class) {
        return Target::None;
    }
    let shape = types.local_at(class, &method.name, stmt, receiver);
    let candidate = match depth {
        Some(d) => {
            // The summary also covers refinements made by the call itself.
            let shape = types.local(class, &method.name, receiver);
            if !(shape.is_specializable() && shape.ty.depth() == d) {
                return Target::None;
            }
            shape.ty.token_class().map(str::to_string)
        }
        None if call.kind == CallKind::Special => Some(call.method.class.clone()),
        None if shape.exact && shape.ty != TokenType::Unknown => {
            shape.ty.token_class().map(str::to_string)
        }
        None => {
            let targets = program.dispatch_targets(&call.method.class, &call.method.name);
            return match targets.as_slice() {
                [decl] => match program.method(decl, &call.method.name) {
                    Some(m) if m.has_body() => Target::Unique(decl.clone()),
                    _ => Target::None,
                },
                [] => Target::None,
                _ => Target::Ambiguous(targets.len()),
            };
        }
    };
    let Some(candidate) = candidate else {
        return Target::None;
    };
    if !program.is_subclass_of(&candidate, &call.method.class) {
        return Target::None;
    }
    match program.lookup_method(&candidate, &call.method.name) {
        Some((decl, m)) if m.has_body() => Target::Unique(decl),
        _ => Target::None,
    }
}

enum Target {
    None,
    Unique(String),
    Ambiguous(usize),
}

/// Sites of `method` with a unique target, as (statement, declaring class).
fn resolvable_sites(
    program: &Program,
    types: &SpecializedTypeMap,
    class: &str,
    method: &Method,
    depth: Option<usize>,
) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    for (i, stmt) in method.body.iter().enumerate() {
        let Some(call) = stmt.call() else { continue };
        if let Target::Unique(decl) =
            resolve_target(program, types, class, method, i, call, depth)
        {
            out.push((i, decl));
        }
    }
    out
}

/// One inlining round over `classes`. Returns the number of inlined sites.
pub fn inline_token_calls(
    program: &mut Program,
    classes: &[String],
    types: &SpecializedTypeMap,
    depth: Option<usize>,
    diagnostics: &mut Vec<Diagnostic>,
    reported: &mut HashSet<(String, String, String)>,
) -> Result<usize> {
    let mut total = 0;
    for class in classes {
        let names: Vec<String> = match program.class(class) {
            Some(k) => k.methods.iter().filter(|m| m.has_body()).map(|m| m.name.clone()).collect(),
            None => continue,
        };
        for name in names {
            let Some(method) = program.method(class, &name) else {
                continue;
            };
            if depth.is_none() {
                report_ambiguous(program, types, class, method, diagnostics, reported);
            }
            let sites = resolvable_sites(program, types, class, method, depth);
            if sites.is_empty() {
                continue;
            }
            let callees = sites
                .iter()
                .map(|(i, decl)| {
                    let callee_name = method.body[*i]
                        .call()
                        .map(|c| c.method.name.clone())
                        .unwrap_or_default();
                    program
                        .method(decl, &callee_name)
                        .cloned()
                        .map(|m| (*i, m))
                        .ok_or_else(|| {
                            SpecializeError::internal(format!(
                                "callee `{}::{}` vanished",
                                decl, callee_name
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            let method = program
                .method_mut(class, &name)
                .ok_or_else(|| {
                    SpecializeError::internal(format!("method `{}::{}` vanished", class, name))
                })?;
            // Descending positions keep earlier sites valid.
            for (i, callee) in callees.iter().rev() {
                debug!(class = %class, method = %name, callee = %callee.name, "inline");
                inline_call(method, *i, callee)?;
            }
            cleanup_method(method);
            total += callees.len();
        }
    }
    Ok(total)
}

fn report_ambiguous(
    program: &Program,
    types: &SpecializedTypeMap,
    class: &str,
    method: &Method,
    diagnostics: &mut Vec<Diagnostic>,
    reported: &mut HashSet<(String, String, String)>,
) {
    for (i, stmt) in method.body.iter().enumerate() {
        let Some(call) = stmt.call() else { continue };
        if let Target::Ambiguous(n) = resolve_target(program, types, class, method, i, call, None) {
            let text = method.display_stmt(stmt).to_string();
            if !reported.insert((class.to_string(), method.name.clone(), text.clone())) {
                continue;
            }
            diagnostics.push(
                Diagnostic::warning(
                    codes::W0301,
                    Location::stmt(class, &method.name, i),
                    format!(
                        "`{}` has {} candidate implementations of `{}`; left as a call",
                        text, n, call.method.name
                    ),
                )
                .with_hint("the receiver's runtime type is not statically known"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::runtime_library;
    use crate::lower::parse_ir;
    use crate::model::EntitySpec;
    use crate::resolve::resolve;
    use crate::scaffold::scaffold;

    const USER: &str = r#"
class Scale extends Actor {
    field input: IOPort;
    field output: IOPort;
    field gain: Parameter;
    field offset: Parameter;
    field hits: int;

    method fire() {
        local p: IOPort;
        local g: Parameter;
        local k: Token;
        local t: Token;
        local r: Token;
        local q: IOPort;
        p = this.input;
        t = virtualinvoke p.get(0);
        g = this.gain;
        k = virtualinvoke g.getToken();
        r = virtualinvoke k.multiply(t);
        q = this.output;
        virtualinvoke q.send(0, r);
        return;
    }

    method bump() {
        local a: Attribute;
        local g: Parameter;
        local k: Token;
        local n: string;
        a = virtualinvoke this.getAttribute("gain");
        g = (Parameter) a;
        k = new DoubleToken;
        specialinvoke k.DoubleToken::<init>(3.0);
        virtualinvoke g.setToken(k);
        n = virtualinvoke g.getName();
        return;
    }

    method attributeChanged(a: Attribute) {
        local o: Parameter;
        local g: Parameter;
        local n: int;
        o = this.offset;
        if a == o goto done;
        g = this.gain;
        if a != g goto done;
        n = this.hits;
        n = n + 1;
        this.hits = n;
    done:
        return;
    }

    method same(): boolean {
        local a: Parameter;
        local b: Parameter;
        local p: IOPort;
        local r: boolean;
        a = this.gain;
        b = this.gain;
        p = this.input;
        r = a == b;
        if a == p goto differ;
        return r;
    differ:
        r = false;
        return r;
    }
}
"#;

    const GRAPH: &str = r#"{
        "name": "top", "composite": true,
        "entities": [{
            "name": "s", "class": "Scale",
            "attributes": [{"name": "gain", "expression": "2.0"},
                           {"name": "offset", "expression": "0.0"}],
            "ports": [{"name": "input", "direction": "input", "type": "double"},
                      {"name": "output", "direction": "output", "type": "double"}]
        }]
    }"#;

    fn setup() -> (ActorGraph, Program, Bindings, ConstantValueMap) {
        let spec: EntitySpec = serde_json::from_str(GRAPH).unwrap();
        let graph = ActorGraph::from_spec(&spec).unwrap();
        let lib = runtime_library().unwrap();
        let user = parse_ir(USER, &lib).unwrap();
        let (mut program, bindings) = scaffold(&graph, &lib, &user).unwrap();
        let values = resolve(&graph, &mut program, &bindings).unwrap().values;
        (graph, program, bindings, values)
    }

    #[test]
    fn accessors_become_slot_traffic() {
        let (graph, mut program, bindings, values) = setup();
        let n = rewrite_accessors(&mut program, &graph, &bindings, &values);
        // getToken, getAttribute, setToken, getName
        assert_eq!(n, 4);
        let fire = program.method("CG_top_s", "fire").unwrap().to_string();
        assert!(fire.contains("k = this._CGToken_gain;"), "{fire}");
        assert!(!fire.contains("getToken"), "{fire}");
        let bump = program.method("CG_top_s", "bump").unwrap().to_string();
        assert!(bump.contains("a = this.gain;"), "{bump}");
        assert!(!bump.contains("setToken"), "{bump}");
        assert!(bump.contains("n = \"gain\";"), "{bump}");
        let write = bump.find("this._CGToken_gain = k;").expect("slot write");
        let notify = bump.find("virtualinvoke this.attributeChanged(g);").expect("notification");
        assert!(write < notify, "{bump}");
    }

    #[test]
    fn notifications_inline_and_identity_tests_fold() {
        let (graph, mut program, bindings, values) = setup();
        let ctx = TypeContext::new(&graph, &bindings, &values);
        let report =
            resolve_call_sites(&mut program, &graph, &bindings, &values, &ctx, 20).unwrap();
        assert_eq!(report.notifications, 1);
        // Two in the inlined notification, two in `same`.
        assert_eq!(report.identities, 4);
        let bump = program.method("CG_top_s", "bump").unwrap().to_string();
        assert!(!bump.contains(NOTIFY), "{bump}");
        assert!(!bump.contains("offset"), "{bump}");
        assert!(!bump.contains("if "), "{bump}");
        let write = bump.find("this._CGToken_gain = k;").expect("slot write");
        let counted = bump.find("this.hits = ").expect("notification body");
        assert!(write < counted, "{bump}");
        assert_eq!(bump.matches("this.hits = ").count(), 1, "{bump}");

        let same = program.method("CG_top_s", "same").unwrap().to_string();
        assert!(same.contains("return true;"), "{same}");
        assert!(!same.contains("if "), "{same}");
    }

    #[test]
    fn parameters_are_not_known_objects() {
        let (graph, mut program, bindings, values) = setup();
        rewrite_accessors(&mut program, &graph, &bindings, &values);
        // `a` is bound on entry, so the notification body keeps its tests.
        assert_eq!(fold_identities(&mut program, &bindings), 2);
        let notify = program.method("CG_top_s", NOTIFY).unwrap().to_string();
        assert_eq!(notify.matches("if ").count(), 2, "{notify}");
    }

    #[test]
    fn token_calls_are_inlined() {
        let (graph, mut program, bindings, values) = setup();
        let ctx = TypeContext::new(&graph, &bindings, &values);
        let report =
            resolve_call_sites(&mut program, &graph, &bindings, &values, &ctx, 20).unwrap();
        assert!(report.inlined > 0);
        assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
        let fire = program.method("CG_top_s", "fire").unwrap().to_string();
        assert!(!fire.contains("multiply"), "{fire}");
        assert!(fire.contains("send(0"), "{fire}");
    }

    #[test]
    fn unknown_receiver_is_ambiguous() {
        let lib = runtime_library().unwrap();
        let user = parse_ir(
            "class U extends Actor {
                method f(a: Token, b: Token): Token {
                    local c: Token;
                    c = virtualinvoke a.add(b);
                    return c;
                }
            }",
            &lib,
        )
        .unwrap();
        let mut program = lib.clone();
        program.merge(user);
        let classes = vec!["U".to_string()];
        let types = analyze(&program, &classes, &TypeContext::default());
        let mut diags = Vec::new();
        let mut seen = HashSet::new();
        let n = inline_token_calls(&mut program, &classes, &types, None, &mut diags, &mut seen)
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::W0301));
    }

    #[test]
    fn round_bound_is_reported() {
        let (graph, mut program, bindings, values) = setup();
        let ctx = TypeContext::new(&graph, &bindings, &values);
        let report = resolve_call_sites(&mut program, &graph, &bindings, &values, &ctx, 1).unwrap();
        assert_eq!(report.rounds, 1);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::W0302)));
    }
}
