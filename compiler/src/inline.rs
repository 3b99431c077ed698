// inline.rs — Single call-site inlining
//
// Replaces one call statement by a copy of the callee's body. The callee's
// `this` becomes the receiver local and read-only parameters become the
// argument locals themselves; every other callee local gets a fresh caller
// local named `<callee>$<local>`. Callee labels are renumbered, and each
// `return x` becomes `dest = x; goto end`.
//
// Preconditions: the statement at `site` is a call to `callee`.
// Postconditions: the caller computes what the call computed, and the call
//   statement is gone.
// Failure modes: a site without a call, or a callee without a body →
//   `SpecializeError::InternalConsistency`.
// Side effects: mutates the caller.

use std::collections::HashMap;

use crate::error::{Result, SpecializeError};
use crate::id::{Label, LocalId};
use crate::ir::{Method, Operand, Place, Rvalue, Stmt};

/// Prefix for locals copied out of `callee`.
fn local_prefix(callee: &Method) -> String {
    callee
        .name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Inline the call at `site` of `caller`.
pub fn inline_call(caller: &mut Method, site: usize, callee: &Method) -> Result<()> {
    if !callee.has_body() {
        return Err(SpecializeError::internal(format!(
            "cannot inline `{}`: it has no body",
            callee.name
        )));
    }
    let (dest, call) = match caller.body.get(site) {
        Some(Stmt::Invoke(c)) => (None, c.clone()),
        Some(Stmt::Assign {
            dest,
            value: Rvalue::Call(c),
        }) => (Some(dest.clone()), c.clone()),
        _ => {
            return Err(SpecializeError::internal(format!(
                "statement {} of `{}` is not a call",
                site, caller.name
            )))
        }
    };
    if call.args.len() != callee.params.len() {
        return Err(SpecializeError::internal(format!(
            "call to `{}` passes {} arguments for {} parameters",
            callee.name,
            call.args.len(),
            callee.params.len()
        )));
    }

    let prefix = local_prefix(callee);
    let written: Vec<LocalId> = callee.body.iter().filter_map(|s| s.def_local()).collect();
    let mut map: HashMap<LocalId, LocalId> = HashMap::new();
    let mut prologue = Vec::new();

    if let (Some(this), Some(receiver)) = (callee.this(), call.receiver) {
        map.insert(this, receiver);
    }
    for (param, arg) in callee.params.iter().zip(&call.args) {
        match arg {
            Operand::Local(l) if !written.contains(param) => {
                map.insert(*param, *l);
            }
            _ => {
                let decl = callee.local(*param);
                let fresh = caller.add_local(&format!("{}${}", prefix, decl.name), decl.ty.clone());
                prologue.push(Stmt::copy(fresh, arg.clone()));
                map.insert(*param, fresh);
            }
        }
    }
    for (i, decl) in callee.locals.iter().enumerate() {
        let id = LocalId(i as u32);
        if !map.contains_key(&id) {
            let fresh = caller.add_local(&format!("{}${}", prefix, decl.name), decl.ty.clone());
            map.insert(id, fresh);
        }
    }

    // Non-local destinations receive the value after the inlined body.
    let (result, epilogue) = match dest {
        Some(Place::Local(l)) => (Some(l), Vec::new()),
        Some(place) => {
            let tmp = caller.add_local(&format!("{}$result", prefix), callee.return_type.clone());
            (
                Some(tmp),
                vec![Stmt::Assign {
                    dest: place,
                    value: Rvalue::Use(Operand::Local(tmp)),
                }],
            )
        }
        None => (None, Vec::new()),
    };

    let mut labels: HashMap<Label, Label> = HashMap::new();
    for stmt in &callee.body {
        if let Stmt::Label(l) = stmt {
            let fresh = caller.fresh_label();
            labels.insert(*l, fresh);
        }
    }
    let end = caller.fresh_label();

    let mut code = prologue;
    for stmt in &callee.body {
        let mut s = stmt.clone();
        s.for_each_local_mut(&mut |l| {
            if let Some(m) = map.get(l) {
                *l = *m;
            }
        });
        s.for_each_label_mut(&mut |l| {
            if let Some(m) = labels.get(l) {
                *l = *m;
            }
        });
        match s {
            Stmt::Return(value) => {
                if let (Some(r), Some(v)) = (result, value) {
                    code.push(Stmt::copy(r, v));
                }
                code.push(Stmt::Goto(end));
            }
            other => code.push(other),
        }
    }
    code.push(Stmt::Label(end));
    code.extend(epilogue);

    caller.body.splice(site..=site, code);
    Ok(())
}
