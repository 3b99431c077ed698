// cfg.rs — Statement-level control-flow graph and def/use queries
//
// Nodes are statement indices of one method body; statement 0 is the entry.
// Labels are ordinary nodes that fall through, so positions in the CFG stay
// aligned with positions in `Method::body`.
//
// Preconditions: every jump target of the body is defined by a label.
// Postconditions: `succs` and `preds` are mutually consistent.
// Failure modes: a jump to an undefined label is ignored (no edge).
// Side effects: none.

use std::collections::{HashMap, VecDeque};

use crate::id::{Label, LocalId};
use crate::ir::{FieldRef, Method, Operand, Place, Rvalue, Stmt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cfg {
    pub succs: Vec<Vec<usize>>,
    pub preds: Vec<Vec<usize>>,
}

impl Cfg {
    pub fn build(method: &Method) -> Cfg {
        let body = &method.body;
        let labels: HashMap<Label, usize> = body
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Stmt::Label(l) => Some((*l, i)),
                _ => None,
            })
            .collect();
        let n = body.len();
        let mut succs = vec![Vec::new(); n];
        for (i, stmt) in body.iter().enumerate() {
            if stmt.falls_through() && i + 1 < n {
                succs[i].push(i + 1);
            }
            if let Some(target) = stmt.branch_target().and_then(|l| labels.get(&l)) {
                if !succs[i].contains(target) {
                    succs[i].push(*target);
                }
            }
        }
        let mut preds = vec![Vec::new(); n];
        for (i, out) in succs.iter().enumerate() {
            for &s in out {
                preds[s].push(i);
            }
        }
        Cfg { succs, preds }
    }

    pub fn len(&self) -> usize {
        self.succs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.succs.is_empty()
    }

    /// Statements reachable from the entry.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.len()];
        if self.is_empty() {
            return seen;
        }
        let mut queue = VecDeque::from([0]);
        seen[0] = true;
        while let Some(i) = queue.pop_front() {
            for &s in &self.succs[i] {
                if !seen[s] {
                    seen[s] = true;
                    queue.push_back(s);
                }
            }
        }
        seen
    }
}

/// Positions of statements that define `local`.
pub fn defs_of(method: &Method, local: LocalId) -> Vec<usize> {
    method
        .body
        .iter()
        .enumerate()
        .filter(|(_, s)| s.def_local() == Some(local))
        .map(|(i, _)| i)
        .collect()
}

/// Number of reads of each local over the whole body.
pub fn use_counts(method: &Method) -> Vec<usize> {
    let mut counts = vec![0; method.locals.len()];
    for stmt in &method.body {
        for l in stmt.used_locals() {
            counts[l.index()] += 1;
        }
    }
    counts
}

/// Number of definitions of each local over the whole body.
pub fn def_counts(method: &Method) -> Vec<usize> {
    let mut counts = vec![0; method.locals.len()];
    for stmt in &method.body {
        if let Some(l) = stmt.def_local() {
            counts[l.index()] += 1;
        }
    }
    counts
}

/// Field whose value `local` holds, when every definition of `local` loads
/// that same field (directly or through copies and casts).
pub fn traced_field(method: &Method, local: LocalId) -> Option<FieldRef> {
    trace(method, local, 0)
}

fn trace(method: &Method, local: LocalId, depth: usize) -> Option<FieldRef> {
    if depth > 8 || method.is_entry_bound(local) {
        return None;
    }
    let mut found: Option<FieldRef> = None;
    for d in defs_of(method, local) {
        let field = match &method.body[d] {
            Stmt::Assign {
                value: Rvalue::Load(Place::Field { field, .. }),
                ..
            } => field.clone(),
            Stmt::Assign {
                value: Rvalue::Use(Operand::Local(src)) | Rvalue::Cast(_, Operand::Local(src)),
                ..
            } => trace(method, *src, depth + 1)?,
            _ => return None,
        };
        match &found {
            Some(f) if *f != field => return None,
            _ => found = Some(field),
        }
    }
    found
}
