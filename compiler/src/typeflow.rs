// typeflow.rs — Type-specialization analysis of token values
//
// Assigns every token-valued local (per program point) and every token field
// of the analyzed classes a `Shape`: a point of the token type lattice plus
// whether the runtime class of the value is known exactly. Locals use a
// forward worklist dataflow per method; fields take the least upper bound
// over every write in the analyzed code. Arrays of tokens are tracked by
// element shape, flow-insensitively: arrays connected by copies, field
// traffic or `arraycopy` share one element shape.
//
// Field and array shapes feed back into the per-method analysis, so the
// whole computation is iterated until the field and array tables stop
// growing. Tables only move up, and the lattice has bounded height.
//
// Preconditions: jump targets are defined; `classes` names classes of
//   `program`.
// Postconditions: a value whose shape is exact and instantiable holds, at
//   run time, either null or a token of exactly that type.
// Failure modes: none; missing facts read as `Unknown`.
// Side effects: none.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::cfg::{traced_field, Cfg};
use crate::id::LocalId;
use crate::ir::{Call, FieldRef, IrType, Method, Operand, Place, Program, Rvalue, Stmt};
use crate::lattice::{least_upper_bound, TokenType};
use crate::library::{ARITHMETIC, ARRAY_TOKEN_CLASS, BOOLEAN_TOKEN_CLASS, EXPRESSION_CLASS};
use crate::model::ActorGraph;
use crate::resolve::ConstantValueMap;
use crate::scaffold::Bindings;

// ── Shapes ──────────────────────────────────────────────────────────────────

/// Lattice type of a value and whether its runtime class is exactly the
/// class of that type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    pub ty: TokenType,
    pub exact: bool,
}

impl Shape {
    /// Nothing known yet (or always null).
    pub fn unknown() -> Shape {
        Shape {
            ty: TokenType::Unknown,
            exact: true,
        }
    }

    pub fn exact(ty: TokenType) -> Shape {
        Shape { ty, exact: true }
    }

    pub fn inexact(ty: TokenType) -> Shape {
        Shape { ty, exact: false }
    }

    pub fn general() -> Shape {
        Shape::inexact(TokenType::General)
    }

    /// Whether values of this shape can be replaced by native storage.
    pub fn is_specializable(&self) -> bool {
        self.exact && self.ty.is_instantiable()
    }

    /// Shape of the elements of an array token of this shape.
    pub fn element(&self) -> Shape {
        match &self.ty {
            TokenType::Array(e) => Shape {
                ty: (**e).clone(),
                exact: self.exact,
            },
            TokenType::Unknown => Shape::unknown(),
            _ => Shape::general(),
        }
    }

    pub fn join(&self, other: &Shape) -> Shape {
        let exact = self.exact && other.exact;
        if refines(&self.ty, &other.ty) {
            Shape {
                ty: other.ty.clone(),
                exact,
            }
        } else if refines(&other.ty, &self.ty) {
            Shape {
                ty: self.ty.clone(),
                exact,
            }
        } else {
            Shape::inexact(least_upper_bound(&self.ty, &other.ty))
        }
    }
}

/// `a` carries no information beyond `b` (equal up to unknown parts).
fn refines(a: &TokenType, b: &TokenType) -> bool {
    match (a, b) {
        (TokenType::Unknown, _) => true,
        (TokenType::Array(x), TokenType::Array(y)) => refines(x, y),
        _ => a == b,
    }
}

/// Shape implied by a declared IR type: exact only for leaf classes of
/// instantiable token types.
pub fn declared_shape(program: &Program, ty: &IrType) -> Shape {
    match ty {
        IrType::Object(class) => match TokenType::from_token_class(class) {
            Some(t) => Shape {
                exact: t.is_instantiable() && program.is_leaf(class),
                ty: t,
            },
            None => Shape::general(),
        },
        _ => Shape::general(),
    }
}

// ── Context ─────────────────────────────────────────────────────────────────

/// Types the actor graph fixes for port and attribute fields.
#[derive(Debug, Clone, Default)]
pub struct TypeContext {
    ports: HashMap<FieldRef, TokenType>,
    attributes: HashMap<FieldRef, TokenType>,
}

impl TypeContext {
    pub fn new(graph: &ActorGraph, bindings: &Bindings, values: &ConstantValueMap) -> Self {
        let mut ctx = TypeContext::default();
        for p in graph.port_ids() {
            if let Some(f) = bindings.port_field(p) {
                ctx.ports.insert(f.clone(), graph.port(p).element_type.clone());
            }
        }
        for (attr, entry) in values.iter() {
            let Some(f) = bindings.attribute_field(attr) else {
                continue;
            };
            let ty = match (&graph.attribute(attr).declared_type, entry.value.constant()) {
                (Some(t), _) => t.clone(),
                (None, Some(v)) => v.token_type(),
                (None, None) => TokenType::General,
            };
            ctx.attributes.insert(f.clone(), ty);
        }
        ctx
    }

    pub fn port_type(&self, field: &FieldRef) -> Option<&TokenType> {
        self.ports.get(field)
    }

    pub fn attribute_type(&self, field: &FieldRef) -> Option<&TokenType> {
        self.attributes.get(field)
    }
}

// ── Array classes ───────────────────────────────────────────────────────────

/// An array-valued storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    Local {
        class: String,
        method: String,
        local: LocalId,
    },
    Field(FieldRef),
}

impl ArrayKey {
    pub fn local(class: &str, method: &str, local: LocalId) -> ArrayKey {
        ArrayKey::Local {
            class: class.to_string(),
            method: method.to_string(),
            local,
        }
    }
}

/// Union-find over array locations.
#[derive(Debug, Clone, Default)]
struct ArrayClasses {
    index: HashMap<ArrayKey, usize>,
    parent: Vec<usize>,
}

impl ArrayClasses {
    fn id(&mut self, key: ArrayKey) -> usize {
        if let Some(i) = self.index.get(&key) {
            return *i;
        }
        let i = self.parent.len();
        self.parent.push(i);
        self.index.insert(key, i);
        i
    }

    fn find(&self, mut i: usize) -> usize {
        while self.parent[i] != i {
            i = self.parent[i];
        }
        i
    }

    fn root(&self, key: &ArrayKey) -> Option<usize> {
        self.index.get(key).map(|i| self.find(*i))
    }

    fn union(&mut self, a: ArrayKey, b: ArrayKey) {
        let (x, y) = (self.id(a), self.id(b));
        let (rx, ry) = (self.find(x), self.find(y));
        if rx != ry {
            let (lo, hi) = if rx < ry { (rx, ry) } else { (ry, rx) };
            self.parent[hi] = lo;
        }
    }

    /// Keys grouped by class root.
    fn members(&self, root: usize) -> Vec<&ArrayKey> {
        let mut out: Vec<&ArrayKey> = self
            .index
            .iter()
            .filter(|(_, i)| self.find(**i) == root)
            .map(|(k, _)| k)
            .collect();
        out.sort_by_key(|k| format!("{:?}", k));
        out
    }
}

// ── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct MethodTypes {
    /// Shapes of every local before each statement; `None` if unreachable.
    before: Vec<Option<Vec<Shape>>>,
    /// Join of every value a local is assigned.
    summary: Vec<Shape>,
}

/// Specialized type of every token value of the analyzed classes.
#[derive(Debug, Clone, Default)]
pub struct SpecializedTypeMap {
    methods: HashMap<(String, String), MethodTypes>,
    fields: HashMap<FieldRef, Shape>,
    arrays: ArrayClasses,
    /// Element shape per array class root.
    elements: HashMap<usize, Shape>,
    tracked: HashSet<String>,
}

impl SpecializedTypeMap {
    /// Shape of `local` just before statement `stmt`.
    pub fn local_at(&self, class: &str, method: &str, stmt: usize, local: LocalId) -> Shape {
        self.methods
            .get(&(class.to_string(), method.to_string()))
            .and_then(|m| m.before.get(stmt))
            .and_then(|s| s.as_ref())
            .and_then(|s| s.get(local.index()))
            .cloned()
            .unwrap_or_else(Shape::unknown)
    }

    /// Join of every value assigned to `local` anywhere in the method.
    pub fn local(&self, class: &str, method: &str, local: LocalId) -> Shape {
        self.methods
            .get(&(class.to_string(), method.to_string()))
            .and_then(|m| m.summary.get(local.index()))
            .cloned()
            .unwrap_or_else(Shape::unknown)
    }

    pub fn field(&self, field: &FieldRef) -> Shape {
        self.fields.get(field).cloned().unwrap_or_else(Shape::unknown)
    }

    /// Element shape of an array location.
    pub fn elements(&self, key: &ArrayKey) -> Shape {
        self.arrays
            .root(key)
            .and_then(|r| self.elements.get(&r))
            .cloned()
            .unwrap_or_else(Shape::unknown)
    }

    /// Every location sharing element storage with `key` (including it).
    pub fn aliases(&self, key: &ArrayKey) -> Vec<ArrayKey> {
        match self.arrays.root(key) {
            Some(r) => self.arrays.members(r).into_iter().cloned().collect(),
            None => vec![key.clone()],
        }
    }

    /// Whether fields of `class` are tracked by this analysis.
    pub fn is_tracked(&self, class: &str) -> bool {
        self.tracked.contains(class)
    }

    /// Deepest nesting among exact token values, bounded by `limit`.
    pub fn max_depth(&self, limit: usize) -> usize {
        let locals = self.methods.values().flat_map(|m| m.summary.iter());
        locals
            .chain(self.fields.values())
            .filter(|s| s.is_specializable())
            .map(|s| s.ty.depth())
            .max()
            .unwrap_or(0)
            .min(limit)
    }
}

// ── Analysis ────────────────────────────────────────────────────────────────

/// Analyze every method of `classes`.
pub fn analyze(program: &Program, classes: &[String], ctx: &TypeContext) -> SpecializedTypeMap {
    let mut map = SpecializedTypeMap {
        tracked: classes.iter().cloned().collect(),
        ..SpecializedTypeMap::default()
    };
    map.arrays = array_classes(program, classes);

    loop {
        let mut contrib = Contributions::default();
        for class in classes {
            let Some(k) = program.class(class) else {
                continue;
            };
            for method in k.methods.iter().filter(|m| m.has_body()) {
                let analyzer = Analyzer {
                    program,
                    ctx,
                    map: &map,
                    class,
                    method,
                };
                let types = analyzer.run(&mut contrib);
                map.methods
                    .insert((class.clone(), method.name.clone()), types);
            }
        }
        if !map.absorb(contrib) {
            return map;
        }
    }
}

#[derive(Default)]
struct Contributions {
    fields: HashMap<FieldRef, Shape>,
    elements: HashMap<usize, Shape>,
}

impl Contributions {
    fn field(&mut self, f: &FieldRef, s: Shape) {
        let e = self.fields.entry(f.clone()).or_insert_with(Shape::unknown);
        *e = e.join(&s);
    }

    fn element(&mut self, root: usize, s: Shape) {
        let e = self.elements.entry(root).or_insert_with(Shape::unknown);
        *e = e.join(&s);
    }
}

impl SpecializedTypeMap {
    /// Join contributions into the tables; returns whether anything grew.
    fn absorb(&mut self, contrib: Contributions) -> bool {
        let mut changed = false;
        for (f, s) in contrib.fields {
            let e = self.fields.entry(f).or_insert_with(Shape::unknown);
            let joined = e.join(&s);
            if joined != *e {
                *e = joined;
                changed = true;
            }
        }
        for (r, s) in contrib.elements {
            let e = self.elements.entry(r).or_insert_with(Shape::unknown);
            let joined = e.join(&s);
            if joined != *e {
                *e = joined;
                changed = true;
            }
        }
        changed
    }
}

fn is_token_array(program: &Program, ty: &IrType) -> bool {
    program.is_token_array_type(ty)
}

/// Array location a place or local denotes, if it holds a token array.
fn array_key(
    program: &Program,
    tracked: &HashSet<String>,
    class: &str,
    method: &Method,
    place: &Place,
) -> Option<ArrayKey> {
    match place {
        Place::Local(l) if is_token_array(program, method.local_type(*l)) => {
            Some(ArrayKey::local(class, &method.name, *l))
        }
        Place::Field { field, .. } | Place::Static(field)
            if tracked.contains(&field.class)
                && program
                    .field_type(field)
                    .is_some_and(|t| is_token_array(program, t)) =>
        {
            Some(ArrayKey::Field(field.clone()))
        }
        _ => None,
    }
}

fn array_classes(program: &Program, classes: &[String]) -> ArrayClasses {
    let tracked: HashSet<String> = classes.iter().cloned().collect();
    let mut arrays = ArrayClasses::default();
    for class in classes {
        let Some(k) = program.class(class) else {
            continue;
        };
        for method in k.methods.iter().filter(|m| m.has_body()) {
            for (i, decl) in method.locals.iter().enumerate() {
                if is_token_array(program, &decl.ty) {
                    arrays.id(ArrayKey::local(class, &method.name, LocalId(i as u32)));
                }
            }
            for stmt in &method.body {
                match stmt {
                    Stmt::Assign { dest, value } => {
                        let src = match value {
                            Rvalue::Use(Operand::Local(l)) | Rvalue::Cast(_, Operand::Local(l)) => {
                                Some(Place::Local(*l))
                            }
                            Rvalue::Load(p @ (Place::Field { .. } | Place::Static(_))) => {
                                Some(p.clone())
                            }
                            _ => None,
                        };
                        let a = array_key(program, &tracked, class, method, dest);
                        let b = src.and_then(|p| array_key(program, &tracked, class, method, &p));
                        if let (Some(a), Some(b)) = (a, b) {
                            arrays.union(a, b);
                        }
                    }
                    Stmt::ArrayCopy { src, dst, .. } => {
                        let a = array_key(program, &tracked, class, method, &Place::Local(*src));
                        let b = array_key(program, &tracked, class, method, &Place::Local(*dst));
                        if let (Some(a), Some(b)) = (a, b) {
                            arrays.union(a, b);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    arrays
}

struct Analyzer<'a> {
    program: &'a Program,
    ctx: &'a TypeContext,
    map: &'a SpecializedTypeMap,
    class: &'a str,
    method: &'a Method,
}

impl Analyzer<'_> {
    fn is_token(&self, l: LocalId) -> bool {
        self.program.is_token_type(self.method.local_type(l))
    }

    fn array_elements(&self, l: LocalId) -> Shape {
        self.map
            .elements(&ArrayKey::local(self.class, &self.method.name, l))
    }

    fn array_root(&self, l: LocalId) -> Option<usize> {
        self.map
            .arrays
            .root(&ArrayKey::local(self.class, &self.method.name, l))
    }

    fn field_shape(&self, field: &FieldRef) -> Shape {
        if self.map.tracked.contains(&field.class) {
            self.map.field(field)
        } else {
            match self.program.field_type(field) {
                Some(ty) => declared_shape(self.program, ty),
                None => Shape::general(),
            }
        }
    }

    fn operand(&self, op: &Operand, facts: &[Shape]) -> Shape {
        match op {
            Operand::Local(l) => facts[l.index()].clone(),
            Operand::Const(_) => Shape::unknown(),
        }
    }

    fn entry(&self) -> Vec<Shape> {
        let mut facts = vec![Shape::unknown(); self.method.locals.len()];
        for l in self.method.this_local.iter().chain(&self.method.params) {
            facts[l.index()] = declared_shape(self.program, self.method.local_type(*l));
        }
        facts
    }

    fn call_shape(&self, call: &Call, facts: &[Shape]) -> Shape {
        let name = call.method.name.as_str();
        let receiver = call.receiver.map(|r| facts[r.index()].clone());
        match (name, &receiver, call.args.as_slice()) {
            (n, Some(r), [arg]) if ARITHMETIC.contains(&n) => {
                let a = self.operand(arg, facts);
                let ty = least_upper_bound(&r.ty, &a.ty);
                Shape {
                    exact: r.exact && a.exact && ty.is_instantiable(),
                    ty,
                }
            }
            ("zero" | "one", Some(r), []) => r.clone(),
            ("getElement", Some(r), [_]) => r.element(),
            ("isEqualTo", Some(_), [_]) => Shape::exact(TokenType::Boolean),
            ("get" | "getInside", Some(_), [_]) => {
                match call.receiver.and_then(|r| traced_field(self.method, r)) {
                    Some(f) => match self.ctx.port_type(&f) {
                        Some(t) => Shape {
                            exact: t.is_instantiable(),
                            ty: t.clone(),
                        },
                        None => Shape::general(),
                    },
                    None => Shape::general(),
                }
            }
            ("getToken", Some(_), []) => {
                match call.receiver.and_then(|r| traced_field(self.method, r)) {
                    Some(f) => match self.ctx.attribute_type(&f) {
                        Some(t) => Shape {
                            exact: t.is_instantiable(),
                            ty: t.clone(),
                        },
                        None => Shape::general(),
                    },
                    None => Shape::general(),
                }
            }
            _ if call.method.class == EXPRESSION_CLASS => Shape::general(),
            _ => match self.program.lookup_method(&call.method.class, name) {
                Some((_, m)) => declared_shape(self.program, &m.return_type),
                None => Shape::general(),
            },
        }
    }

    fn rvalue_shape(&self, value: &Rvalue, facts: &[Shape]) -> Shape {
        match value {
            Rvalue::Use(op) | Rvalue::Cast(_, op) => self.operand(op, facts),
            Rvalue::Load(Place::Local(l)) => facts[l.index()].clone(),
            Rvalue::Load(Place::Field { field, .. }) => self.field_shape(field),
            Rvalue::Load(Place::Static(field)) => {
                let constant = field.name == "TRUE" || field.name == "FALSE";
                if field.class == BOOLEAN_TOKEN_CLASS && constant {
                    Shape::exact(TokenType::Boolean)
                } else {
                    self.field_shape(field)
                }
            }
            Rvalue::Load(Place::Elem { base, .. }) => self.array_elements(*base),
            Rvalue::New(class) if class == ARRAY_TOKEN_CLASS => {
                Shape::exact(TokenType::array_of(TokenType::Unknown))
            }
            Rvalue::New(class) => match TokenType::from_token_class(class) {
                Some(t) => Shape::exact(t),
                None => Shape::general(),
            },
            Rvalue::Call(call) => self.call_shape(call, facts),
            _ => Shape::general(),
        }
    }

    /// Refine an array token from the array it is built around.
    fn wrap(&self, token: &Shape, array: LocalId) -> Shape {
        let elems = if is_token_array(self.program, self.method.local_type(array)) {
            self.array_elements(array)
        } else {
            Shape::general()
        };
        Shape {
            ty: TokenType::array_of(elems.ty),
            exact: token.exact && elems.exact,
        }
    }

    fn transfer(&self, stmt: &Stmt, input: &[Shape]) -> Vec<Shape> {
        let mut out = input.to_vec();
        match stmt {
            Stmt::Assign {
                dest: Place::Local(l),
                value,
            } if self.is_token(*l) => {
                out[l.index()] = self.rvalue_shape(value, input);
            }
            Stmt::Assign {
                dest: Place::Field { base, field },
                value: Rvalue::Use(Operand::Local(a)),
            } if field.class == ARRAY_TOKEN_CLASS && field.name == "_value" => {
                out[base.index()] = self.wrap(&input[base.index()], *a);
            }
            Stmt::Invoke(call)
                if call.method.name == "<init>" && call.method.class == ARRAY_TOKEN_CLASS =>
            {
                if let (Some(r), [Operand::Local(a)]) = (call.receiver, call.args.as_slice()) {
                    out[r.index()] = self.wrap(&input[r.index()], *a);
                }
            }
            _ => {}
        }
        out
    }

    fn run(&self, contrib: &mut Contributions) -> MethodTypes {
        let body = &self.method.body;
        let n = body.len();
        let cfg = Cfg::build(self.method);
        let mut before: Vec<Option<Vec<Shape>>> = vec![None; n];
        if n > 0 {
            before[0] = Some(self.entry());
        }
        let mut queue: VecDeque<usize> = (0..n.min(1)).collect();
        let mut queued = vec![false; n];
        if n > 0 {
            queued[0] = true;
        }
        while let Some(i) = queue.pop_front() {
            queued[i] = false;
            let Some(input) = &before[i] else { continue };
            let out = self.transfer(&body[i], input);
            for &s in &cfg.succs[i] {
                let changed = match &mut before[s] {
                    Some(existing) => {
                        let mut changed = false;
                        for (e, o) in existing.iter_mut().zip(&out) {
                            let j = e.join(o);
                            if j != *e {
                                *e = j;
                                changed = true;
                            }
                        }
                        changed
                    }
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

        let mut summary = self.entry();
        for (i, stmt) in body.iter().enumerate() {
            let Some(input) = &before[i] else { continue };
            let out = self.transfer(stmt, input);
            if let Some(l) = stmt.def_local() {
                summary[l.index()] = summary[l.index()].join(&out[l.index()]);
            }
            if let Stmt::Invoke(c) | Stmt::Assign { value: Rvalue::Call(c), .. } = stmt {
                if c.method.name == "<init>" && c.method.class == ARRAY_TOKEN_CLASS {
                    if let Some(r) = c.receiver {
                        summary[r.index()] = summary[r.index()].join(&out[r.index()]);
                    }
                }
            }
            if let Stmt::Assign {
                dest: Place::Field { base, field },
                ..
            } = stmt
            {
                if field.class == ARRAY_TOKEN_CLASS && field.name == "_value" {
                    summary[base.index()] = summary[base.index()].join(&out[base.index()]);
                }
            }
            self.contribute(stmt, input, contrib);
        }
        // Arrays passed in come from code this analysis does not see.
        for p in self.method.params.iter().chain(&self.method.this_local) {
            if let Some(root) = self.array_root(*p) {
                contrib.element(root, Shape::general());
            }
        }
        MethodTypes { before, summary }
    }

    /// Field and array-element facts implied by one reachable statement.
    fn contribute(&self, stmt: &Stmt, input: &[Shape], contrib: &mut Contributions) {
        let Stmt::Assign { dest, value } = stmt else {
            return;
        };
        match dest {
            Place::Field { field, .. } | Place::Static(field)
                if self.map.tracked.contains(&field.class)
                    && self
                        .program
                        .field_type(field)
                        .is_some_and(|t| self.program.is_token_type(t)) =>
            {
                contrib.field(field, self.rvalue_shape(value, input));
            }
            Place::Elem { base, .. } => {
                if let Some(root) = self.array_root(*base) {
                    contrib.element(root, self.rvalue_shape(value, input));
                }
            }
            Place::Local(a) => {
                let Some(root) = self.array_root(*a) else {
                    return;
                };
                let shape = match value {
                    Rvalue::Load(Place::Field { base, field })
                        if field.class == ARRAY_TOKEN_CLASS && field.name == "_value" =>
                    {
                        input[base.index()].element()
                    }
                    Rvalue::Call(c) if c.method.name == "arrayValue" => match c.receiver {
                        Some(r) => input[r.index()].element(),
                        None => Shape::general(),
                    },
                    // Connected arrays and fresh allocations add nothing.
                    Rvalue::Use(_) | Rvalue::Cast(..) | Rvalue::NewArray(..) => return,
                    Rvalue::Load(p @ (Place::Field { .. } | Place::Static(_)))
                        if array_key(self.program, &self.map.tracked, self.class, self.method, p)
                            .is_some() =>
                    {
                        return
                    }
                    _ => Shape::general(),
                };
                contrib.element(root, shape);
            }
            _ => {}
        }
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

    fn run(p: &Program) -> SpecializedTypeMap {
        analyze(p, &["A".to_string()], &TypeContext::default())
    }

    #[test]
    fn join_rules() {
        let d = Shape::exact(TokenType::Double);
        let i = Shape::exact(TokenType::Int);
        assert_eq!(Shape::unknown().join(&d), d);
        assert_eq!(d.join(&d), d);
        let mixed = d.join(&i);
        assert_eq!(mixed.ty, TokenType::Double);
        assert!(!mixed.exact);
        let partial = Shape::exact(TokenType::array_of(TokenType::Unknown));
        let full = Shape::exact(TokenType::array_of(TokenType::Double));
        assert_eq!(partial.join(&full), full);
    }

    #[test]
    fn flow_sensitive_locals_and_branches() {
        let p = program(
            "class A {
                method f(c: int): Token {
                    local t: Token;
                    local u: Token;
                    t = new DoubleToken;
                    specialinvoke t.DoubleToken::<init>(1.0);
                    if c == 0 goto other;
                    u = t;
                    goto done;
                other:
                    u = new IntToken;
                    specialinvoke u.IntToken::<init>(1);
                done:
                    return u;
                }
            }",
        );
        let map = run(&p);
        let m = p.method("A", "f").unwrap();
        let t = m.local_by_name("t").unwrap();
        let u = m.local_by_name("u").unwrap();
        assert_eq!(map.local("A", "f", t), Shape::exact(TokenType::Double));
        let joined = map.local("A", "f", u);
        assert_eq!(joined.ty, TokenType::Double);
        assert!(!joined.exact);
        // Before the branch, `u` has not been assigned.
        assert_eq!(map.local_at("A", "f", 2, u), Shape::unknown());
    }

    #[test]
    fn arithmetic_and_fields() {
        let p = program(
            "class A {
                field acc: Token;
                field k: Token;

                method <init>() {
                    local a: IntToken;
                    a = new IntToken;
                    specialinvoke a.<init>(2);
                    this.k = a;
                    return;
                }

                method step() {
                    local x: Token;
                    local y: Token;
                    local z: Token;
                    x = this.k;
                    y = new LongToken;
                    specialinvoke y.LongToken::<init>(5L);
                    z = virtualinvoke x.add(y);
                    this.acc = z;
                    return;
                }
            }",
        );
        let map = run(&p);
        assert_eq!(map.field(&FieldRef::new("A", "k")), Shape::exact(TokenType::Int));
        assert_eq!(map.field(&FieldRef::new("A", "acc")), Shape::exact(TokenType::Long));
        assert_eq!(map.max_depth(4), 0);
    }

    #[test]
    fn arrays_take_element_shapes_from_stores() {
        let p = program(
            "class A {
                field taps: ArrayToken;

                method <init>() {
                    local e: DoubleToken[];
                    local d: DoubleToken;
                    local t: ArrayToken;
                    e = newarray DoubleToken[1];
                    d = new DoubleToken;
                    specialinvoke d.<init>(0.5);
                    e[0] = d;
                    t = new ArrayToken;
                    specialinvoke t.<init>(e);
                    this.taps = t;
                    return;
                }

                method fire(): Token {
                    local t: ArrayToken;
                    local x: Token;
                    t = this.taps;
                    x = virtualinvoke t.getElement(0);
                    return x;
                }
            }",
        );
        let map = run(&p);
        let taps = map.field(&FieldRef::new("A", "taps"));
        assert_eq!(taps, Shape::exact(TokenType::array_of(TokenType::Double)));
        let fire = p.method("A", "fire").unwrap();
        let x = fire.local_by_name("x").unwrap();
        assert_eq!(map.local("A", "fire", x), Shape::exact(TokenType::Double));
        let init = p.method("A", "<init>").unwrap();
        let e = init.local_by_name("e").unwrap();
        assert_eq!(
            map.elements(&ArrayKey::local("A", "<init>", e)),
            Shape::exact(TokenType::Double)
        );
        assert_eq!(map.max_depth(4), 1);
    }

    #[test]
    fn dynamic_values_are_general() {
        let p = program(
            "class A {
                method f(): Token {
                    local t: Token;
                    t = staticinvoke Expression::evaluate(null, \"1 + 2\");
                    return t;
                }
            }",
        );
        let map = run(&p);
        let t = p.method("A", "f").unwrap().local_by_name("t").unwrap();
        assert_eq!(map.local("A", "f", t), Shape::general());
    }
}
