// exec.rs — Reference interpreter for programs over an actor graph
//
// Instantiates one object per entity, port and entity attribute, wires ports
// through the graph's relations and runs the top-level lifecycle. Used to
// check that a specialized program behaves like the unspecialized one: both
// are run on the same inputs and their traces (every token sent through every
// port, in order) must be equal.
//
// Runtime natives:
//   - `IOPort` moves tokens between per-channel FIFO receivers. Channel `c`
//     of a port is its `c`-th relation on the side it faces.
//   - `CompositeActor` lifecycle methods direct the children: the scheduled
//     firings (or every child once, in declaration order, without a
//     schedule), with the same transfers and postfire conjunction that
//     schedule inlining generates.
//   - `Actor.getAttribute/getPort` return the instantiated graph objects.
//   - `Expression.evaluate` evaluates attribute expression text in the scope
//     of an actor, reading run-time attribute state.
//
// Fields the program no longer declares (removed as dead) are not set.
//
// Preconditions: the program's generated classes follow `generated_class_name`.
// Postconditions: none.
// Failure modes: null receivers, reading an empty receiver, array bounds,
//   unknown natives and an exhausted step budget → `SpecializeError::Execution`.
// Side effects: none outside the interpreter.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{Result, SpecializeError};
use crate::expr::{evaluate_text, lookup_in_scope, EvalError, GraphEvaluator, Value};
use crate::id::{AttrId, EntityId, Label, PortId, RelationId};
use crate::inline_schedule::{CONSUMPTION_RATE, PRODUCTION_RATE};
use crate::ir::{
    fold_binary, fold_cast, fold_unary, BinOp, Call, CallKind, Constant, FieldRef, IrType, Method,
    MethodKind, Operand, Place, Program, Rvalue, Stmt,
};
use crate::library::{ARRAY_TOKEN_CLASS, PORT_CLASS};
use crate::model::{ActorGraph, AttrOwner, AttributeKind, Direction};
use crate::resolve::{token_class, EXPR_SLOT_PREFIX, TOKEN_SLOT_PREFIX};
use crate::scaffold::{generated_class_name, identifier};
use crate::schedule::{BoundSchedule, ScheduleSet};

/// Statements executed before a run is abandoned.
pub const DEFAULT_STEP_LIMIT: u64 = 50_000_000;
const MAX_CALL_DEPTH: usize = 256;
const MAX_EVAL_DEPTH: usize = 64;

/// Run-time value.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Const(Constant),
    Obj(usize),
    Arr(usize),
}

impl Val {
    const NULL: Val = Val::Const(Constant::Null);
}

#[derive(Debug, Clone)]
struct Object {
    class: String,
    fields: HashMap<String, Val>,
}

/// Observable behavior of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    /// Tokens sent through each port, by full port name.
    pub sent: BTreeMap<String, Vec<Value>>,
    /// Completed iterations.
    pub iterations: usize,
}

type Queues = HashMap<(PortId, usize), VecDeque<Val>>;

pub struct Interpreter<'p> {
    program: &'p Program,
    graph: &'p ActorGraph,
    schedules: &'p ScheduleSet,
    objects: Vec<Object>,
    arrays: Vec<Vec<Val>>,
    statics: HashMap<FieldRef, Val>,
    entity_object: HashMap<EntityId, usize>,
    object_entity: HashMap<usize, EntityId>,
    port_object: HashMap<PortId, usize>,
    object_port: HashMap<usize, PortId>,
    attribute_object: HashMap<AttrId, usize>,
    outside: Queues,
    inside: Queues,
    postfire: HashMap<EntityId, bool>,
    sent: BTreeMap<String, Vec<Value>>,
    steps: u64,
    step_limit: u64,
    depth: usize,
}

fn exec_error(message: impl Into<String>) -> SpecializeError {
    SpecializeError::execution(message)
}

impl<'p> Interpreter<'p> {
    /// Instantiate the graph: run every `<clinit>`, create and wire all
    /// objects, then run each entity's `<init>` in pre-order.
    pub fn new(
        program: &'p Program,
        graph: &'p ActorGraph,
        schedules: &'p ScheduleSet,
    ) -> Result<Self> {
        let mut it = Interpreter {
            program,
            graph,
            schedules,
            objects: Vec::new(),
            arrays: Vec::new(),
            statics: HashMap::new(),
            entity_object: HashMap::new(),
            object_entity: HashMap::new(),
            port_object: HashMap::new(),
            object_port: HashMap::new(),
            attribute_object: HashMap::new(),
            outside: HashMap::new(),
            inside: HashMap::new(),
            postfire: HashMap::new(),
            sent: BTreeMap::new(),
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
            depth: 0,
        };
        it.initialize_statics()?;
        it.instantiate()?;
        Ok(it)
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    fn initialize_statics(&mut self) -> Result<()> {
        let program = self.program;
        for (name, class) in &program.classes {
            for f in class.fields.iter().filter(|f| f.is_static) {
                self.statics
                    .insert(FieldRef::new(name, &f.name), Val::Const(f.ty.default_constant()));
            }
        }
        for (name, class) in &program.classes {
            if let Some(m) = class.method("<clinit>") {
                self.call(name, m, None, Vec::new())?;
            }
        }
        Ok(())
    }

    fn instantiate(&mut self) -> Result<()> {
        let graph = self.graph;
        let entities = graph.entities_preorder();
        for &e in &entities {
            let class = generated_class_name(graph, e);
            let obj = self.alloc(&class)?;
            self.entity_object.insert(e, obj);
            self.object_entity.insert(obj, e);
        }

        let mut evaluator = GraphEvaluator::new(graph);
        for &e in &entities {
            let obj = self.entity_object[&e];
            let entity = graph.entity(e);
            self.set_if_declared(obj, "_name", Val::Const(Constant::Str(entity.name.clone())));
            if let Some(parent) = entity.container {
                let p = self.entity_object[&parent];
                self.set_if_declared(obj, "_container", Val::Obj(p));
            }
            for &c in &entity.entities {
                let child = self.entity_object[&c];
                self.set_if_declared(obj, &identifier(&graph.entity(c).name), Val::Obj(child));
            }
            for &p in &entity.ports {
                if self.program.class(PORT_CLASS).is_none() {
                    break;
                }
                let port = self.alloc(PORT_CLASS)?;
                let name = Val::Const(Constant::Str(graph.port(p).name.clone()));
                self.set_if_declared(port, "_name", name);
                self.set_if_declared(port, "_container", Val::Obj(obj));
                self.port_object.insert(p, port);
                self.object_port.insert(port, p);
                self.set_if_declared(obj, &identifier(&graph.port(p).name), Val::Obj(port));
            }
            for &a in graph.attributes_of(AttrOwner::Entity(e)) {
                let attr = graph.attribute(a);
                let class = attr.kind.runtime_class();
                if self.program.class(class).is_none() {
                    continue;
                }
                let ao = self.alloc(class)?;
                self.set_if_declared(ao, "_name", Val::Const(Constant::Str(attr.name.clone())));
                self.set_if_declared(ao, "_container", Val::Obj(obj));
                self.set_if_declared(
                    ao,
                    "_expression",
                    Val::Const(Constant::Str(attr.expression.clone())),
                );
                if attr.kind.is_settable() && !attr.dynamic {
                    if let Ok(v) = evaluator.value(a) {
                        let token = self.token_of(&v)?;
                        self.set_if_declared(ao, "_token", token);
                    }
                }
                self.attribute_object.insert(a, ao);
                self.set_if_declared(obj, &identifier(&attr.name), Val::Obj(ao));
            }
        }

        let program = self.program;
        for &e in &entities {
            let obj = self.entity_object[&e];
            let class = self.objects[obj].class.clone();
            if let Some((decl, m)) = program.lookup_method(&class, "<init>") {
                if m.params.is_empty() && m.has_body() {
                    self.call(&decl, m, Some(Val::Obj(obj)), Vec::new())?;
                }
            }
        }
        Ok(())
    }

    /// Queue tokens on a channel of a port of the top-level composite.
    pub fn feed(&mut self, port: &str, channel: usize, values: &[Value]) -> Result<()> {
        let root = self.graph.root();
        let p = self
            .graph
            .port_by_name(root, port)
            .ok_or_else(|| exec_error(format!("no top-level port `{}`", port)))?;
        for v in values {
            let token = self.token_of(v)?;
            self.outside.entry((p, channel)).or_default().push_back(token);
        }
        Ok(())
    }

    /// Run the top-level lifecycle for at most `iterations` iterations.
    pub fn run(&mut self, iterations: usize) -> Result<Trace> {
        self.steps = 0;
        let top = self.entity_object[&self.graph.root()];
        self.lifecycle(top, "preinitialize")?;
        self.lifecycle(top, "initialize")?;
        let mut done = 0;
        while done < iterations {
            done += 1;
            if !self.lifecycle_flag(top, "prefire")? {
                continue;
            }
            self.lifecycle(top, "fire")?;
            if !self.lifecycle_flag(top, "postfire")? {
                break;
            }
        }
        self.lifecycle(top, "wrapup")?;
        Ok(Trace {
            sent: std::mem::take(&mut self.sent),
            iterations: done,
        })
    }

    // ── Objects ─────────────────────────────────────────────────────────────

    fn alloc(&mut self, class: &str) -> Result<usize> {
        if self.program.class(class).is_none() {
            return Err(exec_error(format!("cannot instantiate unknown class `{}`", class)));
        }
        let mut fields = HashMap::new();
        for f in self.program.instance_fields(class) {
            let init = self
                .program
                .field_type(&f)
                .map(IrType::default_constant)
                .unwrap_or(Constant::Null);
            fields.insert(f.name, Val::Const(init));
        }
        self.objects.push(Object {
            class: class.to_string(),
            fields,
        });
        Ok(self.objects.len() - 1)
    }

    fn set_if_declared(&mut self, obj: usize, field: &str, value: Val) {
        let o = &mut self.objects[obj];
        if let Some(slot) = o.fields.get_mut(field) {
            *slot = value;
        }
    }

    fn field_of(&self, obj: usize, field: &str) -> Option<&Val> {
        self.objects[obj].fields.get(field)
    }

    /// Token object holding `value`.
    fn token_of(&mut self, value: &Value) -> Result<Val> {
        let payload = match value {
            Value::Array(items) => {
                let elems = items
                    .iter()
                    .map(|v| self.token_of(v))
                    .collect::<Result<Vec<_>>>()?;
                self.arrays.push(elems);
                Val::Arr(self.arrays.len() - 1)
            }
            scalar => Val::Const(scalar.to_constant().unwrap_or(Constant::Null)),
        };
        let class = match value {
            Value::Array(_) => ARRAY_TOKEN_CLASS,
            scalar => token_class(&scalar.token_type()),
        };
        let obj = self.alloc(class)?;
        self.objects[obj].fields.insert("_value".to_string(), payload);
        Ok(Val::Obj(obj))
    }

    /// Value carried by a token object.
    fn value_of(&self, token: &Val) -> Result<Value> {
        let Val::Obj(obj) = token else {
            return Err(exec_error(format!("`{:?}` is not a token", token)));
        };
        let o = &self.objects[*obj];
        match o.fields.get("_value") {
            Some(Val::Arr(a)) if self.program.is_subclass_of(&o.class, ARRAY_TOKEN_CLASS) => {
                self.arrays[*a]
                    .iter()
                    .map(|t| self.value_of(t))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array)
            }
            Some(Val::Const(c)) => Value::from_constant(c)
                .ok_or_else(|| exec_error(format!("token of class `{}` holds null", o.class))),
            _ => Err(exec_error(format!("object of class `{}` is not a token", o.class))),
        }
    }

    // ── Attributes ──────────────────────────────────────────────────────────

    /// Current value of an attribute: its slot if the owner still has one,
    /// else the token of its attribute object, else its expression.
    fn attribute_value(&self, attr: AttrId, depth: usize) -> std::result::Result<Value, EvalError> {
        let graph = self.graph;
        if depth > MAX_EVAL_DEPTH {
            return Err(EvalError::Cycle(graph.attribute_full_name(attr)));
        }
        let a = graph.attribute(attr);
        let owner = self.entity_object[&graph.owner_entity(attr)];
        let path = identifier(&graph.relative_path(attr));
        let failed = |e: SpecializeError| EvalError::Type(e.to_string());
        let slot = format!("{}{}", TOKEN_SLOT_PREFIX, path);
        if let Some(t @ Val::Obj(_)) = self.field_of(owner, &slot) {
            return self.value_of(t).map_err(failed);
        }
        if let Some(Val::Const(Constant::Str(text))) =
            self.field_of(owner, &format!("{}{}", EXPR_SLOT_PREFIX, path))
        {
            return self.evaluate_in(a.owner, text, depth + 1);
        }
        if let Some(t @ Val::Obj(_)) = self
            .attribute_object
            .get(&attr)
            .and_then(|o| self.field_of(*o, "_token"))
        {
            return self.value_of(t).map_err(failed);
        }
        let raw = if a.kind == AttributeKind::StringParameter {
            Value::Str(a.expression.clone())
        } else {
            self.evaluate_in(a.owner, &a.expression, depth + 1)?
        };
        match &a.declared_type {
            Some(ty) => raw
                .convert(ty)
                .ok_or_else(|| EvalError::Type(format!("`{}` does not convert to {}", raw, ty))),
            None => Ok(raw),
        }
    }

    fn evaluate_in(
        &self,
        scope: AttrOwner,
        text: &str,
        depth: usize,
    ) -> std::result::Result<Value, EvalError> {
        evaluate_text(text, &mut |name| {
            match lookup_in_scope(self.graph, scope, name, None) {
                Some(dep) => self.attribute_value(dep, depth),
                None => Err(EvalError::UnknownName(name.to_string())),
            }
        })
    }

    fn rate(&self, port: PortId, name: &str) -> Result<usize> {
        let Some(attr) = self.graph.attribute_by_name(AttrOwner::Port(port), name) else {
            return Ok(1);
        };
        self.attribute_value(attr, 0)
            .ok()
            .and_then(|v| v.as_int())
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                exec_error(format!(
                    "`{}` of port `{}` is not a non-negative integer",
                    name,
                    self.graph.port_full_name(port)
                ))
            })
    }

    // ── Method execution ────────────────────────────────────────────────────

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(exec_error(format!("step budget of {} exhausted", self.step_limit)));
        }
        Ok(())
    }

    fn call(
        &mut self,
        class: &str,
        method: &'p Method,
        this: Option<Val>,
        args: Vec<Val>,
    ) -> Result<Option<Val>> {
        match method.kind {
            MethodKind::Abstract => {
                return Err(exec_error(format!("call of abstract `{}.{}`", class, method.name)))
            }
            MethodKind::Native { .. } => return self.native(class, &method.name, this, args),
            MethodKind::Concrete => {}
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(exec_error(format!("call depth exceeded in `{}.{}`", class, method.name)));
        }
        let mut frame: Vec<Val> = method
            .locals
            .iter()
            .map(|l| Val::Const(l.ty.default_constant()))
            .collect();
        if let (Some(t), Some(v)) = (method.this(), this) {
            frame[t.index()] = v;
        }
        if args.len() != method.params.len() {
            return Err(exec_error(format!(
                "`{}.{}` expects {} arguments, got {}",
                class,
                method.name,
                method.params.len(),
                args.len()
            )));
        }
        for (p, v) in method.params.iter().zip(args) {
            frame[p.index()] = v;
        }
        let labels: HashMap<Label, usize> = method
            .body
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Stmt::Label(l) => Some((*l, i)),
                _ => None,
            })
            .collect();
        let jump = |l: &Label| {
            labels
                .get(l)
                .copied()
                .ok_or_else(|| exec_error(format!("missing label in `{}.{}`", class, method.name)))
        };

        self.depth += 1;
        let mut pc = 0;
        let result = loop {
            let Some(stmt) = method.body.get(pc) else {
                break Ok(None);
            };
            if let Err(e) = self.tick() {
                break Err(e);
            }
            let step = match stmt {
                Stmt::Assign { dest, value } => self
                    .rvalue(&frame, value)
                    .and_then(|v| self.store(&mut frame, dest, v))
                    .map(|_| None),
                Stmt::Invoke(c) => self.invoke(&frame, c).map(|_| None),
                Stmt::If { op, lhs, rhs, target } => {
                    let (a, b) = (self.operand(&frame, lhs), self.operand(&frame, rhs));
                    match self.binary(*op, &a, &b) {
                        Ok(Val::Const(Constant::Bool(true))) => jump(target).map(Some),
                        Ok(Val::Const(Constant::Bool(false))) => Ok(None),
                        Ok(other) => Err(exec_error(format!("branch on `{:?}`", other))),
                        Err(e) => Err(e),
                    }
                }
                Stmt::Goto(l) => jump(l).map(Some),
                Stmt::Label(_) | Stmt::Nop => Ok(None),
                Stmt::Return(v) => break Ok(v.as_ref().map(|op| self.operand(&frame, op))),
                Stmt::ArrayCopy {
                    src,
                    src_pos,
                    dst,
                    dst_pos,
                    len,
                } => self
                    .array_copy(
                        &frame[src.index()],
                        Self::index(&self.operand(&frame, src_pos)),
                        &frame[dst.index()],
                        Self::index(&self.operand(&frame, dst_pos)),
                        Self::index(&self.operand(&frame, len)),
                    )
                    .map(|_| None),
            };
            match step {
                Ok(Some(target)) => pc = target,
                Ok(None) => pc += 1,
                Err(e) => break Err(e),
            }
        };
        self.depth -= 1;
        result
    }

    fn operand(&self, frame: &[Val], op: &Operand) -> Val {
        match op {
            Operand::Local(l) => frame[l.index()].clone(),
            Operand::Const(c) => Val::Const(c.clone()),
        }
    }

    fn index(v: &Val) -> Result<usize> {
        match v {
            Val::Const(Constant::Int(i)) => {
                usize::try_from(*i).map_err(|_| exec_error(format!("negative index {}", i)))
            }
            other => Err(exec_error(format!("`{:?}` is not an index", other))),
        }
    }

    fn object(&self, v: &Val, what: &str) -> Result<usize> {
        match v {
            Val::Obj(o) => Ok(*o),
            _ => Err(exec_error(format!("{} on `{:?}`", what, v))),
        }
    }

    fn array(&self, v: &Val, what: &str) -> Result<usize> {
        match v {
            Val::Arr(a) => Ok(*a),
            _ => Err(exec_error(format!("{} on `{:?}`", what, v))),
        }
    }

    fn static_key(&self, field: &FieldRef) -> FieldRef {
        match self.program.lookup_field(&field.class, &field.name) {
            Some((owner, _)) => FieldRef::new(&owner, &field.name),
            None => field.clone(),
        }
    }

    fn load(&self, frame: &[Val], place: &Place) -> Result<Val> {
        match place {
            Place::Local(l) => Ok(frame[l.index()].clone()),
            Place::Field { base, field } => {
                let o = self.object(&frame[base.index()], &format!("read of `{}`", field.name))?;
                self.field_of(o, &field.name).cloned().ok_or_else(|| {
                    exec_error(format!(
                        "object of class `{}` has no field `{}`",
                        self.objects[o].class, field.name
                    ))
                })
            }
            Place::Static(field) => Ok(self
                .statics
                .get(&self.static_key(field))
                .cloned()
                .unwrap_or(Val::NULL)),
            Place::Elem { base, index } => {
                let a = self.array(&frame[base.index()], "element read")?;
                let i = Self::index(&self.operand(frame, index))?;
                self.arrays[a]
                    .get(i)
                    .cloned()
                    .ok_or_else(|| exec_error(format!("index {} out of bounds", i)))
            }
        }
    }

    fn store(&mut self, frame: &mut [Val], place: &Place, value: Val) -> Result<()> {
        match place {
            Place::Local(l) => frame[l.index()] = value,
            Place::Field { base, field } => {
                let o = self.object(&frame[base.index()], &format!("write of `{}`", field.name))?;
                self.objects[o].fields.insert(field.name.clone(), value);
            }
            Place::Static(field) => {
                let key = self.static_key(field);
                self.statics.insert(key, value);
            }
            Place::Elem { base, index } => {
                let a = self.array(&frame[base.index()], "element write")?;
                let i = Self::index(&self.operand(frame, index))?;
                let slot = self.arrays[a]
                    .get_mut(i)
                    .ok_or_else(|| exec_error(format!("index {} out of bounds", i)))?;
                *slot = value;
            }
        }
        Ok(())
    }

    fn array_copy(
        &mut self,
        src: &Val,
        src_pos: Result<usize>,
        dst: &Val,
        dst_pos: Result<usize>,
        len: Result<usize>,
    ) -> Result<()> {
        let (s, d) = (self.array(src, "arraycopy")?, self.array(dst, "arraycopy")?);
        let (sp, dp, n) = (src_pos?, dst_pos?, len?);
        let chunk = self.arrays[s]
            .get(sp..sp + n)
            .map(<[Val]>::to_vec)
            .ok_or_else(|| exec_error("arraycopy source out of bounds"))?;
        let target = self.arrays[d]
            .get_mut(dp..dp + n)
            .ok_or_else(|| exec_error("arraycopy target out of bounds"))?;
        target.clone_from_slice(&chunk);
        Ok(())
    }

    fn binary(&self, op: BinOp, a: &Val, b: &Val) -> Result<Val> {
        match (a, b) {
            (Val::Const(x), Val::Const(y)) => fold_binary(op, x, y)
                .map(Val::Const)
                .ok_or_else(|| exec_error(format!("cannot evaluate {} {} {}", x, op.symbol(), y))),
            _ => match op {
                BinOp::Eq => Ok(Val::Const(Constant::Bool(a == b))),
                BinOp::Ne => Ok(Val::Const(Constant::Bool(a != b))),
                _ => Err(exec_error(format!("`{}` on references", op.symbol()))),
            },
        }
    }

    fn rvalue(&mut self, frame: &[Val], value: &Rvalue) -> Result<Val> {
        match value {
            Rvalue::Use(op) => Ok(self.operand(frame, op)),
            Rvalue::Load(place) => self.load(frame, place),
            Rvalue::Binary(op, a, b) => {
                self.binary(*op, &self.operand(frame, a), &self.operand(frame, b))
            }
            Rvalue::Unary(op, a) => match self.operand(frame, a) {
                Val::Const(c) => fold_unary(*op, &c)
                    .map(Val::Const)
                    .ok_or_else(|| exec_error(format!("cannot apply unary operator to {}", c))),
                other => Err(exec_error(format!("unary operator on `{:?}`", other))),
            },
            Rvalue::New(class) => self.alloc(class).map(Val::Obj),
            Rvalue::NewArray(ty, n) => {
                let n = Self::index(&self.operand(frame, n))?;
                self.arrays.push(vec![Val::Const(ty.default_constant()); n]);
                Ok(Val::Arr(self.arrays.len() - 1))
            }
            Rvalue::Length(l) => {
                let a = self.array(&frame[l.index()], "lengthof")?;
                Ok(Val::Const(Constant::Int(self.arrays[a].len() as i32)))
            }
            Rvalue::Cast(ty, op) => match self.operand(frame, op) {
                Val::Const(c) => fold_cast(ty, &c)
                    .map(Val::Const)
                    .ok_or_else(|| exec_error(format!("cannot cast {} to {}", c, ty))),
                Val::Obj(o) => match ty.class_name() {
                    Some(c) if !self.program.is_subclass_of(&self.objects[o].class, c) => Err(
                        exec_error(format!("`{}` is not a `{}`", self.objects[o].class, c)),
                    ),
                    _ => Ok(Val::Obj(o)),
                },
                arr => Ok(arr),
            },
            Rvalue::InstanceOf(class, op) => {
                let r = match self.operand(frame, op) {
                    Val::Obj(o) => self.program.is_subclass_of(&self.objects[o].class, class),
                    _ => false,
                };
                Ok(Val::Const(Constant::Bool(r)))
            }
            Rvalue::Call(c) => self
                .invoke(frame, c)?
                .ok_or_else(|| exec_error(format!("`{}` returned no value", c.method.name))),
        }
    }

    fn invoke(&mut self, frame: &[Val], call: &Call) -> Result<Option<Val>> {
        let args: Vec<Val> = call.args.iter().map(|a| self.operand(frame, a)).collect();
        let receiver = call.receiver.map(|r| frame[r.index()].clone());
        let start = match (call.kind, &receiver) {
            (CallKind::Virtual, Some(r)) => {
                let o = self.object(r, &format!("call of `{}`", call.method.name))?;
                self.objects[o].class.clone()
            }
            _ => call.method.class.clone(),
        };
        let program = self.program;
        let (decl, method) = program.lookup_method(&start, &call.method.name).ok_or_else(|| {
            exec_error(format!("no method `{}` in `{}`", call.method.name, start))
        })?;
        self.call(&decl, method, receiver, args)
    }

    /// Call a lifecycle method of an object by dynamic dispatch.
    fn lifecycle(&mut self, obj: usize, name: &str) -> Result<Option<Val>> {
        let program = self.program;
        let class = self.objects[obj].class.clone();
        let (decl, method) = program
            .lookup_method(&class, name)
            .ok_or_else(|| exec_error(format!("`{}` has no `{}`", class, name)))?;
        self.call(&decl, method, Some(Val::Obj(obj)), Vec::new())
    }

    fn lifecycle_flag(&mut self, obj: usize, name: &str) -> Result<bool> {
        match self.lifecycle(obj, name)? {
            Some(Val::Const(Constant::Bool(b))) => Ok(b),
            other => Err(exec_error(format!("`{}` returned `{:?}`", name, other))),
        }
    }

    // ── Natives ─────────────────────────────────────────────────────────────

    fn native(
        &mut self,
        class: &str,
        name: &str,
        this: Option<Val>,
        args: Vec<Val>,
    ) -> Result<Option<Val>> {
        let receiver = this.as_ref().map(|t| self.object(t, name)).transpose()?;
        let int_arg = |i: usize| -> Result<usize> {
            args.get(i)
                .ok_or_else(|| exec_error(format!("`{}` is missing argument {}", name, i)))
                .and_then(Self::index)
        };
        match (class, name) {
            ("Actor", "getAttribute") | ("Actor", "getPort") => {
                let e = self.entity_of(receiver)?;
                let Some(Val::Const(Constant::Str(wanted))) = args.first() else {
                    return Err(exec_error(format!("`{}` needs a name", name)));
                };
                let found = if name == "getAttribute" {
                    self.graph
                        .attribute_by_name(AttrOwner::Entity(e), wanted)
                        .and_then(|a| self.attribute_object.get(&a))
                } else {
                    self.graph
                        .port_by_name(e, wanted)
                        .and_then(|p| self.port_object.get(&p))
                };
                Ok(Some(found.map_or(Val::NULL, |o| Val::Obj(*o))))
            }
            ("CompositeActor", _) => {
                let e = self.entity_of(receiver)?;
                self.direct(e, name)
            }
            (PORT_CLASS, _) => {
                let p = receiver
                    .and_then(|o| self.object_port.get(&o).copied())
                    .ok_or_else(|| exec_error(format!("`{}` on an unbound port", name)))?;
                match name {
                    "get" => self.take(p, int_arg(0)?, Direction::Input).map(Some),
                    "getInside" => self.take(p, int_arg(0)?, Direction::Output).map(Some),
                    "send" | "sendInside" => {
                        let ch = int_arg(0)?;
                        let token = args
                            .get(1)
                            .cloned()
                            .ok_or_else(|| exec_error(format!("`{}` without a token", name)))?;
                        self.send(p, ch, token, name == "sendInside")?;
                        Ok(None)
                    }
                    "hasToken" | "hasTokenInside" => {
                        let queues = if name == "hasToken" { &self.outside } else { &self.inside };
                        let has = queues.get(&(p, int_arg(0)?)).is_some_and(|q| !q.is_empty());
                        Ok(Some(Val::Const(Constant::Bool(has))))
                    }
                    "getWidth" => {
                        let width = i32::try_from(self.graph.port(p).width)
                            .map_err(|_| exec_error("port width does not fit in an `int`"))?;
                        Ok(Some(Val::Const(Constant::Int(width))))
                    }
                    _ => Err(exec_error(format!("unknown port native `{}`", name))),
                }
            }
            ("Expression", "evaluate") => {
                let e = match args.first() {
                    Some(Val::Obj(o)) => self.entity_of(Some(*o))?,
                    _ => return Err(exec_error("`evaluate` without a scope")),
                };
                let Some(Val::Const(Constant::Str(text))) = args.get(1) else {
                    return Err(exec_error("`evaluate` without expression text"));
                };
                let value = self
                    .evaluate_in(AttrOwner::Entity(e), text, 0)
                    .map_err(|err| exec_error(format!("evaluating `{}`: {}", text, err)))?;
                self.token_of(&value).map(Some)
            }
            _ => Err(exec_error(format!("no runtime implementation of `{}.{}`", class, name))),
        }
    }

    fn entity_of(&self, obj: Option<usize>) -> Result<EntityId> {
        obj.and_then(|o| self.object_entity.get(&o).copied())
            .ok_or_else(|| exec_error("receiver is not an actor of the graph"))
    }

    /// Pop a token. `Input` reads what arrived from outside the port's
    /// entity, `Output` what arrived from inside it.
    fn take(&mut self, port: PortId, channel: usize, side: Direction) -> Result<Val> {
        let graph = self.graph;
        let queues = match side {
            Direction::Input => &mut self.outside,
            Direction::Output => &mut self.inside,
        };
        queues
            .get_mut(&(port, channel))
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                exec_error(format!(
                    "no token on channel {} of `{}`",
                    channel,
                    graph.port_full_name(port)
                ))
            })
    }

    fn send(&mut self, port: PortId, channel: usize, token: Val, inward: bool) -> Result<()> {
        let graph = self.graph;
        let links = if inward {
            graph.inside_links(port)
        } else {
            let value = self.value_of(&token)?;
            self.sent
                .entry(graph.port_full_name(port))
                .or_default()
                .push(value);
            graph.outside_links(port)
        };
        if let Some(&rel) = links.get(channel) {
            self.deliver(port, rel, &token);
        }
        Ok(())
    }

    fn deliver(&mut self, from: PortId, rel: RelationId, token: &Val) {
        let graph = self.graph;
        for &q in &graph.relation(rel).ports {
            if q == from {
                continue;
            }
            let inside = graph.is_inside_link(q, rel);
            let (queues, links) = match (graph.port(q).direction, inside) {
                (Direction::Input, false) => (&mut self.outside, graph.outside_links(q)),
                (Direction::Output, true) => (&mut self.inside, graph.inside_links(q)),
                _ => continue,
            };
            if let Some(ch) = links.iter().position(|r| *r == rel) {
                queues.entry((q, ch)).or_default().push_back(token.clone());
            }
        }
    }

    // ── Director ────────────────────────────────────────────────────────────

    fn direct(&mut self, composite: EntityId, name: &str) -> Result<Option<Val>> {
        let graph = self.graph;
        let schedule = match self.schedules.get(graph, composite) {
            Some(_) => self.schedules.bind(graph, composite)?,
            None => BoundSchedule::Dataflow(
                graph.entity(composite).entities.iter().map(|c| (*c, 1)).collect(),
            ),
        };
        let children: Vec<EntityId> = match &schedule {
            BoundSchedule::Dataflow(_) => graph.entity(composite).entities.clone(),
            BoundSchedule::Modal {
                controller,
                refinements,
            } => {
                let mut v = vec![*controller];
                v.extend(refinements.iter().copied().filter(|r| r != controller));
                v
            }
        };
        let bool_val = |b: bool| Some(Val::Const(Constant::Bool(b)));
        match (name, &schedule) {
            ("preinitialize" | "initialize" | "wrapup", _) => {
                for c in children {
                    let o = self.entity_object[&c];
                    self.lifecycle(o, name)?;
                }
                if name == "initialize" {
                    self.postfire.insert(composite, true);
                }
                Ok(None)
            }
            ("prefire", BoundSchedule::Dataflow(_)) => Ok(bool_val(true)),
            ("postfire", BoundSchedule::Dataflow(_)) => {
                Ok(bool_val(self.postfire.get(&composite).copied().unwrap_or(true)))
            }
            ("prefire" | "postfire", BoundSchedule::Modal { controller, .. }) => {
                let o = self.entity_object[controller];
                self.lifecycle_flag(o, name).map(bool_val)
            }
            ("fire", BoundSchedule::Dataflow(firings)) => {
                let mut flag = true;
                self.transfer(composite, Direction::Input, false)?;
                for &(actor, n) in firings {
                    let o = self.entity_object[&actor];
                    for _ in 0..n {
                        self.lifecycle(o, "prefire")?;
                        self.lifecycle(o, "fire")?;
                        flag &= self.lifecycle_flag(o, "postfire")?;
                    }
                }
                self.postfire.insert(composite, flag);
                self.transfer(composite, Direction::Output, false)?;
                Ok(None)
            }
            ("fire", BoundSchedule::Modal { controller, .. }) => {
                self.transfer(composite, Direction::Input, true)?;
                let o = self.entity_object[controller];
                self.lifecycle(o, "fire")?;
                self.transfer(composite, Direction::Output, true)?;
                Ok(None)
            }
            _ => Err(exec_error(format!("no director step `{}`", name))),
        }
    }

    fn transfer(&mut self, composite: EntityId, direction: Direction, guarded: bool) -> Result<()> {
        let graph = self.graph;
        let ports: Vec<PortId> = graph
            .entity(composite)
            .ports
            .iter()
            .copied()
            .filter(|p| graph.port(*p).direction == direction)
            .collect();
        let (rate_attr, inward) = match direction {
            Direction::Input => (CONSUMPTION_RATE, true),
            Direction::Output => (PRODUCTION_RATE, false),
        };
        for p in ports {
            for ch in 0..graph.port(p).width {
                let queues = if inward { &self.outside } else { &self.inside };
                let moves = if guarded {
                    usize::from(queues.get(&(p, ch)).is_some_and(|q| !q.is_empty()))
                } else {
                    self.rate(p, rate_attr)?
                };
                for _ in 0..moves {
                    let token = self.take(p, ch, direction)?;
                    self.send(p, ch, token, inward)?;
                }
            }
        }
        Ok(())
    }
}

/// Instantiate, feed and run in one step.
pub fn execute(
    program: &Program,
    graph: &ActorGraph,
    schedules: &ScheduleSet,
    inputs: &[(&str, usize, Vec<Value>)],
    iterations: usize,
) -> Result<Trace> {
    let mut it = Interpreter::new(program, graph, schedules)?;
    for (port, channel, values) in inputs {
        it.feed(port, *channel, values)?;
    }
    it.run(iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::runtime_library;
    use crate::lower::parse_ir;
    use crate::model::EntitySpec;
    use crate::scaffold::scaffold;
    use crate::schedule::{Firing, Schedule};

    const USER: &str = r#"
class Ramp extends Actor {
    field output: IOPort;
    field step: Parameter;
    field count: int;

    method fire() {
        local p: IOPort;
        local g: Parameter;
        local k: Token;
        local n: int;
        local t: IntToken;
        local r: Token;
        n = this.count;
        t = new IntToken;
        specialinvoke t.<init>(n);
        g = this.step;
        k = virtualinvoke g.getToken();
        r = virtualinvoke t.multiply(k);
        p = this.output;
        virtualinvoke p.send(0, r);
        return;
    }

    method postfire(): boolean {
        local n: int;
        local r: boolean;
        n = this.count;
        n = n + 1;
        this.count = n;
        r = n < 3;
        return r;
    }
}

class Relay extends Actor {
    field input: IOPort;
    field output: IOPort;

    method fire() {
        local p: IOPort;
        local q: IOPort;
        local t: Token;
        p = this.input;
        t = virtualinvoke p.get(0);
        q = this.output;
        virtualinvoke q.send(0, t);
        return;
    }
}
"#;

    const GRAPH: &str = r#"{
        "name": "top", "composite": true,
        "attributes": [{"name": "scale", "expression": "3"}],
        "ports": [{"name": "in", "direction": "input"},
                  {"name": "out", "direction": "output"},
                  {"name": "echo", "direction": "output"}],
        "entities": [
            {"name": "A", "class": "Ramp",
             "attributes": [{"name": "step", "expression": "scale * 2", "dynamic": true}],
             "ports": [{"name": "output", "direction": "output"}]},
            {"name": "B", "class": "Relay",
             "ports": [{"name": "input", "direction": "input"},
                       {"name": "output", "direction": "output"}]},
            {"name": "C", "class": "Relay",
             "ports": [{"name": "input", "direction": "input"},
                       {"name": "output", "direction": "output"}]}
        ],
        "relations": [
            {"name": "r0", "ports": ["A.output", "B.input"]},
            {"name": "r1", "ports": ["B.output", "out"]},
            {"name": "r2", "ports": ["in", "C.input"]},
            {"name": "r3", "ports": ["C.output", "echo"]}
        ]
    }"#;

    fn setup() -> (ActorGraph, Program) {
        let spec: EntitySpec = serde_json::from_str(GRAPH).unwrap();
        let graph = ActorGraph::from_spec(&spec).unwrap();
        let lib = runtime_library().unwrap();
        let user = parse_ir(USER, &lib).unwrap();
        let (program, _) = scaffold(&graph, &lib, &user).unwrap();
        (graph, program)
    }

    #[test]
    fn default_director_fires_children_in_order() {
        let (graph, program) = setup();
        let inputs = [("in", 0, vec![Value::Int(7), Value::Int(8), Value::Int(9)])];
        let trace = execute(&program, &graph, &ScheduleSet::new(), &inputs, 10).unwrap();
        assert_eq!(trace.iterations, 3);
        assert_eq!(
            trace.sent["top.out"],
            vec![Value::Int(0), Value::Int(6), Value::Int(12)]
        );
        assert_eq!(trace.sent["top.A.output"].len(), 3);
        assert_eq!(
            trace.sent["top.echo"],
            vec![Value::Int(7), Value::Int(8), Value::Int(9)]
        );
    }

    #[test]
    fn scheduled_repetitions_and_rates() {
        let (graph, program) = setup();
        let mut schedules = ScheduleSet::new();
        schedules.insert(
            "top",
            Schedule::Dataflow {
                firings: vec![
                    Firing { actor: "A".into(), repetitions: 2 },
                    Firing { actor: "B".into(), repetitions: 2 },
                    Firing { actor: "C".into(), repetitions: 1 },
                ],
            },
        );
        let inputs = [("in", 0, vec![Value::Int(1), Value::Int(2)])];
        let trace = execute(&program, &graph, &schedules, &inputs, 1).unwrap();
        assert_eq!(trace.sent["top.B.output"], vec![Value::Int(0), Value::Int(6)]);
        // One token leaves per iteration at the default production rate.
        assert_eq!(trace.sent["top.out"], vec![Value::Int(0)]);
        assert_eq!(trace.sent["top.echo"], vec![Value::Int(1)]);
    }

    #[test]
    fn empty_receiver_is_an_error() {
        let (graph, program) = setup();
        let err = execute(&program, &graph, &ScheduleSet::new(), &[], 1).unwrap_err();
        assert!(matches!(err, SpecializeError::Execution(_)));
        assert!(err.to_string().contains("top.in"), "{err}");
    }

    #[test]
    fn step_budget_stops_runaway_programs() {
        let (graph, program) = setup();
        let schedules = ScheduleSet::new();
        let mut it = Interpreter::new(&program, &graph, &schedules)
            .unwrap()
            .with_step_limit(10);
        it.feed("in", 0, &[Value::Int(1)]).unwrap();
        let err = it.run(1).unwrap_err();
        assert!(err.to_string().contains("step budget"), "{err}");
    }
}
