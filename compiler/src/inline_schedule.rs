// inline_schedule.rs — Lifecycle synthesis for scheduled composites
//
// Replaces the lifecycle methods of each composite's generated class by
// straight-line code derived from its schedule, innermost composite first.
//
// Dataflow `fire`:
//
//   flag = true
//   per input port and channel:   rate × { t = p.get(ch); p.sendInside(ch, t) }
//   per (actor, n):               n × { prefire; fire; flag = flag & postfire }
//   this._postfireReturns = flag
//   per output port and channel:  rate × { t = p.getInside(ch); p.send(ch, t) }
//
// Firings with `n < threshold` are unrolled, the others become counted loops.
// Port transfers are always counted loops. Mode-controller composites
// delegate every lifecycle step to the controller; their transfers move at
// most one token per channel and only when one is present.
//
// Preconditions: `program` was scaffolded and resolved for `graph`.
// Postconditions: every scheduled composite class defines the six lifecycle
//   methods with bodies.
// Failure modes: a schedule naming an unknown child, or a child without a
//   generated class or field → `SpecializeError::InternalConsistency`; a
//   non-constant transfer rate, or a count or rate beyond `int` →
//   `SpecializeError::Configuration`.
// Side effects: adds `_postfireReturns` and replaces lifecycle methods.

use tracing::debug;

use crate::error::{Result, SpecializeError};
use crate::id::{EntityId, Label, LocalId, PortId};
use crate::ir::{
    BinOp, Call, Constant, FieldRef, IrType, Method, Operand, Program, Rvalue, Stmt, TOKEN_CLASS,
};
use crate::library::{LIFECYCLE, PORT_CLASS};
use crate::model::{ActorGraph, AttrOwner, Direction};
use crate::resolve::ConstantValueMap;
use crate::scaffold::Bindings;
use crate::schedule::{BoundSchedule, Schedule, ScheduleSet};

/// Field carrying the conjunction of the children's `postfire` results
/// from `fire` to `postfire`.
pub const POSTFIRE_FIELD: &str = "_postfireReturns";

pub const CONSUMPTION_RATE: &str = "tokenConsumptionRate";
pub const PRODUCTION_RATE: &str = "tokenProductionRate";

#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    /// Repetition counts below this are unrolled.
    pub threshold: u32,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        ScheduleOptions { threshold: 2 }
    }
}

/// Synthesize the lifecycle of every scheduled composite. Returns the
/// number of composites rewritten.
pub fn inline(
    graph: &ActorGraph,
    program: &mut Program,
    bindings: &Bindings,
    schedules: &ScheduleSet,
    values: &ConstantValueMap,
    options: ScheduleOptions,
) -> Result<usize> {
    schedules.validate(graph)?;
    let mut count = 0;
    for composite in graph.composites_innermost_first() {
        if schedules.get(graph, composite).is_none() {
            continue;
        }
        let bound = schedules.bind(graph, composite)?;
        let inliner = Inliner {
            graph,
            program,
            bindings,
            values,
            options,
            composite,
            class: bindings.class_of(composite).to_string(),
        };
        let methods = inliner.synthesize(&bound)?;
        let class = program.class_mut(bindings.class_of(composite)).ok_or_else(|| {
            SpecializeError::internal(format!(
                "composite `{}` has no generated class",
                graph.full_name(composite)
            ))
        })?;
        if !class.has_field(POSTFIRE_FIELD) {
            class.add_field(POSTFIRE_FIELD, IrType::Bool);
        }
        for m in methods {
            class.put_method(m);
        }
        debug!(composite = %graph.full_name(composite), "lifecycle synthesized");
        count += 1;
    }
    Ok(count)
}

// ── Method builder ──────────────────────────────────────────────────────────

/// Appends statements to a fresh method body.
struct Builder {
    method: Method,
}

impl Builder {
    fn new(class: &str, name: &str, ret: IrType) -> Self {
        Builder {
            method: Method::new(class, name, ret),
        }
    }

    fn this(&self) -> LocalId {
        LocalId(0)
    }

    fn local(&mut self, name: &str, ty: IrType) -> LocalId {
        self.method.add_local(name, ty)
    }

    /// The local called `name`, created on first use.
    fn shared(&mut self, name: &str, ty: IrType) -> LocalId {
        match self.method.local_by_name(name) {
            Some(l) => l,
            None => self.local(name, ty),
        }
    }

    fn push(&mut self, stmt: Stmt) {
        self.method.body.push(stmt);
    }

    fn label(&mut self) -> Label {
        self.method.fresh_label()
    }

    /// `i = 0; head: if i >= n goto end; <body> i = i + 1; goto head; end:`
    fn counted_loop(&mut self, index: LocalId, n: i32, body: impl FnOnce(&mut Builder)) {
        let head = self.label();
        let end = self.label();
        self.push(Stmt::copy(index, Constant::Int(0)));
        self.push(Stmt::Label(head));
        self.push(Stmt::If {
            op: BinOp::Ge,
            lhs: Operand::Local(index),
            rhs: Operand::Const(Constant::Int(n)),
            target: end,
        });
        body(self);
        self.push(Stmt::assign(
            index,
            Rvalue::Binary(BinOp::Add, Operand::Local(index), Operand::Const(Constant::Int(1))),
        ));
        self.push(Stmt::Goto(head));
        self.push(Stmt::Label(end));
    }

    fn finish(mut self, value: Option<Operand>) -> Method {
        self.push(Stmt::Return(value));
        self.method
    }
}

// ── Synthesis ───────────────────────────────────────────────────────────────

struct Inliner<'a> {
    graph: &'a ActorGraph,
    program: &'a Program,
    bindings: &'a Bindings,
    values: &'a ConstantValueMap,
    options: ScheduleOptions,
    composite: EntityId,
    class: String,
}

impl Inliner<'_> {
    fn synthesize(&self, schedule: &BoundSchedule) -> Result<Vec<Method>> {
        match schedule {
            BoundSchedule::Dataflow(firings) => self.dataflow(firings),
            BoundSchedule::Modal {
                controller,
                refinements,
            } => self.modal(*controller, refinements),
        }
    }

    fn child_field(&self, child: EntityId) -> Result<(FieldRef, String)> {
        let field = self.bindings.child_field(child).ok_or_else(|| {
            SpecializeError::internal(format!(
                "actor `{}` has no field in `{}`",
                self.graph.full_name(child),
                self.class
            ))
        })?;
        let class = self.bindings.class_of(child).to_string();
        if self.program.class(&class).is_none() {
            return Err(SpecializeError::internal(format!(
                "actor `{}` has no generated class",
                self.graph.full_name(child)
            )));
        }
        Ok((field.clone(), class))
    }

    /// `local = this.<child>`; returns the local.
    fn load_child(&self, b: &mut Builder, child: EntityId) -> Result<LocalId> {
        let (field, class) = self.child_field(child)?;
        let l = b.local(&self.graph.entity(child).name, IrType::object(&class));
        let this = b.this();
        b.push(Stmt::load_field(l, this, field));
        Ok(l)
    }

    /// One call of `name` per child, in declaration order.
    fn each_child(&self, name: &str, children: &[EntityId]) -> Result<Method> {
        let mut b = Builder::new(&self.class, name, IrType::Void);
        for &c in children {
            let l = self.load_child(&mut b, c)?;
            let class = self.bindings.class_of(c);
            b.push(Stmt::Invoke(Call::virtual_call(l, class, name, vec![])));
        }
        Ok(b.finish(None))
    }

    /// `n` as an IR `int` bound, or a `Configuration` error naming `what`.
    fn int_bound<N>(&self, n: N, what: &str) -> Result<i32>
    where
        N: TryInto<i32> + Copy + std::fmt::Display,
    {
        n.try_into().map_err(|_| {
            SpecializeError::configuration(
                self.class.clone(),
                format!("{} {} does not fit in an `int`", what, n),
            )
        })
    }

    fn rate(&self, port: PortId, attribute: &str) -> Result<i32> {
        let Some(attr) = self.graph.attribute_by_name(AttrOwner::Port(port), attribute) else {
            return Ok(1);
        };
        let value = self
            .values
            .get(attr)
            .and_then(|e| e.value.constant())
            .and_then(|v| v.as_int())
            .and_then(|n| i32::try_from(n).ok())
            .filter(|n| *n >= 0);
        value.ok_or_else(|| {
            SpecializeError::configuration(
                self.class.clone(),
                format!(
                    "`{}` of port `{}` must be a non-negative `int` constant",
                    attribute,
                    self.graph.port_full_name(port)
                ),
            )
        })
    }

    fn ports(&self, direction: Direction) -> Vec<PortId> {
        self.graph
            .entity(self.composite)
            .ports
            .iter()
            .copied()
            .filter(|p| self.graph.port(*p).direction == direction)
            .collect()
    }

    /// Move tokens across the boundary of the composite. `guarded` moves at
    /// most one token per channel and only when one is present.
    fn transfer(&self, b: &mut Builder, direction: Direction, guarded: bool) -> Result<()> {
        let (read, write, present, rate_attr) = match direction {
            Direction::Input => ("get", "sendInside", "hasToken", CONSUMPTION_RATE),
            Direction::Output => ("getInside", "send", "hasTokenInside", PRODUCTION_RATE),
        };
        let ports = self.ports(direction);
        if ports.is_empty() {
            return Ok(());
        }
        let token = b.shared("token", IrType::object(TOKEN_CLASS));
        let index = b.shared("index", IrType::Int);
        for p in ports {
            let field = self.bindings.port_field(p).ok_or_else(|| {
                SpecializeError::internal(format!(
                    "port `{}` has no field",
                    self.graph.port_full_name(p)
                ))
            })?;
            let port = b.shared("port", IrType::object(PORT_CLASS));
            let this = b.this();
            b.push(Stmt::load_field(port, this, field.clone()));
            let width = self.int_bound(self.graph.port(p).width, "width")?;
            for ch in 0..width {
                let ch = Operand::Const(Constant::Int(ch));
                let moves = |b: &mut Builder| {
                    b.push(Stmt::assign(
                        token,
                        Rvalue::Call(Call::virtual_call(port, PORT_CLASS, read, vec![ch.clone()])),
                    ));
                    b.push(Stmt::Invoke(Call::virtual_call(
                        port,
                        PORT_CLASS,
                        write,
                        vec![ch.clone(), Operand::Local(token)],
                    )));
                };
                if guarded {
                    let has = b.shared("has", IrType::Bool);
                    let skip = b.label();
                    b.push(Stmt::assign(
                        has,
                        Rvalue::Call(Call::virtual_call(
                            port,
                            PORT_CLASS,
                            present,
                            vec![ch.clone()],
                        )),
                    ));
                    b.push(Stmt::If {
                        op: BinOp::Eq,
                        lhs: Operand::Local(has),
                        rhs: Operand::Const(Constant::Bool(false)),
                        target: skip,
                    });
                    moves(b);
                    b.push(Stmt::Label(skip));
                } else {
                    let rate = self.rate(p, rate_attr)?;
                    b.counted_loop(index, rate, moves);
                }
            }
        }
        Ok(())
    }

    fn dataflow(&self, firings: &[(EntityId, u32)]) -> Result<Vec<Method>> {
        let children = self.graph.entity(self.composite).entities.clone();
        let postfire_field = FieldRef::new(&self.class, POSTFIRE_FIELD);

        let preinitialize = self.each_child("preinitialize", &children)?;
        let wrapup = self.each_child("wrapup", &children)?;

        let mut initialize = self.each_child("initialize", &children)?;
        let this = initialize.this().unwrap_or(LocalId(0));
        initialize.body.insert(
            initialize.body.len() - 1,
            Stmt::store_field(this, postfire_field.clone(), Constant::Bool(true)),
        );

        let prefire = Builder::new(&self.class, "prefire", IrType::Bool)
            .finish(Some(Operand::Const(Constant::Bool(true))));

        let mut b = Builder::new(&self.class, "fire", IrType::Void);
        let flag = b.local("postfireReturns", IrType::Bool);
        b.push(Stmt::copy(flag, Constant::Bool(true)));
        self.transfer(&mut b, Direction::Input, false)?;
        let result = b.local("localPostfireReturns", IrType::Bool);
        for &(actor, n) in firings {
            let a = self.load_child(&mut b, actor)?;
            let class = self.bindings.class_of(actor).to_string();
            let iterate = |b: &mut Builder| {
                b.push(Stmt::Invoke(Call::virtual_call(a, &class, "prefire", vec![])));
                b.push(Stmt::Invoke(Call::virtual_call(a, &class, "fire", vec![])));
                b.push(Stmt::assign(
                    result,
                    Rvalue::Call(Call::virtual_call(a, &class, "postfire", vec![])),
                ));
                b.push(Stmt::assign(
                    flag,
                    Rvalue::Binary(BinOp::And, Operand::Local(flag), Operand::Local(result)),
                ));
            };
            if n < self.options.threshold {
                for _ in 0..n {
                    iterate(&mut b);
                }
            } else {
                let what = format!("repetition count of `{}`", self.graph.full_name(actor));
                let n = self.int_bound(n, &what)?;
                let index = b.shared("iteration", IrType::Int);
                b.counted_loop(index, n, iterate);
            }
        }
        let this = b.this();
        b.push(Stmt::store_field(this, postfire_field.clone(), flag));
        self.transfer(&mut b, Direction::Output, false)?;
        let fire = b.finish(None);

        let mut b = Builder::new(&self.class, "postfire", IrType::Bool);
        let r = b.local("postfireReturns", IrType::Bool);
        let this = b.this();
        b.push(Stmt::load_field(r, this, postfire_field));
        let postfire = b.finish(Some(Operand::Local(r)));

        Ok(vec![preinitialize, initialize, prefire, fire, postfire, wrapup])
    }

    fn modal(&self, controller: EntityId, refinements: &[EntityId]) -> Result<Vec<Method>> {
        let mut setup = vec![controller];
        setup.extend(refinements.iter().copied().filter(|r| *r != controller));
        let preinitialize = self.each_child("preinitialize", &setup)?;
        let initialize = self.each_child("initialize", &setup)?;
        let wrapup = self.each_child("wrapup", &setup)?;

        let ctrl_class = self.bindings.class_of(controller).to_string();
        let delegate = |name: &str| -> Result<Method> {
            let mut b = Builder::new(&self.class, name, IrType::Bool);
            let c = self.load_child(&mut b, controller)?;
            let r = b.local("result", IrType::Bool);
            b.push(Stmt::assign(
                r,
                Rvalue::Call(Call::virtual_call(c, &ctrl_class, name, vec![])),
            ));
            Ok(b.finish(Some(Operand::Local(r))))
        };
        let prefire = delegate("prefire")?;
        let postfire = delegate("postfire")?;

        let mut b = Builder::new(&self.class, "fire", IrType::Void);
        self.transfer(&mut b, Direction::Input, true)?;
        let c = self.load_child(&mut b, controller)?;
        b.push(Stmt::Invoke(Call::virtual_call(c, &ctrl_class, "fire", vec![])));
        self.transfer(&mut b, Direction::Output, true)?;
        let fire = b.finish(None);

        Ok(vec![preinitialize, initialize, prefire, fire, postfire, wrapup])
    }
}

// ── Certificate ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for lifecycle synthesis (L1-L2).
#[derive(Debug, Clone)]
pub struct LifecycleCert {
    /// L1: every scheduled composite defines each lifecycle method with a body.
    pub l1_lifecycle_defined: bool,
    /// L2: every dataflow composite declares the postfire flag.
    pub l2_flag_declared: bool,
}

impl crate::pass::StageCert for LifecycleCert {
    fn all_pass(&self) -> bool {
        self.l1_lifecycle_defined && self.l2_flag_declared
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("L1_lifecycle_defined", self.l1_lifecycle_defined),
            ("L2_flag_declared", self.l2_flag_declared),
        ]
    }
}

pub fn verify_lifecycle(
    graph: &ActorGraph,
    program: &Program,
    bindings: &Bindings,
    schedules: &ScheduleSet,
) -> LifecycleCert {
    let mut cert = LifecycleCert {
        l1_lifecycle_defined: true,
        l2_flag_declared: true,
    };
    for composite in graph.composites_innermost_first() {
        let Some(schedule) = schedules.get(graph, composite) else {
            continue;
        };
        let class = bindings.class_of(composite);
        cert.l1_lifecycle_defined &= LIFECYCLE
            .iter()
            .all(|m| program.method(class, m).is_some_and(|m| m.has_body()));
        if matches!(schedule, Schedule::Dataflow { .. }) {
            cert.l2_flag_declared &=
                program.class(class).is_some_and(|c| c.has_field(POSTFIRE_FIELD));
        }
    }
    cert
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::runtime_library;
    use crate::lower::parse_ir;
    use crate::model::EntitySpec;
    use crate::resolve::resolve;
    use crate::scaffold::scaffold;
    use crate::schedule::{Firing, Schedule};

    const USER: &str = r#"
class Source extends Actor {
    field output: IOPort;
}

class Sink extends Actor {
    field input: IOPort;
}

class Controller extends Actor {
    field count: int;

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
"#;

    fn setup(graph: &str) -> (ActorGraph, Program, Bindings, ConstantValueMap) {
        let spec: EntitySpec = serde_json::from_str(graph).unwrap();
        let graph = ActorGraph::from_spec(&spec).unwrap();
        let lib = runtime_library().unwrap();
        let user = parse_ir(USER, &lib).unwrap();
        let (mut program, bindings) = scaffold(&graph, &lib, &user).unwrap();
        let values = resolve(&graph, &mut program, &bindings).unwrap().values;
        (graph, program, bindings, values)
    }

    const PAIR: &str = r#"{
        "name": "top", "composite": true,
        "ports": [{"name": "in", "direction": "input", "width": 2,
                   "attributes": [{"name": "tokenConsumptionRate", "expression": "2"}]},
                  {"name": "out", "direction": "output"}],
        "entities": [
            {"name": "A", "class": "Source",
             "ports": [{"name": "output", "direction": "output"}]},
            {"name": "B", "class": "Sink",
             "ports": [{"name": "input", "direction": "input"}]}
        ]
    }"#;

    fn dataflow(a: u32, b: u32) -> ScheduleSet {
        let mut set = ScheduleSet::new();
        set.insert(
            "top",
            Schedule::Dataflow {
                firings: vec![
                    Firing {
                        actor: "A".into(),
                        repetitions: a,
                    },
                    Firing {
                        actor: "B".into(),
                        repetitions: b,
                    },
                ],
            },
        );
        set
    }

    #[test]
    fn unrolls_below_threshold_and_loops_above() {
        let (graph, mut program, bindings, values) = setup(PAIR);
        let options = ScheduleOptions::default();
        let n = inline(&graph, &mut program, &bindings, &dataflow(1, 3), &values, options).unwrap();
        assert_eq!(n, 1);
        let fire = program.method("CG_top", "fire").unwrap().to_string();
        assert_eq!(fire.matches("virtualinvoke A.fire()").count(), 1, "{fire}");
        assert_eq!(fire.matches("virtualinvoke B.fire()").count(), 1, "{fire}");
        assert!(fire.contains("if iteration >= 3 goto"), "{fire}");
        // Two input channels at rate 2, one output channel at rate 1.
        assert_eq!(fire.matches("if index >= 2 goto").count(), 2, "{fire}");
        assert_eq!(fire.matches("if index >= 1 goto").count(), 1, "{fire}");
        assert!(fire.contains("sendInside(1, token)"), "{fire}");
        let store = fire.find("this._postfireReturns = postfireReturns;").unwrap();
        let output = fire.find("getInside(0)").unwrap();
        assert!(store < output, "{fire}");
    }

    #[test]
    fn lifecycle_follows_declaration_order() {
        let (graph, mut program, bindings, values) = setup(PAIR);
        let options = ScheduleOptions::default();
        inline(&graph, &mut program, &bindings, &dataflow(2, 1), &values, options).unwrap();
        let init = program.method("CG_top", "initialize").unwrap().to_string();
        let a = init.find("A.initialize()").unwrap();
        let b = init.find("B.initialize()").unwrap();
        let flag = init.find("this._postfireReturns = true;").unwrap();
        assert!(a < b && b < flag, "{init}");
        let prefire = program.method("CG_top", "prefire").unwrap().to_string();
        assert!(prefire.contains("return true;"), "{prefire}");
        let postfire = program.method("CG_top", "postfire").unwrap().to_string();
        assert!(postfire.contains("postfireReturns = this._postfireReturns;"), "{postfire}");
        // A twice reaches the threshold.
        let fire = program.method("CG_top", "fire").unwrap().to_string();
        assert!(fire.contains("if iteration >= 2 goto"), "{fire}");
    }

    #[test]
    fn modal_composite_delegates_to_controller() {
        let (graph, mut program, bindings, values) = setup(
            r#"{
                "name": "top", "composite": true,
                "ports": [{"name": "in", "direction": "input"}],
                "entities": [
                    {"name": "ctrl", "class": "Controller"},
                    {"name": "A", "class": "Source",
                     "ports": [{"name": "output", "direction": "output"}]}
                ]
            }"#,
        );
        let mut set = ScheduleSet::new();
        set.insert(
            "top",
            serde_json::from_str(
                r#"{"modal": {"controller": "ctrl", "automaton": {
                    "states": [{"name": "s0", "refinement": "A"}]}}}"#,
            )
            .unwrap(),
        );
        inline(&graph, &mut program, &bindings, &set, &values, ScheduleOptions::default()).unwrap();
        let postfire = program.method("CG_top", "postfire").unwrap().to_string();
        assert!(postfire.contains("result = virtualinvoke ctrl.postfire();"), "{postfire}");
        assert!(postfire.contains("return result;"), "{postfire}");
        assert!(!postfire.contains("return true;"), "{postfire}");
        let fire = program.method("CG_top", "fire").unwrap().to_string();
        let present = fire.find("hasToken(0)").unwrap();
        let fired = fire.find("ctrl.fire()").unwrap();
        assert!(present < fired, "{fire}");
        let init = program.method("CG_top", "initialize").unwrap().to_string();
        assert!(init.find("ctrl.initialize()").unwrap() < init.find("A.initialize()").unwrap());
    }

    #[test]
    fn repetition_count_beyond_int_is_a_configuration_error() {
        let (graph, mut program, bindings, values) = setup(PAIR);
        let huge = i32::MAX as u32 + 1;
        let err = inline(
            &graph,
            &mut program,
            &bindings,
            &dataflow(1, huge),
            &values,
            ScheduleOptions::default(),
        )
        .unwrap_err();
        match err {
            SpecializeError::Configuration { message, .. } => {
                assert!(message.contains("repetition count of `top.B`"), "{message}");
                assert!(message.contains(&huge.to_string()), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Unrolled counts are never converted.
        let (graph, mut program, bindings, values) = setup(PAIR);
        let options = ScheduleOptions { threshold: 4 };
        inline(&graph, &mut program, &bindings, &dataflow(0, 3), &values, options).unwrap();
    }

    #[test]
    fn unknown_actor_is_fatal() {
        let (graph, mut program, bindings, values) = setup(PAIR);
        let mut set = ScheduleSet::new();
        set.insert(
            "top",
            Schedule::Dataflow {
                firings: vec![Firing {
                    actor: "ghost".into(),
                    repetitions: 1,
                }],
            },
        );
        let options = ScheduleOptions::default();
        let err = inline(&graph, &mut program, &bindings, &set, &values, options).unwrap_err();
        assert!(matches!(err, SpecializeError::InternalConsistency(_)));
    }
}
