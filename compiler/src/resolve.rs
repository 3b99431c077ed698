// resolve.rs — Constant-value resolution of actor attributes
//
// Folds every settable attribute reachable from the root to a value and gives
// it a storage slot in the generated class of its nearest enclosing entity:
// `_CGToken_<path>` holding the token for constants, `_CGExpr_<path>` holding
// the expression text for values only known at run time. `<path>` is the
// attribute's name relative to that entity (`gain`, `input_tokenConsumptionRate`).
// The slots are initialized at the end of the owner's `<init>`.
//
// Preconditions: `program` was produced by `scaffold` for `graph`.
// Postconditions: one slot per settable attribute; each slot written exactly
//   once, by the owner's `<init>`.
// Failure modes: two attributes mapping to the same slot, or a slot colliding
//   with an existing field → `SpecializeError::Configuration`. Expressions that
//   cannot be folded are not errors; they become dynamic with `W0304`.
// Side effects: adds fields and `<init>` code to generated classes.

use std::collections::{BTreeMap, HashMap};

use crate::diag::{codes, Diagnostic, Location};
use crate::error::{Result, SpecializeError};
use crate::expr::{EvalError, GraphEvaluator, Value};
use crate::id::{AttrId, LocalId};
use crate::ir::{
    Call, Constant, FieldRef, IrType, Method, Operand, Place, Program, Rvalue, Stmt,
};
use crate::lattice::TokenType;
use crate::library::{ARRAY_TOKEN_CLASS, BOOLEAN_TOKEN_CLASS};
use crate::model::ActorGraph;
use crate::scaffold::{identifier, Bindings};

// ── Public types ────────────────────────────────────────────────────────────

/// Folded value of an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    ConstantScalar(Value),
    ConstantComposite(Value),
    /// Expression text, evaluated at run time.
    DynamicExpression(String),
}

impl AttributeValue {
    pub fn constant(&self) -> Option<&Value> {
        match self {
            AttributeValue::ConstantScalar(v) | AttributeValue::ConstantComposite(v) => Some(v),
            AttributeValue::DynamicExpression(_) => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, AttributeValue::DynamicExpression(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueEntry {
    pub value: AttributeValue,
    /// Generated class holding the slot.
    pub owner: String,
    pub slot: FieldRef,
}

/// Attribute → folded value and slot. Each attribute is entered once.
#[derive(Debug, Clone, Default)]
pub struct ConstantValueMap {
    entries: BTreeMap<AttrId, ValueEntry>,
    by_slot: HashMap<FieldRef, AttrId>,
}

impl ConstantValueMap {
    pub fn get(&self, attr: AttrId) -> Option<&ValueEntry> {
        self.entries.get(&attr)
    }

    pub fn attribute_of_slot(&self, slot: &FieldRef) -> Option<AttrId> {
        self.by_slot.get(slot).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttrId, &ValueEntry)> {
        self.entries.iter().map(|(a, e)| (*a, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, attr: AttrId, entry: ValueEntry) -> Result<()> {
        if let Some(other) = self.by_slot.get(&entry.slot) {
            return Err(SpecializeError::configuration(
                entry.owner.clone(),
                format!(
                    "attributes {} and {} both map to slot `{}`",
                    other.0, attr.0, entry.slot.name
                ),
            ));
        }
        self.by_slot.insert(entry.slot.clone(), attr);
        self.entries.insert(attr, entry);
        Ok(())
    }
}

/// Result of constant-value resolution.
#[derive(Debug)]
pub struct ResolveResult {
    pub values: ConstantValueMap,
    pub diagnostics: Vec<Diagnostic>,
}

pub const TOKEN_SLOT_PREFIX: &str = "_CGToken_";
pub const EXPR_SLOT_PREFIX: &str = "_CGExpr_";

// ── Resolution ──────────────────────────────────────────────────────────────

/// Fold every settable attribute and create its slot.
pub fn resolve(
    graph: &ActorGraph,
    program: &mut Program,
    bindings: &Bindings,
) -> Result<ResolveResult> {
    let mut evaluator = GraphEvaluator::new(graph);
    let mut values = ConstantValueMap::default();
    let mut diagnostics = Vec::new();
    // Initialization code per owner class, in attribute order.
    let mut inits: BTreeMap<String, Vec<(FieldRef, AttributeValue)>> = BTreeMap::new();

    for attr in graph.attributes_preorder() {
        let a = graph.attribute(attr);
        if !a.kind.is_settable() {
            continue;
        }
        let owner = bindings.class_of(graph.owner_entity(attr)).to_string();
        let path = identifier(&graph.relative_path(attr));
        let value = match evaluator.value(attr) {
            Ok(v @ Value::Array(_)) => AttributeValue::ConstantComposite(v),
            Ok(v) => AttributeValue::ConstantScalar(v),
            Err(e) => {
                if !matches!(e, EvalError::Dynamic(_)) || !a.dynamic {
                    diagnostics.push(
                        Diagnostic::warning(
                            codes::W0304,
                            Location::class(owner.clone()),
                            format!(
                                "attribute `{}` stays dynamic: {}",
                                graph.attribute_full_name(attr),
                                e
                            ),
                        )
                        .with_hint("its value is evaluated from the expression text at run time"),
                    );
                }
                AttributeValue::DynamicExpression(a.expression.clone())
            }
        };
        let (slot_name, slot_type) = match value.constant() {
            Some(v) => (
                format!("{}{}", TOKEN_SLOT_PREFIX, path),
                IrType::object(token_class(&v.token_type())),
            ),
            None => (format!("{}{}", EXPR_SLOT_PREFIX, path), IrType::Str),
        };
        if program.lookup_field(&owner, &slot_name).is_some() {
            return Err(SpecializeError::configuration(
                owner,
                format!("slot `{}` collides with an existing field", slot_name),
            ));
        }
        let slot = FieldRef::new(&owner, &slot_name);
        values.insert(
            attr,
            ValueEntry {
                value: value.clone(),
                owner: owner.clone(),
                slot: slot.clone(),
            },
        )?;
        program
            .class_mut(&owner)
            .ok_or_else(|| {
                SpecializeError::internal(format!("missing generated class `{}`", owner))
            })?
            .add_field(&slot_name, slot_type);
        inits.entry(owner).or_default().push((slot, value));
    }

    for (owner, slots) in inits {
        append_to_init(program, &owner, |method, code| {
            let this = method
                .this()
                .ok_or_else(|| SpecializeError::internal("`<init>` without `this`"))?;
            for (slot, value) in &slots {
                let operand = match value {
                    AttributeValue::DynamicExpression(text) => {
                        Operand::Const(Constant::Str(text.clone()))
                    }
                    AttributeValue::ConstantScalar(v) | AttributeValue::ConstantComposite(v) => {
                        Operand::Local(construct_token(method, v, code))
                    }
                };
                code.push(Stmt::store_field(this, slot.clone(), operand));
            }
            Ok(())
        })?;
    }

    Ok(ResolveResult {
        values,
        diagnostics,
    })
}

/// Library class of tokens of type `ty`; types without a concrete class use
/// the closest abstract one.
pub fn token_class(ty: &TokenType) -> &'static str {
    ty.token_class().unwrap_or("Token")
}

/// Emit code constructing the token for `value`; returns the local holding it.
pub fn construct_token(method: &mut Method, value: &Value, code: &mut Vec<Stmt>) -> LocalId {
    match value {
        Value::Bool(b) => {
            let t = method.add_local("cst", IrType::object(BOOLEAN_TOKEN_CLASS));
            let sentinel = if *b { "TRUE" } else { "FALSE" };
            code.push(Stmt::assign(
                t,
                Rvalue::Load(Place::Static(FieldRef::new(BOOLEAN_TOKEN_CLASS, sentinel))),
            ));
            t
        }
        Value::Array(items) => {
            let elem = value
                .token_type()
                .element()
                .cloned()
                .unwrap_or(TokenType::Unknown);
            let elem_class = token_class(&elem);
            let arr = method.add_local("elems", IrType::array(IrType::object(elem_class)));
            code.push(Stmt::assign(
                arr,
                Rvalue::NewArray(
                    IrType::object(elem_class),
                    Operand::Const(Constant::Int(items.len() as i32)),
                ),
            ));
            for (i, item) in items.iter().enumerate() {
                let e = construct_token(method, item, code);
                code.push(Stmt::Assign {
                    dest: Place::Elem {
                        base: arr,
                        index: Operand::Const(Constant::Int(i as i32)),
                    },
                    value: Rvalue::Use(Operand::Local(e)),
                });
            }
            let t = method.add_local("cst", IrType::object(ARRAY_TOKEN_CLASS));
            code.push(Stmt::assign(t, Rvalue::New(ARRAY_TOKEN_CLASS.to_string())));
            code.push(Stmt::Invoke(Call::special_call(
                t,
                ARRAY_TOKEN_CLASS,
                "<init>",
                vec![Operand::Local(arr)],
            )));
            t
        }
        scalar => {
            let class = token_class(&scalar.token_type());
            let t = method.add_local("cst", IrType::object(class));
            code.push(Stmt::assign(t, Rvalue::New(class.to_string())));
            let arg = scalar.to_constant().unwrap_or(Constant::Null);
            code.push(Stmt::Invoke(Call::special_call(
                t,
                class,
                "<init>",
                vec![Operand::Const(arg)],
            )));
            t
        }
    }
}

/// Run `emit` to produce code appended at every normal exit of the class's own
/// `<init>`, creating a constructor that chains to the superclass's when the
/// class has none.
pub fn append_to_init(
    program: &mut Program,
    class_name: &str,
    emit: impl FnOnce(&mut Method, &mut Vec<Stmt>) -> Result<()>,
) -> Result<()> {
    let class = program
        .class(class_name)
        .ok_or_else(|| SpecializeError::internal(format!("missing class `{}`", class_name)))?;
    let mut method = match class.method("<init>") {
        Some(m) => m.clone(),
        None => {
            let mut m = Method::new(class_name, "<init>", IrType::Void);
            let this = LocalId(0);
            let parent = class
                .superclass
                .as_deref()
                .and_then(|s| program.lookup_method(s, "<init>"))
                .filter(|(_, m)| m.params.is_empty() && m.has_body());
            if let Some((decl, _)) = parent {
                m.body
                    .push(Stmt::Invoke(Call::special_call(this, &decl, "<init>", vec![])));
            }
            m.body.push(Stmt::Return(None));
            m
        }
    };
    let end = method.fresh_label();
    for stmt in &mut method.body {
        if *stmt == Stmt::Return(None) {
            *stmt = Stmt::Goto(end);
        }
    }
    let mut code = Vec::new();
    emit(&mut method, &mut code)?;
    method.body.push(Stmt::Label(end));
    method.body.extend(code);
    method.body.push(Stmt::Return(None));
    program
        .class_mut(class_name)
        .ok_or_else(|| SpecializeError::internal(format!("missing class `{}`", class_name)))?
        .put_method(method);
    Ok(())
}

// ── Certificate ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for resolution postconditions (R1-R2).
#[derive(Debug, Clone)]
pub struct ResolveCert {
    /// R1: every slot is a declared field of its owner class.
    pub r1_slots_declared: bool,
    /// R2: every settable attribute has an entry.
    pub r2_settable_resolved: bool,
}

impl crate::pass::StageCert for ResolveCert {
    fn all_pass(&self) -> bool {
        self.r1_slots_declared && self.r2_settable_resolved
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("R1_slots_declared", self.r1_slots_declared),
            ("R2_settable_resolved", self.r2_settable_resolved),
        ]
    }
}

pub fn verify_resolve(
    graph: &ActorGraph,
    program: &Program,
    values: &ConstantValueMap,
) -> ResolveCert {
    ResolveCert {
        r1_slots_declared: values
            .iter()
            .all(|(_, e)| program.lookup_field(&e.slot.class, &e.slot.name).is_some()),
        r2_settable_resolved: graph
            .attributes_preorder()
            .into_iter()
            .filter(|a| graph.attribute(*a).kind.is_settable())
            .all(|a| values.get(a).is_some()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::runtime_library;
    use crate::model::{AttrOwner, EntitySpec};
    use crate::scaffold::scaffold;

    fn setup(json: &str) -> (ActorGraph, Program, Bindings) {
        let spec: EntitySpec = serde_json::from_str(json).unwrap();
        let graph = ActorGraph::from_spec(&spec).unwrap();
        let lib = runtime_library().unwrap();
        let (program, bindings) = scaffold(&graph, &lib, &Program::new()).unwrap();
        (graph, program, bindings)
    }

    #[test]
    fn constant_slots_are_initialized() {
        let (graph, mut program, bindings) = setup(
            r#"{"name": "top", "composite": true,
                "attributes": [{"name": "gain", "expression": "2", "type": "double"},
                               {"name": "taps", "expression": "{1.0, 2.0}"},
                               {"name": "on", "expression": "true"},
                               {"name": "note", "kind": "attribute", "expression": "x"}],
                "ports": [{"name": "in", "direction": "input",
                           "attributes": [{"name": "tokenConsumptionRate", "expression": "2"}]}]}"#,
        );
        let result = resolve(&graph, &mut program, &bindings).unwrap();
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.values.len(), 4);

        let gain = graph.attribute_by_name(AttrOwner::Entity(graph.root()), "gain").unwrap();
        let entry = result.values.get(gain).unwrap();
        assert_eq!(entry.value, AttributeValue::ConstantScalar(Value::Double(2.0)));
        assert_eq!(entry.slot, FieldRef::new("CG_top", "_CGToken_gain"));
        assert_eq!(result.values.attribute_of_slot(&entry.slot), Some(gain));

        let class = program.class("CG_top").unwrap();
        assert_eq!(class.field("_CGToken_gain").unwrap().ty, IrType::object("DoubleToken"));
        assert_eq!(class.field("_CGToken_taps").unwrap().ty, IrType::object("ArrayToken"));
        assert!(class.has_field("_CGToken_in_tokenConsumptionRate"));
        assert!(!class.has_field("_CGToken_note"));

        let init = class.method("<init>").unwrap();
        let printed = init.to_string();
        assert!(printed.contains("specialinvoke this.Actor::<init>();"), "{printed}");
        assert!(printed.contains("specialinvoke cst.<init>(2.0);"), "{printed}");
        assert!(printed.contains("elems = newarray DoubleToken[2];"), "{printed}");
        assert!(printed.contains("cst$4 = BooleanToken::TRUE;"), "{printed}");
        assert!(printed.contains("this._CGToken_gain = cst;"), "{printed}");
        assert!(printed.trim_end().ends_with("return;\n    }"), "{printed}");
    }

    #[test]
    fn unresolvable_expressions_stay_dynamic() {
        let (graph, mut program, bindings) = setup(
            r#"{"name": "top", "composite": true,
                "attributes": [{"name": "a", "expression": "missing + 1"},
                               {"name": "b", "expression": "3", "dynamic": true}]}"#,
        );
        let result = resolve(&graph, &mut program, &bindings).unwrap();
        // Only the unexpected one is reported.
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, Some(codes::W0304));
        let a = graph.attribute_by_name(AttrOwner::Entity(graph.root()), "a").unwrap();
        let entry = result.values.get(a).unwrap();
        assert_eq!(entry.value, AttributeValue::DynamicExpression("missing + 1".into()));
        assert_eq!(entry.slot.name, "_CGExpr_a");
        let init = program.method("CG_top", "<init>").unwrap();
        assert!(init.to_string().contains("this._CGExpr_a = \"missing + 1\";"));
    }

    #[test]
    fn slot_clash_is_a_configuration_error() {
        let (graph, mut program, bindings) = setup(
            r#"{"name": "top", "composite": true,
                "attributes": [{"name": "a_b", "expression": "1"},
                               {"name": "a", "expression": "1",
                                "attributes": [{"name": "b", "expression": "2"}]}]}"#,
        );
        let err = resolve(&graph, &mut program, &bindings).unwrap_err();
        assert!(matches!(err, SpecializeError::Configuration { .. }));
    }
}
