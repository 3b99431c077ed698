// expr.rs — Attribute expression evaluation
//
// Attribute values are written in a small expression language (see
// `parser::parse_expr`). Evaluation produces a typed literal `Value`. Names
// are resolved by a caller-supplied lookup, so the same evaluator serves the
// static resolver (`GraphEvaluator`, which reads other attributes' expressions)
// and the interpreter (which reads run-time attribute state).
//
// Preconditions: none.
// Postconditions: arithmetic result types follow the token type lattice
//   (`Int + Double` is `Double`, `Int + Long` is `Long`).
// Failure modes: unknown names, type mismatches, integer division by zero,
//   dependency cycles and dynamic attributes produce `EvalError`.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::ast::{Expr, Literal};
use crate::id::AttrId;
use crate::ir::{BinOp, Constant};
use crate::lattice::{least_upper_bound, TokenType};
use crate::model::{ActorGraph, AttrOwner, AttributeKind};
use crate::parser::parse_expr;

// ── Values ──────────────────────────────────────────────────────────────────

/// A fully evaluated attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
    Array(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error in `{text}`: {message}")]
    Syntax { text: String, message: String },
    #[error("unknown name `{0}`")]
    UnknownName(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("`{0}` depends on itself")]
    Cycle(String),
    #[error("`{0}` is only known at run time")]
    Dynamic(String),
}

impl Value {
    /// Lattice type of this value; arrays take the LUB of their elements.
    pub fn token_type(&self) -> TokenType {
        match self {
            Value::Bool(_) => TokenType::Boolean,
            Value::Int(_) => TokenType::Int,
            Value::Long(_) => TokenType::Long,
            Value::Double(_) => TokenType::Double,
            Value::Str(_) => TokenType::String,
            Value::Array(items) => TokenType::array_of(
                items
                    .iter()
                    .fold(TokenType::Unknown, |acc, v| least_upper_bound(&acc, &v.token_type())),
            ),
        }
    }

    /// Lossless conversion to a (higher) lattice type, as done when a value
    /// is assigned to storage of a declared type.
    pub fn convert(&self, to: &TokenType) -> Option<Value> {
        match (self, to) {
            (_, TokenType::General | TokenType::Unknown) => Some(self.clone()),
            (Value::Bool(_), TokenType::Boolean)
            | (Value::Int(_), TokenType::Int | TokenType::Scalar)
            | (Value::Long(_), TokenType::Long | TokenType::Scalar)
            | (Value::Double(_), TokenType::Double | TokenType::Scalar)
            | (Value::Str(_), TokenType::String) => Some(self.clone()),
            (Value::Int(v), TokenType::Long) => Some(Value::Long(i64::from(*v))),
            (Value::Int(v), TokenType::Double) => Some(Value::Double(f64::from(*v))),
            (Value::Array(_), TokenType::String) => None,
            (v, TokenType::String) => Some(Value::Str(v.plain_string())),
            (Value::Array(items), TokenType::Array(elem)) => items
                .iter()
                .map(|v| v.convert(elem))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            _ => None,
        }
    }

    /// IR constant holding a scalar value.
    pub fn to_constant(&self) -> Option<Constant> {
        match self {
            Value::Bool(b) => Some(Constant::Bool(*b)),
            Value::Int(v) => Some(Constant::Int(*v)),
            Value::Long(v) => Some(Constant::Long(*v)),
            Value::Double(v) => Some(Constant::Double(*v)),
            Value::Str(s) => Some(Constant::Str(s.clone())),
            Value::Array(_) => None,
        }
    }

    pub fn from_constant(c: &Constant) -> Option<Value> {
        match c {
            Constant::Null => None,
            Constant::Bool(b) => Some(Value::Bool(*b)),
            Constant::Int(v) => Some(Value::Int(*v)),
            Constant::Long(v) => Some(Value::Long(*v)),
            Constant::Double(v) => Some(Value::Double(*v)),
            Constant::Str(s) => Some(Value::Str(s.clone())),
        }
    }

    /// Text without string quotes, used for string conversion.
    pub fn plain_string(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Array(items) => {
                write!(f, "{{")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")
            }
            scalar => match scalar.to_constant() {
                Some(c) => write!(f, "{}", c),
                None => Ok(()),
            },
        }
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────────

/// Parse an expression, mapping syntax errors into `EvalError`.
pub fn parse(text: &str) -> Result<Expr, EvalError> {
    let result = parse_expr(text);
    match result.output {
        Some(expr) if result.errors.is_empty() => Ok(expr),
        _ => Err(EvalError::Syntax {
            text: text.to_string(),
            message: result.error_message(),
        }),
    }
}

/// Evaluate `expr`, resolving names through `lookup`.
pub fn evaluate(
    expr: &Expr,
    lookup: &mut dyn FnMut(&str) -> Result<Value, EvalError>,
) -> Result<Value, EvalError> {
    match expr {
        Expr::Lit(lit, _) => literal(lit),
        Expr::Name(id) => lookup(&id.name),
        Expr::Array(items, _) => {
            let values = items
                .iter()
                .map(|e| evaluate(e, lookup))
                .collect::<Result<Vec<_>, _>>()?;
            // Elements are converted to their common type.
            let array = Value::Array(values);
            let common = array.token_type();
            Ok(array.convert(&common).unwrap_or(array))
        }
        Expr::Neg(inner, _) => negate(evaluate(inner, lookup)?),
        Expr::Binary(op, a, b, _) => {
            let a = evaluate(a, lookup)?;
            let b = evaluate(b, lookup)?;
            binary(*op, a, b)
        }
    }
}

/// Parse and evaluate in one step.
pub fn evaluate_text(
    text: &str,
    lookup: &mut dyn FnMut(&str) -> Result<Value, EvalError>,
) -> Result<Value, EvalError> {
    evaluate(&parse(text)?, lookup)
}

fn literal(lit: &Literal) -> Result<Value, EvalError> {
    match lit {
        Literal::Bool(b) => Ok(Value::Bool(*b)),
        Literal::Int(v) => Ok(Value::Int(*v)),
        Literal::Long(v) => Ok(Value::Long(*v)),
        Literal::Double(v) => Ok(Value::Double(*v)),
        Literal::Str(s) => Ok(Value::Str(s.clone())),
        Literal::Null => Err(EvalError::Type("`null` is not a value".to_string())),
    }
}

fn negate(v: Value) -> Result<Value, EvalError> {
    match v {
        Value::Int(x) => Ok(Value::Int(x.wrapping_neg())),
        Value::Long(x) => Ok(Value::Long(x.wrapping_neg())),
        Value::Double(x) => Ok(Value::Double(-x)),
        Value::Array(items) => items
            .into_iter()
            .map(negate)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Err(EvalError::Type(format!("cannot negate `{}`", other))),
    }
}

/// Apply an arithmetic operator. Arrays combine elementwise; an array and a
/// scalar combine by applying the scalar to every element.
pub fn binary(op: BinOp, a: Value, b: Value) -> Result<Value, EvalError> {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            if xs.len() != ys.len() {
                return Err(EvalError::Type(format!(
                    "array lengths differ ({} and {})",
                    xs.len(),
                    ys.len()
                )));
            }
            xs.into_iter()
                .zip(ys)
                .map(|(x, y)| binary(op, x, y))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        (Value::Array(xs), y) => xs
            .into_iter()
            .map(|x| binary(op, x, y.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (x, Value::Array(ys)) => ys
            .into_iter()
            .map(|y| binary(op, x.clone(), y))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (Value::Str(x), y) if op == BinOp::Add => Ok(Value::Str(x + &y.plain_string())),
        (x, Value::Str(y)) if op == BinOp::Add => Ok(Value::Str(x.plain_string() + &y)),
        (x, y) => scalar_binary(op, x, y),
    }
}

fn scalar_binary(op: BinOp, a: Value, b: Value) -> Result<Value, EvalError> {
    let common = least_upper_bound(&a.token_type(), &b.token_type());
    let mismatch =
        || EvalError::Type(format!("cannot apply `{}` to `{}` and `{}`", op.symbol(), a, b));
    let target = match common {
        TokenType::Int | TokenType::Long | TokenType::Double => common,
        // Long with Double has no lossless common type; compute in double.
        TokenType::Scalar => TokenType::Double,
        _ => return Err(mismatch()),
    };
    let x = a.convert(&target).or_else(|| to_double(&a)).ok_or_else(mismatch)?;
    let y = b.convert(&target).or_else(|| to_double(&b)).ok_or_else(mismatch)?;
    match (x, y) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div if y == 0 => return Err(EvalError::DivisionByZero),
            BinOp::Div => x.wrapping_div(y),
            _ => return Err(mismatch()),
        })),
        (Value::Long(x), Value::Long(y)) => Ok(Value::Long(match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div if y == 0 => return Err(EvalError::DivisionByZero),
            BinOp::Div => x.wrapping_div(y),
            _ => return Err(mismatch()),
        })),
        (Value::Double(x), Value::Double(y)) => Ok(Value::Double(match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            _ => return Err(mismatch()),
        })),
        _ => Err(mismatch()),
    }
}

fn to_double(v: &Value) -> Option<Value> {
    match v {
        Value::Int(x) => Some(Value::Double(f64::from(*x))),
        Value::Long(x) => Some(Value::Double(*x as f64)),
        Value::Double(x) => Some(Value::Double(*x)),
        _ => None,
    }
}

// ── Scope ───────────────────────────────────────────────────────────────────

/// Find the attribute a name refers to, starting among the attributes of
/// `start` and walking out through enclosing ports, entities and composites.
pub fn lookup_in_scope(
    graph: &ActorGraph,
    start: AttrOwner,
    name: &str,
    exclude: Option<AttrId>,
) -> Option<AttrId> {
    let mut owner = Some(start);
    while let Some(o) = owner {
        if let Some(found) = graph
            .attributes_of(o)
            .iter()
            .copied()
            .find(|a| Some(*a) != exclude && graph.attribute(*a).name == name)
        {
            return Some(found);
        }
        owner = match o {
            AttrOwner::Attribute(a) => Some(graph.attribute(a).owner),
            AttrOwner::Port(p) => Some(AttrOwner::Entity(graph.port(p).entity)),
            AttrOwner::Entity(e) => graph.entity(e).container.map(AttrOwner::Entity),
        };
    }
    None
}

/// Static evaluator over the attribute expressions of a graph, memoized per
/// attribute. Dynamic attributes and anything depending on them fail with
/// `EvalError::Dynamic`.
pub struct GraphEvaluator<'g> {
    graph: &'g ActorGraph,
    memo: HashMap<AttrId, Result<Value, EvalError>>,
    in_progress: Vec<AttrId>,
}

impl<'g> GraphEvaluator<'g> {
    pub fn new(graph: &'g ActorGraph) -> Self {
        GraphEvaluator {
            graph,
            memo: HashMap::new(),
            in_progress: Vec::new(),
        }
    }

    pub fn value(&mut self, attr: AttrId) -> Result<Value, EvalError> {
        if let Some(done) = self.memo.get(&attr) {
            return done.clone();
        }
        if self.in_progress.contains(&attr) {
            return Err(EvalError::Cycle(self.graph.attribute_full_name(attr)));
        }
        self.in_progress.push(attr);
        let result = self.compute(attr);
        self.in_progress.pop();
        self.memo.insert(attr, result.clone());
        result
    }

    fn compute(&mut self, attr: AttrId) -> Result<Value, EvalError> {
        let graph = self.graph;
        let a = graph.attribute(attr);
        if a.dynamic {
            return Err(EvalError::Dynamic(graph.attribute_full_name(attr)));
        }
        let raw = if a.kind == AttributeKind::StringParameter {
            Value::Str(a.expression.clone())
        } else {
            let owner = a.owner;
            evaluate_text(&a.expression, &mut |name| {
                match lookup_in_scope(graph, owner, name, Some(attr)) {
                    Some(dep) => self.value(dep),
                    None => Err(EvalError::UnknownName(name.to_string())),
                }
            })?
        };
        match &a.declared_type {
            Some(ty) => raw.convert(ty).ok_or_else(|| {
                EvalError::Type(format!("`{}` does not convert to {}", raw, ty))
            }),
            None => Ok(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntitySpec;

    fn eval(text: &str) -> Result<Value, EvalError> {
        evaluate_text(text, &mut |name| match name {
            "gain" => Ok(Value::Double(2.0)),
            "n" => Ok(Value::Int(3)),
            other => Err(EvalError::UnknownName(other.to_string())),
        })
    }

    #[test]
    fn arithmetic_follows_lattice() {
        assert_eq!(eval("1 + 2").unwrap(), Value::Int(3));
        assert_eq!(eval("n * gain").unwrap(), Value::Double(6.0));
        assert_eq!(eval("2L + 1").unwrap(), Value::Long(3));
        assert_eq!(eval("-(n - 5)").unwrap(), Value::Int(2));
        assert_eq!(eval("\"a\" + n").unwrap(), Value::Str("a3".into()));
    }

    #[test]
    fn arrays_convert_to_common_type() {
        assert_eq!(
            eval("{1, 2.5}").unwrap(),
            Value::Array(vec![Value::Double(1.0), Value::Double(2.5)])
        );
        assert_eq!(
            eval("{1, 2} * n").unwrap(),
            Value::Array(vec![Value::Int(3), Value::Int(6)])
        );
        assert_eq!(
            eval("{1.0, 2.0}").unwrap().token_type(),
            TokenType::array_of(TokenType::Double)
        );
    }

    #[test]
    fn errors() {
        assert_eq!(eval("x + 1"), Err(EvalError::UnknownName("x".into())));
        assert_eq!(eval("1 / 0"), Err(EvalError::DivisionByZero));
        assert!(matches!(eval("true + 1"), Err(EvalError::Type(_))));
        assert!(matches!(eval("1 +"), Err(EvalError::Syntax { .. })));
    }

    #[test]
    fn conversion() {
        assert_eq!(Value::Int(2).convert(&TokenType::Double), Some(Value::Double(2.0)));
        assert_eq!(Value::Double(2.0).convert(&TokenType::Int), None);
        assert_eq!(Value::Long(2).convert(&TokenType::Double), None);
        assert_eq!(Value::Int(7).convert(&TokenType::String), Some(Value::Str("7".into())));
        assert_eq!(Value::Double(0.5).to_string(), "0.5");
        assert_eq!(Value::Long(4).to_string(), "4L");
    }

    fn graph() -> ActorGraph {
        let spec: EntitySpec = serde_json::from_str(
            r#"{"name": "top",
                "attributes": [{"name": "base", "expression": "2"},
                               {"name": "label", "kind": "string_parameter", "expression": "x + y"},
                               {"name": "loop1", "expression": "loop2"},
                               {"name": "loop2", "expression": "loop1"},
                               {"name": "live", "expression": "1", "dynamic": true}],
                "entities": [{"name": "A", "class": "Scale",
                    "attributes": [{"name": "factor", "expression": "base * 1.5", "type": "double"},
                                   {"name": "base", "expression": "base + 1", "type": "double"},
                                   {"name": "uses_live", "expression": "live + 1"}]}]}"#,
        )
        .unwrap();
        ActorGraph::from_spec(&spec).unwrap()
    }

    #[test]
    fn graph_scope_and_memo() {
        let g = graph();
        let a = g.entity_by_path("top.A").unwrap();
        let factor = g.attribute_by_name(AttrOwner::Entity(a), "factor").unwrap();
        let inner_base = g.attribute_by_name(AttrOwner::Entity(a), "base").unwrap();
        let mut ev = GraphEvaluator::new(&g);
        // The inner `base` shadows the outer one for `factor`, and refers to
        // the outer one itself.
        assert_eq!(ev.value(inner_base).unwrap(), Value::Double(3.0));
        assert_eq!(ev.value(factor).unwrap(), Value::Double(4.5));
        let label = g.attribute_by_name(AttrOwner::Entity(g.root()), "label").unwrap();
        assert_eq!(ev.value(label).unwrap(), Value::Str("x + y".into()));
    }

    #[test]
    fn graph_cycles_and_dynamic() {
        let g = graph();
        let root = AttrOwner::Entity(g.root());
        let mut ev = GraphEvaluator::new(&g);
        let loop1 = g.attribute_by_name(root, "loop1").unwrap();
        assert!(matches!(ev.value(loop1), Err(EvalError::Cycle(_))));
        let a = g.entity_by_path("top.A").unwrap();
        let uses_live = g.attribute_by_name(AttrOwner::Entity(a), "uses_live").unwrap();
        assert!(matches!(ev.value(uses_live), Err(EvalError::Dynamic(_))));
    }
}
