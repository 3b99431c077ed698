// ir.rs — Statement-level, three-address program representation
//
// A `Program` is a set of classes: runtime library classes plus one generated
// class per actor-graph node. Method bodies are flat statement lists with
// explicit labels and jumps, so positions stay stable while passes rewrite
// statements in place (dead statements become `Nop` and are swept later).
// The `Display` impls print the textual form accepted by `lower::parse_ir`.
//
// Preconditions: none.
// Postconditions: printing then parsing a program yields an equivalent one.
// Failure modes: none (lookups return `Option`).
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use crate::id::{Label, LocalId};

// ── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IrType {
    Void,
    Bool,
    Int,
    Long,
    Double,
    Str,
    Object(String),
    Array(Box<IrType>),
}

impl IrType {
    pub fn object(name: &str) -> IrType {
        IrType::Object(name.to_string())
    }

    pub fn array(elem: IrType) -> IrType {
        IrType::Array(Box::new(elem))
    }

    pub fn class_name(&self) -> Option<&str> {
        match self {
            IrType::Object(name) => Some(name),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<&IrType> {
        match self {
            IrType::Array(e) => Some(e),
            _ => None,
        }
    }

    /// Value a field or array slot of this type holds before any write.
    pub fn default_constant(&self) -> Constant {
        match self {
            IrType::Bool => Constant::Bool(false),
            IrType::Int => Constant::Int(0),
            IrType::Long => Constant::Long(0),
            IrType::Double => Constant::Double(0.0),
            IrType::Void | IrType::Str | IrType::Object(_) | IrType::Array(_) => Constant::Null,
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::Bool => write!(f, "boolean"),
            IrType::Int => write!(f, "int"),
            IrType::Long => write!(f, "long"),
            IrType::Double => write!(f, "double"),
            IrType::Str => write!(f, "string"),
            IrType::Object(name) => write!(f, "{}", name),
            IrType::Array(elem) => write!(f, "{}[]", elem),
        }
    }
}

// ── Operands ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Long(v) => write!(f, "{}L", v),
            Constant::Double(v) => write!(f, "{:?}", v),
            Constant::Str(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                write!(f, "\"")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Local(LocalId),
    Const(Constant),
}

impl Operand {
    pub fn as_local(&self) -> Option<LocalId> {
        match self {
            Operand::Local(l) => Some(*l),
            Operand::Const(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Operand::Const(Constant::Null))
    }
}

impl From<LocalId> for Operand {
    fn from(l: LocalId) -> Self {
        Operand::Local(l)
    }
}

impl From<Constant> for Operand {
    fn from(c: Constant) -> Self {
        Operand::Const(c)
    }
}

/// Reference to a field: owning class plus field name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
    pub class: String,
    pub name: String,
}

impl FieldRef {
    pub fn new(class: &str, name: &str) -> Self {
        Self {
            class: class.to_string(),
            name: name.to_string(),
        }
    }
}

/// Reference to a method: the class where lookup starts plus the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRef {
    pub class: String,
    pub name: String,
}

impl MethodRef {
    pub fn new(class: &str, name: &str) -> Self {
        Self {
            class: class.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    Local(LocalId),
    Field { base: LocalId, field: FieldRef },
    Static(FieldRef),
    Elem { base: LocalId, index: Operand },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    /// Comparison with the opposite outcome.
    pub fn negate(self) -> Option<BinOp> {
        match self {
            BinOp::Eq => Some(BinOp::Ne),
            BinOp::Ne => Some(BinOp::Eq),
            BinOp::Lt => Some(BinOp::Ge),
            BinOp::Le => Some(BinOp::Gt),
            BinOp::Gt => Some(BinOp::Le),
            BinOp::Ge => Some(BinOp::Lt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Dispatch on the runtime class of the receiver.
    Virtual,
    /// Exact target (constructors, super calls).
    Special,
    Static,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    pub receiver: Option<LocalId>,
    pub method: MethodRef,
    pub args: Vec<Operand>,
}

impl Call {
    pub fn virtual_call(receiver: LocalId, class: &str, name: &str, args: Vec<Operand>) -> Self {
        Call {
            kind: CallKind::Virtual,
            receiver: Some(receiver),
            method: MethodRef::new(class, name),
            args,
        }
    }

    pub fn special_call(receiver: LocalId, class: &str, name: &str, args: Vec<Operand>) -> Self {
        Call {
            kind: CallKind::Special,
            receiver: Some(receiver),
            method: MethodRef::new(class, name),
            args,
        }
    }

    pub fn static_call(class: &str, name: &str, args: Vec<Operand>) -> Self {
        Call {
            kind: CallKind::Static,
            receiver: None,
            method: MethodRef::new(class, name),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rvalue {
    Use(Operand),
    /// Read of a field, static field, or array element.
    Load(Place),
    Binary(BinOp, Operand, Operand),
    Unary(UnOp, Operand),
    New(String),
    NewArray(IrType, Operand),
    Length(LocalId),
    Cast(IrType, Operand),
    InstanceOf(String, Operand),
    Call(Call),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { dest: Place, value: Rvalue },
    Invoke(Call),
    If {
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
        target: Label,
    },
    Goto(Label),
    Label(Label),
    Return(Option<Operand>),
    ArrayCopy {
        src: LocalId,
        src_pos: Operand,
        dst: LocalId,
        dst_pos: Operand,
        len: Operand,
    },
    Nop,
}

impl Stmt {
    pub fn assign(dest: LocalId, value: Rvalue) -> Stmt {
        Stmt::Assign {
            dest: Place::Local(dest),
            value,
        }
    }

    pub fn copy(dest: LocalId, src: impl Into<Operand>) -> Stmt {
        Stmt::assign(dest, Rvalue::Use(src.into()))
    }

    pub fn store_field(base: LocalId, field: FieldRef, value: impl Into<Operand>) -> Stmt {
        Stmt::Assign {
            dest: Place::Field { base, field },
            value: Rvalue::Use(value.into()),
        }
    }

    pub fn load_field(dest: LocalId, base: LocalId, field: FieldRef) -> Stmt {
        Stmt::assign(dest, Rvalue::Load(Place::Field { base, field }))
    }

    /// Local written by this statement, if any.
    pub fn def_local(&self) -> Option<LocalId> {
        match self {
            Stmt::Assign {
                dest: Place::Local(l),
                ..
            } => Some(*l),
            _ => None,
        }
    }

    pub fn call(&self) -> Option<&Call> {
        match self {
            Stmt::Invoke(c) => Some(c),
            Stmt::Assign {
                value: Rvalue::Call(c),
                ..
            } => Some(c),
            _ => None,
        }
    }

    pub fn call_mut(&mut self) -> Option<&mut Call> {
        match self {
            Stmt::Invoke(c) => Some(c),
            Stmt::Assign {
                value: Rvalue::Call(c),
                ..
            } => Some(c),
            _ => None,
        }
    }

    pub fn branch_target(&self) -> Option<Label> {
        match self {
            Stmt::If { target, .. } | Stmt::Goto(target) => Some(*target),
            _ => None,
        }
    }

    /// Whether control can continue to the next statement.
    pub fn falls_through(&self) -> bool {
        !matches!(self, Stmt::Goto(_) | Stmt::Return(_))
    }

    /// Locals read by this statement (including bases of field and element
    /// writes).
    pub fn used_locals(&self) -> Vec<LocalId> {
        let mut out = Vec::new();
        let push_op = |op: &Operand, out: &mut Vec<LocalId>| {
            if let Operand::Local(l) = op {
                out.push(*l);
            }
        };
        match self {
            Stmt::Assign { dest, value } => {
                match dest {
                    Place::Local(_) | Place::Static(_) => {}
                    Place::Field { base, .. } => out.push(*base),
                    Place::Elem { base, index } => {
                        out.push(*base);
                        push_op(index, &mut out);
                    }
                }
                rvalue_uses(value, &mut out);
            }
            Stmt::Invoke(c) => call_uses(c, &mut out),
            Stmt::If { lhs, rhs, .. } => {
                push_op(lhs, &mut out);
                push_op(rhs, &mut out);
            }
            Stmt::Return(Some(op)) => push_op(op, &mut out),
            Stmt::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => {
                out.push(*src);
                push_op(src_pos, &mut out);
                out.push(*dst);
                push_op(dst_pos, &mut out);
                push_op(len, &mut out);
            }
            Stmt::Goto(_) | Stmt::Label(_) | Stmt::Return(None) | Stmt::Nop => {}
        }
        out
    }

    /// Visit every local occurrence (reads and writes).
    pub fn for_each_local_mut(&mut self, f: &mut impl FnMut(&mut LocalId)) {
        match self {
            Stmt::Assign { dest, value } => {
                place_locals_mut(dest, f);
                rvalue_locals_mut(value, f);
            }
            Stmt::Invoke(c) => call_locals_mut(c, f),
            Stmt::If { lhs, rhs, .. } => {
                operand_local_mut(lhs, f);
                operand_local_mut(rhs, f);
            }
            Stmt::Return(Some(op)) => operand_local_mut(op, f),
            Stmt::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => {
                f(src);
                operand_local_mut(src_pos, f);
                f(dst);
                operand_local_mut(dst_pos, f);
                operand_local_mut(len, f);
            }
            Stmt::Goto(_) | Stmt::Label(_) | Stmt::Return(None) | Stmt::Nop => {}
        }
    }

    /// Visit every operand position, i.e. every place where a local may be
    /// replaced by a constant. Receivers, bases and array locals are not
    /// operands.
    pub fn for_each_operand_mut(&mut self, f: &mut impl FnMut(&mut Operand)) {
        match self {
            Stmt::Assign { dest, value } => {
                if let Place::Elem { index, .. } = dest {
                    f(index);
                }
                match value {
                    Rvalue::Use(o)
                    | Rvalue::Unary(_, o)
                    | Rvalue::Cast(_, o)
                    | Rvalue::InstanceOf(_, o)
                    | Rvalue::NewArray(_, o)
                    | Rvalue::Load(Place::Elem { index: o, .. }) => f(o),
                    Rvalue::Binary(_, a, b) => {
                        f(a);
                        f(b);
                    }
                    Rvalue::Call(c) => c.args.iter_mut().for_each(|a| f(a)),
                    Rvalue::Load(_) | Rvalue::New(_) | Rvalue::Length(_) => {}
                }
            }
            Stmt::Invoke(c) => c.args.iter_mut().for_each(|a| f(a)),
            Stmt::If { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Stmt::Return(Some(o)) => f(o),
            Stmt::ArrayCopy {
                src_pos,
                dst_pos,
                len,
                ..
            } => {
                f(src_pos);
                f(dst_pos);
                f(len);
            }
            Stmt::Goto(_) | Stmt::Label(_) | Stmt::Return(None) | Stmt::Nop => {}
        }
    }

    /// Visit every label occurrence (definitions and jump targets).
    pub fn for_each_label_mut(&mut self, f: &mut impl FnMut(&mut Label)) {
        match self {
            Stmt::If { target, .. } | Stmt::Goto(target) | Stmt::Label(target) => f(target),
            _ => {}
        }
    }

    /// Field references read or written by this statement.
    pub fn field_refs(&self) -> Vec<&FieldRef> {
        let mut out = Vec::new();
        if let Stmt::Assign { dest, value } = self {
            match dest {
                Place::Field { field, .. } | Place::Static(field) => out.push(field),
                _ => {}
            }
            if let Rvalue::Load(Place::Field { field, .. }) | Rvalue::Load(Place::Static(field)) =
                value
            {
                out.push(field);
            }
        }
        out
    }
}

impl Rvalue {
    /// Locals read by this rvalue.
    pub fn used_locals(&self) -> Vec<LocalId> {
        let mut out = Vec::new();
        rvalue_uses(self, &mut out);
        out
    }
}

fn call_uses(c: &Call, out: &mut Vec<LocalId>) {
    if let Some(r) = c.receiver {
        out.push(r);
    }
    for a in &c.args {
        if let Operand::Local(l) = a {
            out.push(*l);
        }
    }
}

fn rvalue_uses(value: &Rvalue, out: &mut Vec<LocalId>) {
    let op = |o: &Operand, out: &mut Vec<LocalId>| {
        if let Operand::Local(l) = o {
            out.push(*l);
        }
    };
    match value {
        Rvalue::Use(o) | Rvalue::Unary(_, o) | Rvalue::Cast(_, o) | Rvalue::InstanceOf(_, o) => {
            op(o, out)
        }
        Rvalue::NewArray(_, o) => op(o, out),
        Rvalue::Load(place) => match place {
            Place::Local(l) => out.push(*l),
            Place::Field { base, .. } => out.push(*base),
            Place::Static(_) => {}
            Place::Elem { base, index } => {
                out.push(*base);
                op(index, out);
            }
        },
        Rvalue::Binary(_, a, b) => {
            op(a, out);
            op(b, out);
        }
        Rvalue::Length(l) => out.push(*l),
        Rvalue::New(_) => {}
        Rvalue::Call(c) => call_uses(c, out),
    }
}

fn operand_local_mut(op: &mut Operand, f: &mut impl FnMut(&mut LocalId)) {
    if let Operand::Local(l) = op {
        f(l);
    }
}

fn place_locals_mut(place: &mut Place, f: &mut impl FnMut(&mut LocalId)) {
    match place {
        Place::Local(l) => f(l),
        Place::Field { base, .. } => f(base),
        Place::Static(_) => {}
        Place::Elem { base, index } => {
            f(base);
            operand_local_mut(index, f);
        }
    }
}

fn call_locals_mut(c: &mut Call, f: &mut impl FnMut(&mut LocalId)) {
    if let Some(r) = &mut c.receiver {
        f(r);
    }
    for a in &mut c.args {
        operand_local_mut(a, f);
    }
}

fn rvalue_locals_mut(value: &mut Rvalue, f: &mut impl FnMut(&mut LocalId)) {
    match value {
        Rvalue::Use(o)
        | Rvalue::Unary(_, o)
        | Rvalue::Cast(_, o)
        | Rvalue::InstanceOf(_, o)
        | Rvalue::NewArray(_, o) => operand_local_mut(o, f),
        Rvalue::Load(place) => place_locals_mut(place, f),
        Rvalue::Binary(_, a, b) => {
            operand_local_mut(a, f);
            operand_local_mut(b, f);
        }
        Rvalue::Length(l) => f(l),
        Rvalue::New(_) => {}
        Rvalue::Call(c) => call_locals_mut(c, f),
    }
}

/// Whether evaluating the rvalue can be dropped when its result is unused.
pub fn is_pure(value: &Rvalue) -> bool {
    match value {
        Rvalue::Use(_) | Rvalue::Binary(..) | Rvalue::Unary(..) | Rvalue::New(_) => true,
        Rvalue::Load(Place::Local(_)) | Rvalue::Load(Place::Static(_)) => true,
        Rvalue::Load(Place::Field { .. }) => true,
        Rvalue::InstanceOf(..) => true,
        // Element reads, lengths, casts and allocations sized by a value can
        // fail at run time; calls can have side effects.
        Rvalue::Load(Place::Elem { .. })
        | Rvalue::Length(_)
        | Rvalue::Cast(..)
        | Rvalue::NewArray(..)
        | Rvalue::Call(_) => false,
    }
}

// ── Constant folding ───────────────────────────────────────────────────────
//
// Shared by cleanup and the interpreter, so folded code and executed code
// agree. Integer arithmetic wraps; integer division by zero does not fold.

impl Constant {
    /// Text of the value as produced by a cast to `string`.
    pub fn plain_string(&self) -> String {
        match self {
            Constant::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Constant::Int(v) => Some(f64::from(*v)),
            Constant::Long(v) => Some(*v as f64),
            Constant::Double(v) => Some(*v),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Constant::Int(v) => Some(i64::from(*v)),
            Constant::Long(v) => Some(*v),
            _ => None,
        }
    }
}

fn compare<T: PartialOrd>(op: BinOp, a: T, b: T) -> Option<Constant> {
    let r = match op {
        BinOp::Eq => a == b,
        BinOp::Ne => a != b,
        BinOp::Lt => a < b,
        BinOp::Le => a <= b,
        BinOp::Gt => a > b,
        BinOp::Ge => a >= b,
        _ => return None,
    };
    Some(Constant::Bool(r))
}

/// Evaluate a binary operator on constants.
pub fn fold_binary(op: BinOp, a: &Constant, b: &Constant) -> Option<Constant> {
    use Constant::*;
    match (a, b) {
        (Str(x), y) if op == BinOp::Add => Some(Str(format!("{}{}", x, y.plain_string()))),
        (x, Str(y)) if op == BinOp::Add => Some(Str(format!("{}{}", x.plain_string(), y))),
        (Str(x), Str(y)) => compare(op, x, y),
        (Null, Null) => compare(op, 0, 0).filter(|_| matches!(op, BinOp::Eq | BinOp::Ne)),
        (Null, Str(_)) | (Str(_), Null) => match op {
            BinOp::Eq => Some(Bool(false)),
            BinOp::Ne => Some(Bool(true)),
            _ => None,
        },
        (Bool(x), Bool(y)) => match op {
            BinOp::And => Some(Bool(*x && *y)),
            BinOp::Or => Some(Bool(*x || *y)),
            BinOp::Eq | BinOp::Ne => compare(op, x, y),
            _ => None,
        },
        (Int(x), Int(y)) => {
            let (x, y) = (*x, *y);
            match op {
                BinOp::Add => Some(Int(x.wrapping_add(y))),
                BinOp::Sub => Some(Int(x.wrapping_sub(y))),
                BinOp::Mul => Some(Int(x.wrapping_mul(y))),
                BinOp::Div if y != 0 => Some(Int(x.wrapping_div(y))),
                BinOp::Rem if y != 0 => Some(Int(x.wrapping_rem(y))),
                BinOp::And => Some(Int(x & y)),
                BinOp::Or => Some(Int(x | y)),
                BinOp::Div | BinOp::Rem => None,
                _ => compare(op, x, y),
            }
        }
        (Double(_), _) | (_, Double(_)) => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            match op {
                BinOp::Add => Some(Double(x + y)),
                BinOp::Sub => Some(Double(x - y)),
                BinOp::Mul => Some(Double(x * y)),
                BinOp::Div => Some(Double(x / y)),
                BinOp::Rem => Some(Double(x % y)),
                BinOp::And | BinOp::Or => None,
                _ => compare(op, x, y),
            }
        }
        _ => {
            let (x, y) = (a.as_i64()?, b.as_i64()?);
            match op {
                BinOp::Add => Some(Long(x.wrapping_add(y))),
                BinOp::Sub => Some(Long(x.wrapping_sub(y))),
                BinOp::Mul => Some(Long(x.wrapping_mul(y))),
                BinOp::Div if y != 0 => Some(Long(x.wrapping_div(y))),
                BinOp::Rem if y != 0 => Some(Long(x.wrapping_rem(y))),
                BinOp::And => Some(Long(x & y)),
                BinOp::Or => Some(Long(x | y)),
                BinOp::Div | BinOp::Rem => None,
                _ => compare(op, x, y),
            }
        }
    }
}

pub fn fold_unary(op: UnOp, a: &Constant) -> Option<Constant> {
    match (op, a) {
        (UnOp::Neg, Constant::Int(v)) => Some(Constant::Int(v.wrapping_neg())),
        (UnOp::Neg, Constant::Long(v)) => Some(Constant::Long(v.wrapping_neg())),
        (UnOp::Neg, Constant::Double(v)) => Some(Constant::Double(-v)),
        (UnOp::Not, Constant::Bool(b)) => Some(Constant::Bool(!b)),
        _ => None,
    }
}

/// Evaluate a cast of a constant. Numeric casts convert (truncating toward
/// zero); a cast to `string` formats the value.
pub fn fold_cast(ty: &IrType, a: &Constant) -> Option<Constant> {
    match (ty, a) {
        (IrType::Str, Constant::Null) => Some(Constant::Null),
        (IrType::Str, c) => Some(Constant::Str(c.plain_string())),
        (IrType::Bool, Constant::Bool(b)) => Some(Constant::Bool(*b)),
        (IrType::Int, c) => match c {
            Constant::Double(v) => Some(Constant::Int(*v as i32)),
            other => other.as_i64().map(|v| Constant::Int(v as i32)),
        },
        (IrType::Long, c) => match c {
            Constant::Double(v) => Some(Constant::Long(*v as i64)),
            other => other.as_i64().map(Constant::Long),
        },
        (IrType::Double, c) => c.as_f64().map(Constant::Double),
        (IrType::Object(_) | IrType::Array(_), Constant::Null) => Some(Constant::Null),
        _ => None,
    }
}

// ── Declarations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LocalDecl {
    pub name: String,
    pub ty: IrType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Concrete,
    Abstract,
    /// Implemented by the runtime. `dynamic` natives return values whose
    /// shape is not statically determinable.
    Native { dynamic: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    pub name: String,
    pub is_static: bool,
    pub kind: MethodKind,
    pub this_local: Option<LocalId>,
    pub params: Vec<LocalId>,
    pub return_type: IrType,
    pub locals: Vec<LocalDecl>,
    pub body: Vec<Stmt>,
    pub next_label: u32,
}

impl Method {
    /// New concrete instance method with an empty body.
    pub fn new(class: &str, name: &str, return_type: IrType) -> Self {
        Method {
            name: name.to_string(),
            is_static: false,
            kind: MethodKind::Concrete,
            this_local: Some(LocalId(0)),
            params: Vec::new(),
            return_type,
            locals: vec![LocalDecl {
                name: "this".to_string(),
                ty: IrType::object(class),
            }],
            body: Vec::new(),
            next_label: 0,
        }
    }

    pub fn has_body(&self) -> bool {
        self.kind == MethodKind::Concrete
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, MethodKind::Native { dynamic: true })
    }

    pub fn this(&self) -> Option<LocalId> {
        self.this_local
    }

    pub fn local(&self, id: LocalId) -> &LocalDecl {
        &self.locals[id.index()]
    }

    pub fn local_type(&self, id: LocalId) -> &IrType {
        &self.locals[id.index()].ty
    }

    pub fn local_name(&self, id: LocalId) -> &str {
        &self.locals[id.index()].name
    }

    pub fn local_by_name(&self, name: &str) -> Option<LocalId> {
        self.locals
            .iter()
            .position(|l| l.name == name)
            .map(|i| LocalId(i as u32))
    }

    /// Add a local, making the name unique within the method.
    pub fn add_local(&mut self, name: &str, ty: IrType) -> LocalId {
        let mut candidate = name.to_string();
        let mut n = 0;
        while self.locals.iter().any(|l| l.name == candidate) {
            n += 1;
            candidate = format!("{}${}", name, n);
        }
        self.locals.push(LocalDecl {
            name: candidate,
            ty,
        });
        LocalId((self.locals.len() - 1) as u32)
    }

    pub fn add_param(&mut self, name: &str, ty: IrType) -> LocalId {
        let id = self.add_local(name, ty);
        self.params.push(id);
        id
    }

    pub fn fresh_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    /// Index of the statement defining `label`.
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.body
            .iter()
            .position(|s| matches!(s, Stmt::Label(l) if *l == label))
    }

    /// Whether `id` is `this` or a parameter.
    pub fn is_entry_bound(&self, id: LocalId) -> bool {
        self.this_local == Some(id) || self.params.contains(&id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub ty: IrType,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Class {
    pub name: String,
    pub superclass: Option<String>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<Method>,
}

impl Class {
    pub fn new(name: &str, superclass: Option<&str>) -> Self {
        Class {
            name: name.to_string(),
            superclass: superclass.map(|s| s.to_string()),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn add_field(&mut self, name: &str, ty: IrType) {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            ty,
            is_static: false,
        });
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_mut(&mut self, name: &str) -> Option<&mut Method> {
        self.methods.iter_mut().find(|m| m.name == name)
    }

    /// Insert or replace the method with the same name.
    pub fn put_method(&mut self, method: Method) {
        if let Some(existing) = self.methods.iter_mut().find(|m| m.name == method.name) {
            *existing = method;
        } else {
            self.methods.push(method);
        }
    }
}

/// Root class of every boxed value.
pub const TOKEN_CLASS: &str = "Token";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub classes: BTreeMap<String, Class>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, class: Class) {
        self.classes.insert(class.name.clone(), class);
    }

    /// Move every class of `other` into this program (later wins).
    pub fn merge(&mut self, other: Program) {
        for (name, class) in other.classes {
            self.classes.insert(name, class);
        }
    }

    pub fn class(&self, name: &str) -> Option<&Class> {
        self.classes.get(name)
    }

    pub fn class_mut(&mut self, name: &str) -> Option<&mut Class> {
        self.classes.get_mut(name)
    }

    pub fn method(&self, class: &str, name: &str) -> Option<&Method> {
        self.class(class).and_then(|c| c.method(name))
    }

    pub fn method_mut(&mut self, class: &str, name: &str) -> Option<&mut Method> {
        self.class_mut(class).and_then(|c| c.method_mut(name))
    }

    /// `name` followed by its ancestors.
    pub fn superclass_chain(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut cur = Some(name.to_string());
        while let Some(c) = cur {
            if out.contains(&c) {
                break;
            }
            cur = self.class(&c).and_then(|k| k.superclass.clone());
            out.push(c);
        }
        out
    }

    pub fn is_subclass_of(&self, sub: &str, sup: &str) -> bool {
        self.superclass_chain(sub).iter().any(|c| c == sup)
    }

    pub fn is_token_class(&self, name: &str) -> bool {
        self.is_subclass_of(name, TOKEN_CLASS)
    }

    /// Whether values of this IR type are tokens.
    pub fn is_token_type(&self, ty: &IrType) -> bool {
        match ty {
            IrType::Object(c) => self.is_token_class(c),
            _ => false,
        }
    }

    /// Whether values of this IR type are arrays of tokens.
    pub fn is_token_array_type(&self, ty: &IrType) -> bool {
        match ty {
            IrType::Array(e) => self.is_token_type(e),
            _ => false,
        }
    }

    /// `name` and all of its transitive subclasses, in name order.
    pub fn subclasses(&self, name: &str) -> Vec<String> {
        self.classes
            .keys()
            .filter(|c| self.is_subclass_of(c, name))
            .cloned()
            .collect()
    }

    pub fn is_leaf(&self, name: &str) -> bool {
        !self
            .classes
            .values()
            .any(|c| c.superclass.as_deref() == Some(name))
    }

    /// Find the method `name` starting at `class` and walking up the
    /// hierarchy. Returns the declaring class.
    pub fn lookup_method(&self, class: &str, name: &str) -> Option<(String, &Method)> {
        for c in self.superclass_chain(class) {
            if let Some(m) = self.method(&c, name) {
                return Some((c, m));
            }
        }
        None
    }

    /// Find the field `name` starting at `class` and walking up.
    pub fn lookup_field(&self, class: &str, name: &str) -> Option<(String, &FieldDecl)> {
        for c in self.superclass_chain(class) {
            if let Some(f) = self.class(&c).and_then(|k| k.field(name)) {
                return Some((c, f));
            }
        }
        None
    }

    pub fn field_type(&self, field: &FieldRef) -> Option<&IrType> {
        self.lookup_field(&field.class, &field.name).map(|(_, f)| &f.ty)
    }

    /// Non-static fields of a class including inherited ones, ancestors first.
    pub fn instance_fields(&self, class: &str) -> Vec<FieldRef> {
        let mut chain = self.superclass_chain(class);
        chain.reverse();
        let mut out = Vec::new();
        for c in chain {
            if let Some(k) = self.class(&c) {
                for f in k.fields.iter().filter(|f| !f.is_static) {
                    out.push(FieldRef::new(&c, &f.name));
                }
            }
        }
        out
    }

    /// Distinct concrete implementations a virtual call on a receiver of
    /// static class `class` can reach.
    pub fn dispatch_targets(&self, class: &str, name: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for sub in self.subclasses(class) {
            if let Some((decl, m)) = self.lookup_method(&sub, name) {
                if m.kind != MethodKind::Abstract && !out.contains(&decl) {
                    out.push(decl);
                }
            }
        }
        out
    }

    /// Every (class, method) pair, in deterministic order.
    pub fn method_keys(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (cname, class) in &self.classes {
            for m in &class.methods {
                out.push((cname.clone(), m.name.clone()));
            }
        }
        out
    }
}

// ── Printing ───────────────────────────────────────────────────────────────

/// Statement paired with its method, for printing local names.
pub struct StmtDisplay<'a> {
    pub stmt: &'a Stmt,
    pub method: &'a Method,
}

impl Method {
    pub fn display_stmt<'a>(&'a self, stmt: &'a Stmt) -> StmtDisplay<'a> {
        StmtDisplay { stmt, method: self }
    }
}

struct OperandDisplay<'a>(&'a Operand, &'a Method);

impl fmt::Display for OperandDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Operand::Local(l) => write!(f, "{}", self.1.local_name(*l)),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}

/// `C::` when member class `class` is not the static class of `base`.
fn write_qualifier(
    f: &mut fmt::Formatter<'_>,
    base: LocalId,
    class: &str,
    m: &Method,
) -> fmt::Result {
    if m.local_type(base).class_name() == Some(class) {
        Ok(())
    } else {
        write!(f, "{}::", class)
    }
}

fn fmt_place(f: &mut fmt::Formatter<'_>, place: &Place, m: &Method) -> fmt::Result {
    match place {
        Place::Local(l) => write!(f, "{}", m.local_name(*l)),
        Place::Field { base, field } => {
            write!(f, "{}.", m.local_name(*base))?;
            write_qualifier(f, *base, &field.class, m)?;
            write!(f, "{}", field.name)
        }
        Place::Static(field) => write!(f, "{}::{}", field.class, field.name),
        Place::Elem { base, index } => {
            write!(f, "{}[{}]", m.local_name(*base), OperandDisplay(index, m))
        }
    }
}

fn fmt_call(f: &mut fmt::Formatter<'_>, call: &Call, m: &Method) -> fmt::Result {
    match (call.kind, call.receiver) {
        (CallKind::Static, _) | (_, None) => {
            write!(f, "staticinvoke {}::{}(", call.method.class, call.method.name)?
        }
        (kind, Some(r)) => {
            let keyword = if kind == CallKind::Special {
                "specialinvoke"
            } else {
                "virtualinvoke"
            };
            write!(f, "{} {}.", keyword, m.local_name(r))?;
            write_qualifier(f, r, &call.method.class, m)?;
            write!(f, "{}(", call.method.name)?
        }
    }
    for (i, a) in call.args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", OperandDisplay(a, m))?;
    }
    write!(f, ")")
}

fn fmt_rvalue(f: &mut fmt::Formatter<'_>, value: &Rvalue, m: &Method) -> fmt::Result {
    match value {
        Rvalue::Use(o) => write!(f, "{}", OperandDisplay(o, m)),
        Rvalue::Load(p) => fmt_place(f, p, m),
        Rvalue::Binary(op, a, b) => write!(
            f,
            "{} {} {}",
            OperandDisplay(a, m),
            op.symbol(),
            OperandDisplay(b, m)
        ),
        Rvalue::Unary(UnOp::Neg, a) => write!(f, "-{}", OperandDisplay(a, m)),
        Rvalue::Unary(UnOp::Not, a) => write!(f, "!{}", OperandDisplay(a, m)),
        Rvalue::New(c) => write!(f, "new {}", c),
        Rvalue::NewArray(ty, n) => write!(f, "newarray {}[{}]", ty, OperandDisplay(n, m)),
        Rvalue::Length(l) => write!(f, "lengthof {}", m.local_name(*l)),
        Rvalue::Cast(ty, o) => write!(f, "({}) {}", ty, OperandDisplay(o, m)),
        Rvalue::InstanceOf(c, o) => write!(f, "{} instanceof {}", OperandDisplay(o, m), c),
        Rvalue::Call(c) => fmt_call(f, c, m),
    }
}

impl fmt::Display for StmtDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.method;
        match self.stmt {
            Stmt::Assign { dest, value } => {
                fmt_place(f, dest, m)?;
                write!(f, " = ")?;
                fmt_rvalue(f, value, m)?;
                write!(f, ";")
            }
            Stmt::Invoke(c) => {
                fmt_call(f, c, m)?;
                write!(f, ";")
            }
            Stmt::If {
                op,
                lhs,
                rhs,
                target,
            } => write!(
                f,
                "if {} {} {} goto L{};",
                OperandDisplay(lhs, m),
                op.symbol(),
                OperandDisplay(rhs, m),
                target.0
            ),
            Stmt::Goto(l) => write!(f, "goto L{};", l.0),
            Stmt::Label(l) => write!(f, "L{}:", l.0),
            Stmt::Return(None) => write!(f, "return;"),
            Stmt::Return(Some(o)) => write!(f, "return {};", OperandDisplay(o, m)),
            Stmt::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => write!(
                f,
                "arraycopy({}, {}, {}, {}, {});",
                m.local_name(*src),
                OperandDisplay(src_pos, m),
                m.local_name(*dst),
                OperandDisplay(dst_pos, m),
                OperandDisplay(len, m)
            ),
            Stmt::Nop => write!(f, "nop;"),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_static {
            write!(f, "static ")?;
        }
        match self.kind {
            MethodKind::Concrete => {}
            MethodKind::Abstract => write!(f, "abstract ")?,
            MethodKind::Native { dynamic: true } => write!(f, "dynamic native ")?,
            MethodKind::Native { dynamic: false } => write!(f, "native ")?,
        }
        write!(f, "method {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let decl = self.local(*p);
            write!(f, "{}: {}", decl.name, decl.ty)?;
        }
        write!(f, ")")?;
        if self.return_type != IrType::Void {
            write!(f, ": {}", self.return_type)?;
        }
        if !self.has_body() {
            return writeln!(f, ";");
        }
        writeln!(f, " {{")?;
        for (i, decl) in self.locals.iter().enumerate() {
            let id = LocalId(i as u32);
            if self.is_entry_bound(id) {
                continue;
            }
            writeln!(f, "        local {}: {};", decl.name, decl.ty)?;
        }
        for stmt in &self.body {
            if matches!(stmt, Stmt::Label(_)) {
                writeln!(f, "    {}", self.display_stmt(stmt))?;
            } else {
                writeln!(f, "        {}", self.display_stmt(stmt))?;
            }
        }
        writeln!(f, "    }}")
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {}", self.name)?;
        if let Some(s) = &self.superclass {
            write!(f, " extends {}", s)?;
        }
        writeln!(f, " {{")?;
        for field in &self.fields {
            if field.is_static {
                writeln!(f, "    static field {}: {};", field.name, field.ty)?;
            } else {
                writeln!(f, "    field {}: {};", field.name, field.ty)?;
            }
        }
        for m in &self.methods {
            writeln!(f)?;
            write!(f, "    {}", m)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, class) in self.classes.values().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", class)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> Program {
        let mut p = Program::new();
        p.add_class(Class::new("Token", None));
        p.add_class(Class::new("ScalarToken", Some("Token")));
        let mut d = Class::new("DoubleToken", Some("ScalarToken"));
        d.add_field("_value", IrType::Double);
        let mut add = Method::new("DoubleToken", "add", IrType::object("Token"));
        add.add_param("other", IrType::object("Token"));
        add.body.push(Stmt::Return(Some(Operand::Local(LocalId(0)))));
        d.methods.push(add);
        p.add_class(d);
        let mut base_add = Method::new("Token", "add", IrType::object("Token"));
        base_add.kind = MethodKind::Abstract;
        p.class_mut("Token").unwrap().methods.push(base_add);
        p
    }

    #[test]
    fn lookup_walks_superclasses() {
        let p = hierarchy();
        let (decl, _) = p.lookup_method("DoubleToken", "add").unwrap();
        assert_eq!(decl, "DoubleToken");
        let (owner, field) = p.lookup_field("DoubleToken", "_value").unwrap();
        assert_eq!(owner, "DoubleToken");
        assert_eq!(field.ty, IrType::Double);
        assert!(p.is_token_class("DoubleToken"));
        assert!(p.is_token_type(&IrType::object("ScalarToken")));
    }

    #[test]
    fn dispatch_ignores_abstract_declarations() {
        let p = hierarchy();
        assert_eq!(p.dispatch_targets("Token", "add"), vec!["DoubleToken".to_string()]);
        assert!(p.is_leaf("DoubleToken"));
        assert!(!p.is_leaf("Token"));
    }

    #[test]
    fn add_local_uniquifies_names() {
        let mut m = Method::new("A", "fire", IrType::Void);
        let a = m.add_local("t", IrType::Int);
        let b = m.add_local("t", IrType::Int);
        assert_ne!(a, b);
        assert_eq!(m.local_name(b), "t$1");
    }

    #[test]
    fn stmt_display() {
        let mut m = Method::new("A", "fire", IrType::Void);
        let x = m.add_local("x", IrType::Double);
        let this = m.this().unwrap();
        let s = Stmt::store_field(this, FieldRef::new("A", "_gain"), Constant::Double(2.0));
        assert_eq!(m.display_stmt(&s).to_string(), "this._gain = 2.0;");
        let s = Stmt::If {
            op: BinOp::Lt,
            lhs: Operand::Local(x),
            rhs: Operand::Const(Constant::Long(-3)),
            target: Label(4),
        };
        assert_eq!(m.display_stmt(&s).to_string(), "if x < -3L goto L4;");
        let t = m.add_local("t", IrType::object("Token"));
        let s = Stmt::load_field(x, t, FieldRef::new("DoubleToken", "_value"));
        assert_eq!(m.display_stmt(&s).to_string(), "x = t.DoubleToken::_value;");
        let s = Stmt::Invoke(Call::special_call(t, "DoubleToken", "<init>", vec![]));
        assert_eq!(m.display_stmt(&s).to_string(), "specialinvoke t.DoubleToken::<init>();");
        let s = Stmt::copy(x, Constant::Str("a\"b".into()));
        assert_eq!(m.display_stmt(&s).to_string(), "x = \"a\\\"b\";");
    }

    #[test]
    fn used_locals_include_write_bases() {
        let mut m = Method::new("A", "fire", IrType::Void);
        let arr = m.add_local("arr", IrType::array(IrType::Int));
        let i = m.add_local("i", IrType::Int);
        let s = Stmt::Assign {
            dest: Place::Elem {
                base: arr,
                index: Operand::Local(i),
            },
            value: Rvalue::Use(Operand::Const(Constant::Int(1))),
        };
        assert_eq!(s.used_locals(), vec![arr, i]);
        assert_eq!(s.def_local(), None);
    }
}
