// ast.rs — Syntax trees for textual IR and attribute expressions
//
// Names are unresolved here: an operand `x` may be any local, a place `a.f`
// does not yet know which class declares `f`. `lower.rs` resolves names and
// produces `ir::Program`. Every node that can be the subject of an error
// carries a `SimpleSpan`.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

use crate::ir::{BinOp, CallKind, IrType, UnOp};

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

/// An identifier with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

// ── Root ──

/// A textual IR unit: a sequence of class declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub classes: Vec<ClassDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: Ident,
    pub superclass: Option<Ident>,
    pub members: Vec<Member>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Field(FieldDecl),
    Method(MethodDecl),
}

// ── field_decl: 'static'? 'field' IDENT ':' type ';' ──

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: Ident,
    pub ty: IrType,
    pub is_static: bool,
}

// ── method_decl: modifier* 'method' NAME '(' params? ')' (':' type)? (';' | body) ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Static,
    Native,
    Abstract,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDecl {
    pub name: Ident,
    pub modifiers: Vec<Modifier>,
    pub params: Vec<(Ident, IrType)>,
    pub return_type: IrType,
    /// `None` for abstract and native methods.
    pub body: Option<Vec<BodyItem>>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BodyItem {
    Local(Ident, IrType),
    Stmt(Stmt),
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Name(Ident),
    Lit(Literal, Span),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    Name(Ident),
    /// `base.f` or `base.C::f` with an explicit declaring class.
    Field(Ident, Option<Ident>, Ident),
    Static(Ident, Ident),
    Elem(Ident, Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    /// Receiver local for virtual/special calls, class name for static calls.
    pub target: Ident,
    /// Explicit class in `x.C::m(..)`.
    pub qualifier: Option<Ident>,
    pub method: Ident,
    pub args: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rvalue {
    Place(Place),
    Lit(Literal, Span),
    Binary(BinOp, Operand, Operand),
    Unary(UnOp, Operand),
    New(Ident),
    NewArray(IrType, Operand),
    Length(Ident),
    Cast(IrType, Operand),
    InstanceOf(Operand, Ident),
    Call(Call),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Label(Ident),
    Assign(Place, Rvalue),
    Invoke(Call),
    If(BinOp, Operand, Operand, Ident),
    Goto(Ident),
    Return(Option<Operand>),
    ArrayCopy([Operand; 5]),
    Nop,
}

// ── Attribute expressions ──

/// Expression of an actor attribute (parameter value).
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Literal, Span),
    Name(Ident),
    Array(Vec<Expr>, Span),
    Neg(Box<Expr>, Span),
    Binary(BinOp, Box<Expr>, Box<Expr>, Span),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Lit(_, s) | Expr::Array(_, s) | Expr::Neg(_, s) | Expr::Binary(_, _, _, s) => *s,
            Expr::Name(id) => id.span,
        }
    }
}
