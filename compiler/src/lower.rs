// lower.rs — Name resolution from syntax trees to IR
//
// Resolves every name in a parsed unit: operands to locals, `x.f` to the
// class declaring `f` (searched from the static type of `x` upward), labels
// to per-method label ids, modifiers to method kinds. Class and field
// declarations of the unit are visible to all of its methods, together with
// everything in the context program (normally the runtime library).
//
// Preconditions: `unit` is a complete parse (no syntax errors).
// Postconditions: every `FieldRef` names a class that declares the field;
//   labels `L<n>` keep id `n`, other labels get fresh ids above them.
// Failure modes: unknown local/field/label, duplicate names, or a body on an
//   abstract/native method produce `SpecializeError::Parse`.
// Side effects: none.

use std::collections::HashMap;

use crate::ast::{self, BodyItem, Literal, Member, Modifier, StmtKind, Unit};
use crate::error::{Result, SpecializeError};
use crate::id::{Label, LocalId};
use crate::ir::{
    Call, CallKind, Class, Constant, FieldDecl, FieldRef, Method, MethodKind, MethodRef, Operand,
    Place, Program, Rvalue, Stmt,
};
use crate::parser::parse_unit;

/// Parse and lower textual IR against a context program.
///
/// The returned program holds only the classes declared in `source`.
pub fn parse_ir(source: &str, context: &Program) -> Result<Program> {
    let parsed = parse_unit(source);
    if !parsed.errors.is_empty() {
        return Err(SpecializeError::Parse(parsed.error_message()));
    }
    let unit = parsed
        .output
        .ok_or_else(|| SpecializeError::Parse("empty parse result".to_string()))?;
    lower_unit(&unit, context)
}

/// Lower a parsed unit; see the module header for resolution rules.
pub fn lower_unit(unit: &Unit, context: &Program) -> Result<Program> {
    // Skeleton classes (fields only) make declarations visible to all bodies.
    let mut scope = context.clone();
    for decl in &unit.classes {
        let mut class = Class::new(
            &decl.name.name,
            decl.superclass.as_ref().map(|s| s.name.as_str()),
        );
        for member in &decl.members {
            if let Member::Field(f) = member {
                if class.has_field(&f.name.name) {
                    return Err(parse_error(format!(
                        "duplicate field `{}` in class `{}`",
                        f.name.name, decl.name.name
                    )));
                }
                class.fields.push(FieldDecl {
                    name: f.name.name.clone(),
                    ty: f.ty.clone(),
                    is_static: f.is_static,
                });
            }
        }
        scope.add_class(class);
    }

    let mut out = Program::new();
    for decl in &unit.classes {
        let mut class = scope
            .class(&decl.name.name)
            .cloned()
            .ok_or_else(|| parse_error(format!("class `{}` vanished", decl.name.name)))?;
        for member in &decl.members {
            if let Member::Method(m) = member {
                if class.method(&m.name.name).is_some() {
                    return Err(parse_error(format!(
                        "duplicate method `{}` in class `{}`",
                        m.name.name, decl.name.name
                    )));
                }
                let method = MethodLowerer::new(&scope, &decl.name.name).lower(m)?;
                class.methods.push(method);
            }
        }
        out.add_class(class);
    }
    Ok(out)
}

fn parse_error(message: String) -> SpecializeError {
    SpecializeError::Parse(message)
}

pub(crate) fn literal_constant(lit: &Literal) -> Constant {
    match lit {
        Literal::Null => Constant::Null,
        Literal::Bool(b) => Constant::Bool(*b),
        Literal::Int(v) => Constant::Int(*v),
        Literal::Long(v) => Constant::Long(*v),
        Literal::Double(v) => Constant::Double(*v),
        Literal::Str(s) => Constant::Str(s.clone()),
    }
}

// ── Per-method lowering ──

struct MethodLowerer<'a> {
    scope: &'a Program,
    class: &'a str,
    method_name: String,
    labels: HashMap<String, Label>,
}

impl<'a> MethodLowerer<'a> {
    fn new(scope: &'a Program, class: &'a str) -> Self {
        MethodLowerer {
            scope,
            class,
            method_name: String::new(),
            labels: HashMap::new(),
        }
    }

    fn err(&self, message: String) -> SpecializeError {
        parse_error(format!("{}::{}: {}", self.class, self.method_name, message))
    }

    fn lower(mut self, decl: &ast::MethodDecl) -> Result<Method> {
        self.method_name = decl.name.name.clone();
        let is_static = decl.modifiers.contains(&Modifier::Static);
        let kind = if decl.modifiers.contains(&Modifier::Abstract) {
            MethodKind::Abstract
        } else if decl.modifiers.contains(&Modifier::Native) {
            MethodKind::Native {
                dynamic: decl.modifiers.contains(&Modifier::Dynamic),
            }
        } else {
            MethodKind::Concrete
        };

        let mut method = Method::new(self.class, &decl.name.name, decl.return_type.clone());
        method.kind = kind;
        if is_static {
            method.is_static = true;
            method.this_local = None;
            method.locals.clear();
        }
        for (name, ty) in &decl.params {
            if method.local_by_name(&name.name).is_some() {
                return Err(self.err(format!("duplicate parameter `{}`", name.name)));
            }
            method.add_param(&name.name, ty.clone());
        }

        match (&decl.body, kind) {
            (Some(_), MethodKind::Abstract | MethodKind::Native { .. }) => {
                return Err(self.err("abstract and native methods have no body".to_string()));
            }
            (None, MethodKind::Concrete) => {
                return Err(self.err("missing method body".to_string()));
            }
            (None, _) => return Ok(method),
            (Some(_), MethodKind::Concrete) => {}
        }
        let items = decl.body.as_deref().unwrap_or(&[]);

        // Locals first, so statements may use them before the declaration.
        for item in items {
            if let BodyItem::Local(name, ty) = item {
                if method.local_by_name(&name.name).is_some() {
                    return Err(self.err(format!("duplicate local `{}`", name.name)));
                }
                method.add_local(&name.name, ty.clone());
            }
        }
        self.assign_labels(items, &mut method)?;

        for item in items {
            if let BodyItem::Stmt(stmt) = item {
                let lowered = self.stmt(&stmt.kind, &method)?;
                method.body.push(lowered);
            }
        }
        Ok(method)
    }

    fn assign_labels(&mut self, items: &[BodyItem], method: &mut Method) -> Result<()> {
        let names: Vec<&str> = items
            .iter()
            .filter_map(|item| match item {
                BodyItem::Stmt(ast::Stmt {
                    kind: StmtKind::Label(l),
                    ..
                }) => Some(l.name.as_str()),
                _ => None,
            })
            .collect();
        let numbered = |name: &str| -> Option<u32> {
            name.strip_prefix('L').and_then(|digits| {
                if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
                    None
                } else {
                    digits.parse().ok()
                }
            })
        };
        let mut next = names
            .iter()
            .filter_map(|&n| numbered(n))
            .max()
            .map_or(0, |m| m + 1);
        for name in names {
            if self.labels.contains_key(name) {
                return Err(self.err(format!("duplicate label `{}`", name)));
            }
            let label = match numbered(name) {
                Some(n) => Label(n),
                None => {
                    next += 1;
                    Label(next - 1)
                }
            };
            self.labels.insert(name.to_string(), label);
        }
        method.next_label = next;
        Ok(())
    }

    fn local(&self, name: &ast::Ident, method: &Method) -> Result<LocalId> {
        method
            .local_by_name(&name.name)
            .ok_or_else(|| self.err(format!("unknown local `{}`", name.name)))
    }

    fn label(&self, name: &ast::Ident) -> Result<Label> {
        self.labels
            .get(&name.name)
            .copied()
            .ok_or_else(|| self.err(format!("unknown label `{}`", name.name)))
    }

    fn operand(&self, op: &ast::Operand, method: &Method) -> Result<Operand> {
        match op {
            ast::Operand::Name(name) => Ok(Operand::Local(self.local(name, method)?)),
            ast::Operand::Lit(lit, _) => Ok(Operand::Const(literal_constant(lit))),
        }
    }

    fn object_class<'m>(&self, base: LocalId, method: &'m Method) -> Result<&'m str> {
        method.local_type(base).class_name().ok_or_else(|| {
            self.err(format!(
                "`{}` of type `{}` is not an object",
                method.local_name(base),
                method.local_type(base)
            ))
        })
    }

    fn field(&self, class: &str, name: &ast::Ident) -> Result<FieldRef> {
        self.scope
            .lookup_field(class, &name.name)
            .map(|(owner, _)| FieldRef::new(&owner, &name.name))
            .ok_or_else(|| self.err(format!("class `{}` has no field `{}`", class, name.name)))
    }

    fn place(&self, place: &ast::Place, method: &Method) -> Result<Place> {
        match place {
            ast::Place::Name(name) => Ok(Place::Local(self.local(name, method)?)),
            ast::Place::Field(base, qualifier, field) => {
                let base = self.local(base, method)?;
                let class = match qualifier {
                    Some(q) => q.name.as_str(),
                    None => self.object_class(base, method)?,
                };
                Ok(Place::Field {
                    base,
                    field: self.field(class, field)?,
                })
            }
            ast::Place::Static(class, field) => Ok(Place::Static(self.field(&class.name, field)?)),
            ast::Place::Elem(base, index) => Ok(Place::Elem {
                base: self.local(base, method)?,
                index: self.operand(index, method)?,
            }),
        }
    }

    fn call(&self, call: &ast::Call, method: &Method) -> Result<Call> {
        let args = call
            .args
            .iter()
            .map(|a| self.operand(a, method))
            .collect::<Result<Vec<_>>>()?;
        match call.kind {
            CallKind::Static => Ok(Call {
                kind: CallKind::Static,
                receiver: None,
                method: MethodRef::new(&call.target.name, &call.method.name),
                args,
            }),
            kind => {
                let receiver = self.local(&call.target, method)?;
                let class = match &call.qualifier {
                    Some(q) => q.name.as_str(),
                    None => self.object_class(receiver, method)?,
                };
                Ok(Call {
                    kind,
                    receiver: Some(receiver),
                    method: MethodRef::new(class, &call.method.name),
                    args,
                })
            }
        }
    }

    fn rvalue(&self, rv: &ast::Rvalue, method: &Method) -> Result<Rvalue> {
        Ok(match rv {
            ast::Rvalue::Place(ast::Place::Name(name)) => {
                Rvalue::Use(Operand::Local(self.local(name, method)?))
            }
            ast::Rvalue::Place(p) => Rvalue::Load(self.place(p, method)?),
            ast::Rvalue::Lit(lit, _) => Rvalue::Use(Operand::Const(literal_constant(lit))),
            ast::Rvalue::Binary(op, a, b) => {
                Rvalue::Binary(*op, self.operand(a, method)?, self.operand(b, method)?)
            }
            ast::Rvalue::Unary(op, a) => Rvalue::Unary(*op, self.operand(a, method)?),
            ast::Rvalue::New(class) => Rvalue::New(class.name.clone()),
            ast::Rvalue::NewArray(ty, n) => Rvalue::NewArray(ty.clone(), self.operand(n, method)?),
            ast::Rvalue::Length(a) => Rvalue::Length(self.local(a, method)?),
            ast::Rvalue::Cast(ty, a) => Rvalue::Cast(ty.clone(), self.operand(a, method)?),
            ast::Rvalue::InstanceOf(a, class) => {
                Rvalue::InstanceOf(class.name.clone(), self.operand(a, method)?)
            }
            ast::Rvalue::Call(c) => Rvalue::Call(self.call(c, method)?),
        })
    }

    fn array_local(&self, op: &ast::Operand, method: &Method) -> Result<LocalId> {
        match op {
            ast::Operand::Name(name) => self.local(name, method),
            ast::Operand::Lit(..) => Err(self.err("arraycopy needs array locals".to_string())),
        }
    }

    fn stmt(&self, kind: &StmtKind, method: &Method) -> Result<Stmt> {
        Ok(match kind {
            StmtKind::Label(l) => Stmt::Label(self.label(l)?),
            StmtKind::Assign(place, rv) => {
                let dest = self.place(place, method)?;
                if matches!(dest, Place::Local(l) if Some(l) == method.this()) {
                    return Err(self.err("`this` cannot be assigned".to_string()));
                }
                Stmt::Assign {
                    dest,
                    value: self.rvalue(rv, method)?,
                }
            }
            StmtKind::Invoke(c) => Stmt::Invoke(self.call(c, method)?),
            StmtKind::If(op, a, b, target) => Stmt::If {
                op: *op,
                lhs: self.operand(a, method)?,
                rhs: self.operand(b, method)?,
                target: self.label(target)?,
            },
            StmtKind::Goto(l) => Stmt::Goto(self.label(l)?),
            StmtKind::Return(op) => Stmt::Return(match op {
                Some(o) => Some(self.operand(o, method)?),
                None => None,
            }),
            StmtKind::ArrayCopy([src, src_pos, dst, dst_pos, len]) => Stmt::ArrayCopy {
                src: self.array_local(src, method)?,
                src_pos: self.operand(src_pos, method)?,
                dst: self.array_local(dst, method)?,
                dst_pos: self.operand(dst_pos, method)?,
                len: self.operand(len, method)?,
            },
            StmtKind::Nop => Stmt::Nop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
class Token {
    abstract method add(other: Token): Token;
}

class DoubleToken extends Token {
    field _value: double;

    method add(other: Token): Token {
        local o: DoubleToken;
        local r: DoubleToken;
        local a: double;
        local b: double;
        o = (DoubleToken) other;
        a = this._value;
        b = o._value;
        a = a + b;
        r = new DoubleToken;
        specialinvoke r.<init>(a);
        return r;
    }

    method <init>(v: double) {
        this._value = v;
        return;
    }
}

class Counter {
    field count: int;

    static method twice(x: int): int {
        local i: int;
        local acc: int;
        i = 0;
        acc = 0;
    loop:
        if i >= 2 goto done;
        acc = acc + x;
        i = i + 1;
        goto loop;
    done:
        return acc;
    }
}
"#;

    fn program() -> Program {
        parse_ir(SOURCE, &Program::new()).expect("lowering failed")
    }

    #[test]
    fn resolves_fields_through_casts() {
        let p = program();
        let add = p.method("DoubleToken", "add").unwrap();
        let Stmt::Assign {
            value: Rvalue::Load(Place::Field { field, .. }),
            ..
        } = &add.body[2]
        else {
            panic!("expected field load, got {:?}", add.body[2])
        };
        assert_eq!(field, &FieldRef::new("DoubleToken", "_value"));
        let Stmt::Invoke(call) = &add.body[5] else {
            panic!("expected invoke")
        };
        assert_eq!(call.kind, CallKind::Special);
        assert_eq!(call.method, MethodRef::new("DoubleToken", "<init>"));
    }

    #[test]
    fn method_kinds_and_params() {
        let p = program();
        let add = p.method("Token", "add").unwrap();
        assert_eq!(add.kind, MethodKind::Abstract);
        let twice = p.method("Counter", "twice").unwrap();
        assert!(twice.is_static);
        assert_eq!(twice.this(), None);
        assert_eq!(twice.local_name(twice.params[0]), "x");
    }

    #[test]
    fn named_labels_get_fresh_ids() {
        let p = program();
        let twice = p.method("Counter", "twice").unwrap();
        assert_eq!(twice.next_label, 2);
        assert_eq!(twice.label_position(Label(0)), Some(2));
        assert_eq!(twice.label_position(Label(1)), Some(7));
    }

    #[test]
    fn print_then_parse_is_stable() {
        let p = program();
        let printed = p.to_string();
        let again = parse_ir(&printed, &Program::new()).expect("reparse failed");
        assert_eq!(again.to_string(), printed);
    }

    #[test]
    fn unknown_field_is_an_error() {
        let err = parse_ir(
            "class A { field x: int; method f() { local y: int; y = this.z; return; } }",
            &Program::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SpecializeError::Parse(m) if m.contains("no field `z`")));
    }

    #[test]
    fn unknown_label_is_an_error() {
        let err = parse_ir("class A { method f() { goto nowhere; } }", &Program::new())
            .unwrap_err();
        assert!(matches!(err, SpecializeError::Parse(m) if m.contains("unknown label")));
    }

    #[test]
    fn context_classes_are_visible() {
        let lib = program();
        let p = parse_ir(
            "class User { method f(t: DoubleToken): double { local v: double; v = t._value; return v; } }",
            &lib,
        )
        .expect("lowering failed");
        assert_eq!(p.classes.len(), 1);
    }
}
