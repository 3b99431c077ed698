// scaffold.rs — Generated classes of the unspecialized program
//
// Every entity of the actor graph gets its own generated class `CG_<path>`.
// An atomic actor's template class (user IR) is cloned under the new name
// with every self-reference renamed, so each instance can be specialized
// independently. Templates that rely on the runtime (library classes, or any
// class declaring native methods) are extended instead of cloned.
//
// The scaffold then makes sure each generated class has one field per port,
// per attribute and per child entity of its entity, and records which field
// stands for which graph node (`Bindings`). Passes use these bindings to
// recognize `this.gain` as attribute `gain`, `this.A` as child `A`, and so on.
//
// Preconditions: `user` was lowered against the runtime library.
// Postconditions: `Bindings::class_of` names a class of the returned program
//   for every entity.
// Failure modes: unknown template class → `InternalConsistency`; two graph
//   nodes needing the same field name, or a generated class name that is
//   already taken → `Configuration`.
// Side effects: none.

use std::collections::HashMap;

use crate::error::{Result, SpecializeError};
use crate::id::{AttrId, EntityId, PortId};
use crate::ir::{Call, Class, FieldRef, IrType, MethodKind, Place, Program, Rvalue, Stmt};
use crate::library::{self, PORT_CLASS};
use crate::model::{ActorGraph, AttrOwner};

/// Prefix of every generated class name.
pub const GENERATED_PREFIX: &str = "CG_";

/// Which generated field stands for which graph node.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entity_class: Vec<String>,
    class_entity: HashMap<String, EntityId>,
    port_fields: HashMap<FieldRef, PortId>,
    attribute_fields: HashMap<FieldRef, AttrId>,
    child_fields: HashMap<FieldRef, EntityId>,
    port_field_of: HashMap<PortId, FieldRef>,
    attribute_field_of: HashMap<AttrId, FieldRef>,
    child_field_of: HashMap<EntityId, FieldRef>,
}

impl Bindings {
    pub fn class_of(&self, entity: EntityId) -> &str {
        &self.entity_class[entity.index()]
    }

    pub fn entity_of_class(&self, class: &str) -> Option<EntityId> {
        self.class_entity.get(class).copied()
    }

    pub fn is_generated(&self, class: &str) -> bool {
        self.class_entity.contains_key(class)
    }

    /// Generated classes in entity pre-order.
    pub fn generated_classes(&self) -> &[String] {
        &self.entity_class
    }

    pub fn port_of_field(&self, field: &FieldRef) -> Option<PortId> {
        self.port_fields.get(field).copied()
    }

    pub fn attribute_of_field(&self, field: &FieldRef) -> Option<AttrId> {
        self.attribute_fields.get(field).copied()
    }

    pub fn child_of_field(&self, field: &FieldRef) -> Option<EntityId> {
        self.child_fields.get(field).copied()
    }

    pub fn port_field(&self, port: PortId) -> Option<&FieldRef> {
        self.port_field_of.get(&port)
    }

    pub fn attribute_field(&self, attr: AttrId) -> Option<&FieldRef> {
        self.attribute_field_of.get(&attr)
    }

    pub fn child_field(&self, entity: EntityId) -> Option<&FieldRef> {
        self.child_field_of.get(&entity)
    }
}

/// Replace characters that cannot appear in an IR identifier with `_`.
pub fn identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '$' { c } else { '_' })
        .collect();
    if !out.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        out.insert(0, '_');
    }
    out
}

pub fn generated_class_name(graph: &ActorGraph, entity: EntityId) -> String {
    format!("{}{}", GENERATED_PREFIX, identifier(&graph.full_name(entity)))
}

/// Build the unspecialized program: library, user classes and one generated
/// class per entity.
pub fn scaffold(
    graph: &ActorGraph,
    library: &Program,
    user: &Program,
) -> Result<(Program, Bindings)> {
    let mut program = library.clone();
    program.merge(user.clone());

    let entities = graph.entities_preorder();
    let mut bindings = Bindings {
        entity_class: vec![String::new(); graph.entity_count()],
        ..Bindings::default()
    };
    for &e in &entities {
        let name = generated_class_name(graph, e);
        if program.class(&name).is_some() || bindings.class_entity.contains_key(&name) {
            return Err(SpecializeError::configuration(
                name,
                "generated class name is already taken",
            ));
        }
        bindings.entity_class[e.index()] = name.clone();
        bindings.class_entity.insert(name, e);
    }

    for &e in &entities {
        let class = instantiate_template(graph, &program, e, bindings.class_of(e))?;
        program.add_class(class);
    }
    for &e in &entities {
        add_structural_fields(graph, &mut program, &mut bindings, e)?;
    }
    Ok((program, bindings))
}

fn instantiate_template(
    graph: &ActorGraph,
    program: &Program,
    entity: EntityId,
    name: &str,
) -> Result<Class> {
    let template_name = &graph.entity(entity).class_name;
    let template = program.class(template_name).ok_or_else(|| {
        SpecializeError::internal(format!(
            "entity `{}` names unknown class `{}`",
            graph.full_name(entity),
            template_name
        ))
    })?;
    let uses_runtime = library::is_library_class(template_name)
        || template
            .methods
            .iter()
            .any(|m| matches!(m.kind, MethodKind::Native { .. }));
    if uses_runtime {
        return Ok(Class::new(name, Some(template_name)));
    }
    let mut class = template.clone();
    class.name = name.to_string();
    rename_class(&mut class, template_name, name);
    Ok(class)
}

fn add_structural_fields(
    graph: &ActorGraph,
    program: &mut Program,
    bindings: &mut Bindings,
    entity: EntityId,
) -> Result<()> {
    let class_name = bindings.class_of(entity).to_string();
    let mut taken: HashMap<String, String> = HashMap::new();
    let mut claim = |field: &str, node: String| -> Result<()> {
        if let Some(previous) = taken.insert(field.to_string(), node.clone()) {
            return Err(SpecializeError::configuration(
                class_name.clone(),
                format!("`{}` and `{}` both need field `{}`", previous, node, field),
            ));
        }
        Ok(())
    };

    let e = graph.entity(entity);
    let mut wanted: Vec<(String, IrType, Node)> = Vec::new();
    for &p in &e.ports {
        let field = identifier(&graph.port(p).name);
        claim(&field, graph.port_full_name(p))?;
        wanted.push((field, IrType::object(PORT_CLASS), Node::Port(p)));
    }
    for &a in graph.attributes_of(AttrOwner::Entity(entity)) {
        let attr = graph.attribute(a);
        let field = identifier(&attr.name);
        claim(&field, graph.attribute_full_name(a))?;
        wanted.push((field, IrType::object(attr.kind.runtime_class()), Node::Attribute(a)));
    }
    for &c in &e.entities {
        let field = identifier(&graph.entity(c).name);
        claim(&field, graph.full_name(c))?;
        wanted.push((field, IrType::object(bindings.class_of(c)), Node::Child(c)));
    }

    for (field, ty, node) in wanted {
        let owner = match program.lookup_field(&class_name, &field) {
            Some((owner, _)) => owner,
            None => {
                let class = program.class_mut(&class_name).ok_or_else(|| {
                    SpecializeError::internal(format!("class `{}` vanished", class_name))
                })?;
                class.add_field(&field, ty);
                class_name.clone()
            }
        };
        let fref = FieldRef::new(&owner, &field);
        match node {
            Node::Port(p) => {
                bindings.port_fields.insert(fref.clone(), p);
                bindings.port_field_of.insert(p, fref);
            }
            Node::Attribute(a) => {
                bindings.attribute_fields.insert(fref.clone(), a);
                bindings.attribute_field_of.insert(a, fref);
            }
            Node::Child(c) => {
                bindings.child_fields.insert(fref.clone(), c);
                bindings.child_field_of.insert(c, fref);
            }
        }
    }
    Ok(())
}

enum Node {
    Port(PortId),
    Attribute(AttrId),
    Child(EntityId),
}

// ── Renaming ────────────────────────────────────────────────────────────────

fn rename_type(ty: &mut IrType, from: &str, to: &str) {
    match ty {
        IrType::Object(c) if c == from => *c = to.to_string(),
        IrType::Array(e) => rename_type(e, from, to),
        _ => {}
    }
}

fn rename_name(name: &mut String, from: &str, to: &str) {
    if name == from {
        *name = to.to_string();
    }
}

fn rename_call(call: &mut Call, from: &str, to: &str) {
    rename_name(&mut call.method.class, from, to);
}

fn rename_place(place: &mut Place, from: &str, to: &str) {
    match place {
        Place::Field { field, .. } | Place::Static(field) => {
            rename_name(&mut field.class, from, to)
        }
        Place::Local(_) | Place::Elem { .. } => {}
    }
}

/// Rewrite every reference to class `from` inside `class` to `to`.
pub fn rename_class(class: &mut Class, from: &str, to: &str) {
    for f in &mut class.fields {
        rename_type(&mut f.ty, from, to);
    }
    for m in &mut class.methods {
        rename_type(&mut m.return_type, from, to);
        for l in &mut m.locals {
            rename_type(&mut l.ty, from, to);
        }
        for stmt in &mut m.body {
            match stmt {
                Stmt::Assign { dest, value } => {
                    rename_place(dest, from, to);
                    match value {
                        Rvalue::Load(p) => rename_place(p, from, to),
                        Rvalue::New(c) | Rvalue::InstanceOf(c, _) => rename_name(c, from, to),
                        Rvalue::NewArray(t, _) | Rvalue::Cast(t, _) => rename_type(t, from, to),
                        Rvalue::Call(c) => rename_call(c, from, to),
                        Rvalue::Use(_)
                        | Rvalue::Binary(..)
                        | Rvalue::Unary(..)
                        | Rvalue::Length(_) => {}
                    }
                }
                Stmt::Invoke(c) => rename_call(c, from, to),
                _ => {}
            }
        }
    }
}

// ── Certificate ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for scaffold postconditions (G1-G2).
#[derive(Debug, Clone)]
pub struct ScaffoldCert {
    /// G1: every entity has its generated class in the program.
    pub g1_classes_exist: bool,
    /// G2: every port, entity attribute and child is bound to a declared field.
    pub g2_nodes_bound: bool,
}

impl crate::pass::StageCert for ScaffoldCert {
    fn all_pass(&self) -> bool {
        self.g1_classes_exist && self.g2_nodes_bound
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("G1_classes_exist", self.g1_classes_exist),
            ("G2_nodes_bound", self.g2_nodes_bound),
        ]
    }
}

pub fn verify_scaffold(graph: &ActorGraph, program: &Program, bindings: &Bindings) -> ScaffoldCert {
    let entities = graph.entities_preorder();
    let declared =
        |f: Option<&FieldRef>| f.is_some_and(|f| program.lookup_field(&f.class, &f.name).is_some());
    ScaffoldCert {
        g1_classes_exist: entities
            .iter()
            .all(|e| program.class(bindings.class_of(*e)).is_some()),
        g2_nodes_bound: entities.iter().all(|&e| {
            let entity = graph.entity(e);
            entity.ports.iter().all(|p| declared(bindings.port_field(*p)))
                && graph
                    .attributes_of(AttrOwner::Entity(e))
                    .iter()
                    .all(|a| declared(bindings.attribute_field(*a)))
                && entity.entities.iter().all(|c| declared(bindings.child_field(*c)))
        }),
    }
}
