// model.rs — Actor graph arena
//
// Entities, ports, relations and attributes live in flat arenas addressed by
// the handles of id.rs, with explicit parent links instead of back-pointers.
// The graph is an immutable input of a specialization run. A nested,
// serde-friendly description (`EntitySpec`) is the interchange form used by
// bundles and tests; `ActorGraph::from_spec` builds the arena from it.
//
// Preconditions: none.
// Postconditions: `validate` accepts only graphs where every port belongs to
//   exactly one entity, every relation links at least two ports, and names are
//   unique within their container.
// Failure modes: malformed descriptions → `SpecializeError::InternalConsistency`.
// Side effects: none.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpecializeError};
use crate::id::{AttrId, EntityId, PortId, RelationId};
use crate::lattice::TokenType;

// ── Node types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// What an attribute is. Everything except `Attribute` is settable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    #[default]
    Parameter,
    Variable,
    StringParameter,
    Attribute,
}

impl AttributeKind {
    pub fn is_settable(self) -> bool {
        !matches!(self, AttributeKind::Attribute)
    }

    /// Runtime library class of attributes of this kind.
    pub fn runtime_class(self) -> &'static str {
        match self {
            AttributeKind::Parameter => "Parameter",
            AttributeKind::Variable => "Variable",
            AttributeKind::StringParameter => "StringParameter",
            AttributeKind::Attribute => "Attribute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrOwner {
    Entity(EntityId),
    Port(PortId),
    Attribute(AttrId),
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    /// Template class implementing this entity.
    pub class_name: String,
    pub container: Option<EntityId>,
    pub composite: bool,
    pub entities: Vec<EntityId>,
    pub ports: Vec<PortId>,
    pub relations: Vec<RelationId>,
    pub attributes: Vec<AttrId>,
}

#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    pub entity: EntityId,
    pub direction: Direction,
    /// Channel count.
    pub width: usize,
    pub element_type: TokenType,
    pub attributes: Vec<AttrId>,
    /// Linked relations in link order.
    pub links: Vec<RelationId>,
}

#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub container: EntityId,
    pub ports: Vec<PortId>,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub owner: AttrOwner,
    pub kind: AttributeKind,
    pub expression: String,
    pub declared_type: Option<TokenType>,
    /// Value is only known at run time.
    pub dynamic: bool,
    pub attributes: Vec<AttrId>,
}

/// Hierarchical actor graph. Entity 0 is the root composite.
#[derive(Debug, Clone)]
pub struct ActorGraph {
    entities: Vec<Entity>,
    ports: Vec<Port>,
    relations: Vec<Relation>,
    attributes: Vec<Attribute>,
}

// ── Construction ────────────────────────────────────────────────────────────

impl ActorGraph {
    pub fn new(root_name: &str, class_name: &str) -> Self {
        ActorGraph {
            entities: vec![Entity {
                name: root_name.to_string(),
                class_name: class_name.to_string(),
                container: None,
                composite: true,
                entities: Vec::new(),
                ports: Vec::new(),
                relations: Vec::new(),
                attributes: Vec::new(),
            }],
            ports: Vec::new(),
            relations: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn add_entity(
        &mut self,
        container: EntityId,
        name: &str,
        class_name: &str,
        composite: bool,
    ) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        self.entities.push(Entity {
            name: name.to_string(),
            class_name: class_name.to_string(),
            container: Some(container),
            composite,
            entities: Vec::new(),
            ports: Vec::new(),
            relations: Vec::new(),
            attributes: Vec::new(),
        });
        self.entities[container.index()].entities.push(id);
        id
    }

    pub fn add_port(&mut self, entity: EntityId, name: &str, direction: Direction) -> PortId {
        let id = PortId(self.ports.len() as u32);
        self.ports.push(Port {
            name: name.to_string(),
            entity,
            direction,
            width: 1,
            element_type: TokenType::General,
            attributes: Vec::new(),
            links: Vec::new(),
        });
        self.entities[entity.index()].ports.push(id);
        id
    }

    pub fn set_port_width(&mut self, port: PortId, width: usize) {
        self.ports[port.index()].width = width;
    }

    pub fn set_port_type(&mut self, port: PortId, ty: TokenType) {
        self.ports[port.index()].element_type = ty;
    }

    pub fn add_attribute(
        &mut self,
        owner: AttrOwner,
        name: &str,
        kind: AttributeKind,
        expression: &str,
    ) -> AttrId {
        let id = AttrId(self.attributes.len() as u32);
        self.attributes.push(Attribute {
            name: name.to_string(),
            owner,
            kind,
            expression: expression.to_string(),
            declared_type: None,
            dynamic: false,
            attributes: Vec::new(),
        });
        match owner {
            AttrOwner::Entity(e) => self.entities[e.index()].attributes.push(id),
            AttrOwner::Port(p) => self.ports[p.index()].attributes.push(id),
            AttrOwner::Attribute(a) => self.attributes[a.index()].attributes.push(id),
        }
        id
    }

    pub fn set_attribute_type(&mut self, attr: AttrId, ty: TokenType) {
        self.attributes[attr.index()].declared_type = Some(ty);
    }

    pub fn set_dynamic(&mut self, attr: AttrId, dynamic: bool) {
        self.attributes[attr.index()].dynamic = dynamic;
    }

    /// Link `ports` through a new relation contained by `container`.
    pub fn connect(&mut self, container: EntityId, name: &str, ports: &[PortId]) -> RelationId {
        let id = RelationId(self.relations.len() as u32);
        self.relations.push(Relation {
            name: name.to_string(),
            container,
            ports: ports.to_vec(),
        });
        self.entities[container.index()].relations.push(id);
        for p in ports {
            self.ports[p.index()].links.push(id);
        }
        id
    }
}

// ── Queries ─────────────────────────────────────────────────────────────────

impl ActorGraph {
    pub fn root(&self) -> EntityId {
        EntityId(0)
    }

    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.entities[id.index()]
    }

    pub fn port(&self, id: PortId) -> &Port {
        &self.ports[id.index()]
    }

    pub fn relation(&self, id: RelationId) -> &Relation {
        &self.relations[id.index()]
    }

    pub fn attribute(&self, id: AttrId) -> &Attribute {
        &self.attributes[id.index()]
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn port_ids(&self) -> impl Iterator<Item = PortId> {
        (0..self.ports.len() as u32).map(PortId)
    }

    pub fn attribute_ids(&self) -> impl Iterator<Item = AttrId> {
        (0..self.attributes.len() as u32).map(AttrId)
    }

    /// Dotted name from the root, e.g. `top.A`.
    pub fn full_name(&self, id: EntityId) -> String {
        let e = self.entity(id);
        match e.container {
            Some(c) => format!("{}.{}", self.full_name(c), e.name),
            None => e.name.clone(),
        }
    }

    pub fn port_full_name(&self, id: PortId) -> String {
        let p = self.port(id);
        format!("{}.{}", self.full_name(p.entity), p.name)
    }

    pub fn attribute_full_name(&self, id: AttrId) -> String {
        let a = self.attribute(id);
        let prefix = match a.owner {
            AttrOwner::Entity(e) => self.full_name(e),
            AttrOwner::Port(p) => self.port_full_name(p),
            AttrOwner::Attribute(parent) => self.attribute_full_name(parent),
        };
        format!("{}.{}", prefix, a.name)
    }

    /// Nearest enclosing entity of an attribute.
    pub fn owner_entity(&self, id: AttrId) -> EntityId {
        match self.attribute(id).owner {
            AttrOwner::Entity(e) => e,
            AttrOwner::Port(p) => self.port(p).entity,
            AttrOwner::Attribute(parent) => self.owner_entity(parent),
        }
    }

    /// Dotted name of an attribute relative to its owning entity
    /// (`gain`, `input.tokenConsumptionRate`, `outer.inner`).
    pub fn relative_path(&self, id: AttrId) -> String {
        let a = self.attribute(id);
        match a.owner {
            AttrOwner::Entity(_) => a.name.clone(),
            AttrOwner::Port(p) => format!("{}.{}", self.port(p).name, a.name),
            AttrOwner::Attribute(parent) => format!("{}.{}", self.relative_path(parent), a.name),
        }
    }

    pub fn child_by_name(&self, container: EntityId, name: &str) -> Option<EntityId> {
        self.entity(container)
            .entities
            .iter()
            .copied()
            .find(|e| self.entity(*e).name == name)
    }

    pub fn port_by_name(&self, entity: EntityId, name: &str) -> Option<PortId> {
        self.entity(entity)
            .ports
            .iter()
            .copied()
            .find(|p| self.port(*p).name == name)
    }

    pub fn attributes_of(&self, owner: AttrOwner) -> &[AttrId] {
        match owner {
            AttrOwner::Entity(e) => &self.entity(e).attributes,
            AttrOwner::Port(p) => &self.port(p).attributes,
            AttrOwner::Attribute(a) => &self.attribute(a).attributes,
        }
    }

    pub fn attribute_by_name(&self, owner: AttrOwner, name: &str) -> Option<AttrId> {
        self.attributes_of(owner)
            .iter()
            .copied()
            .find(|a| self.attribute(*a).name == name)
    }

    /// Entity by dotted path from the root (the root's own name included).
    pub fn entity_by_path(&self, path: &str) -> Option<EntityId> {
        let mut parts = path.split('.');
        let root = self.root();
        if parts.next()? != self.entity(root).name {
            return None;
        }
        let mut cur = root;
        for part in parts {
            cur = self.child_by_name(cur, part)?;
        }
        Some(cur)
    }

    /// All entities, containers before their children, in declaration order.
    pub fn entities_preorder(&self) -> Vec<EntityId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(e) = stack.pop() {
            out.push(e);
            for child in self.entity(e).entities.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Composite entities, innermost first.
    pub fn composites_innermost_first(&self) -> Vec<EntityId> {
        fn visit(g: &ActorGraph, e: EntityId, out: &mut Vec<EntityId>) {
            for child in &g.entity(e).entities {
                visit(g, *child, out);
            }
            if g.entity(e).composite {
                out.push(e);
            }
        }
        let mut out = Vec::new();
        visit(self, self.root(), &mut out);
        out
    }

    /// Every attribute reachable from the root, depth first: an entity's own
    /// attributes (with nested ones), then its ports' attributes, then its
    /// children.
    pub fn attributes_preorder(&self) -> Vec<AttrId> {
        fn visit_attr(g: &ActorGraph, a: AttrId, out: &mut Vec<AttrId>) {
            out.push(a);
            for nested in &g.attribute(a).attributes {
                visit_attr(g, *nested, out);
            }
        }
        let mut out = Vec::new();
        for e in self.entities_preorder() {
            for a in &self.entity(e).attributes {
                visit_attr(self, *a, &mut out);
            }
            for p in &self.entity(e).ports {
                for a in &self.port(*p).attributes {
                    visit_attr(self, *a, &mut out);
                }
            }
        }
        out
    }

    /// Whether `rel` is linked to `port` from inside the port's entity.
    pub fn is_inside_link(&self, port: PortId, rel: RelationId) -> bool {
        self.relation(rel).container == self.port(port).entity
    }

    pub fn outside_links(&self, port: PortId) -> Vec<RelationId> {
        self.port(port)
            .links
            .iter()
            .copied()
            .filter(|r| !self.is_inside_link(port, *r))
            .collect()
    }

    pub fn inside_links(&self, port: PortId) -> Vec<RelationId> {
        self.port(port)
            .links
            .iter()
            .copied()
            .filter(|r| self.is_inside_link(port, *r))
            .collect()
    }

    /// Evaluate an integer-valued port attribute such as a token rate.
    pub fn port_attribute(&self, port: PortId, name: &str) -> Option<&Attribute> {
        self.attribute_by_name(AttrOwner::Port(port), name)
            .map(|a| self.attribute(a))
    }
}

// ── Validation ──────────────────────────────────────────────────────────────

impl ActorGraph {
    /// Check the structural invariants of the arena.
    pub fn validate(&self) -> Result<()> {
        for (i, port) in self.ports.iter().enumerate() {
            let id = PortId(i as u32);
            let owners = self
                .entities
                .iter()
                .filter(|e| e.ports.contains(&id))
                .count();
            if owners != 1 || !self.entity(port.entity).ports.contains(&id) {
                return Err(SpecializeError::internal(format!(
                    "port `{}` must belong to exactly one entity",
                    self.port_full_name(id)
                )));
            }
        }
        for rel in &self.relations {
            if rel.ports.len() < 2 {
                return Err(SpecializeError::internal(format!(
                    "relation `{}.{}` links fewer than two ports",
                    self.full_name(rel.container),
                    rel.name
                )));
            }
            for p in &rel.ports {
                let owner = self.port(*p).entity;
                if owner != rel.container && self.entity(owner).container != Some(rel.container) {
                    return Err(SpecializeError::internal(format!(
                        "relation `{}.{}` links port `{}` outside its container",
                        self.full_name(rel.container),
                        rel.name,
                        self.port_full_name(*p)
                    )));
                }
            }
        }
        for (i, e) in self.entities.iter().enumerate() {
            let id = EntityId(i as u32);
            let mut names = HashSet::new();
            let all = e
                .entities
                .iter()
                .map(|c| &self.entity(*c).name)
                .chain(e.ports.iter().map(|p| &self.port(*p).name))
                .chain(e.relations.iter().map(|r| &self.relation(*r).name))
                .chain(e.attributes.iter().map(|a| &self.attribute(*a).name));
            for name in all {
                if !names.insert(name.as_str()) {
                    return Err(SpecializeError::internal(format!(
                        "duplicate name `{}` in `{}`",
                        name,
                        self.full_name(id)
                    )));
                }
            }
        }
        for owner in self
            .ports
            .iter()
            .enumerate()
            .map(|(i, _)| AttrOwner::Port(PortId(i as u32)))
            .chain((0..self.attributes.len()).map(|i| AttrOwner::Attribute(AttrId(i as u32))))
        {
            let mut names = HashSet::new();
            for a in self.attributes_of(owner) {
                if !names.insert(self.attribute(*a).name.as_str()) {
                    return Err(SpecializeError::internal(format!(
                        "duplicate attribute name `{}`",
                        self.attribute_full_name(*a)
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Interchange description ─────────────────────────────────────────────────

fn default_width() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    #[serde(default)]
    pub kind: AttributeKind,
    #[serde(default)]
    pub expression: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<TokenType>,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub direction: Direction,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<TokenType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeSpec>,
}

/// A relation inside a composite. Ports are named `port` (the composite's
/// own boundary port) or `child.port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub name: String,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    /// Template class; composites default to `CompositeActor`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<EntitySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<RelationSpec>,
}

impl EntitySpec {
    fn is_composite(&self) -> bool {
        self.composite.unwrap_or(!self.entities.is_empty())
    }

    fn class_name(&self) -> Result<String> {
        match (&self.class, self.is_composite()) {
            (Some(c), _) => Ok(c.clone()),
            (None, true) => Ok("CompositeActor".to_string()),
            (None, false) => Err(SpecializeError::internal(format!(
                "atomic entity `{}` names no class",
                self.name
            ))),
        }
    }
}

impl ActorGraph {
    /// Build and validate an arena from a nested description.
    pub fn from_spec(spec: &EntitySpec) -> Result<ActorGraph> {
        let mut graph = ActorGraph::new(&spec.name, &spec.class_name()?);
        let root = graph.root();
        graph.populate(root, spec)?;
        graph.validate()?;
        Ok(graph)
    }

    fn populate(&mut self, entity: EntityId, spec: &EntitySpec) -> Result<()> {
        for a in &spec.attributes {
            self.add_attribute_spec(AttrOwner::Entity(entity), a);
        }
        for p in &spec.ports {
            let port = self.add_port(entity, &p.name, p.direction);
            self.set_port_width(port, p.width);
            if let Some(t) = &p.element_type {
                self.set_port_type(port, t.clone());
            }
            for a in &p.attributes {
                self.add_attribute_spec(AttrOwner::Port(port), a);
            }
        }
        for child in &spec.entities {
            let class = child.class_name()?;
            let id = self.add_entity(entity, &child.name, &class, child.is_composite());
            self.populate(id, child)?;
        }
        for r in &spec.relations {
            let ports = r
                .ports
                .iter()
                .map(|path| self.resolve_port_path(entity, path))
                .collect::<Result<Vec<_>>>()?;
            self.connect(entity, &r.name, &ports);
        }
        Ok(())
    }

    fn add_attribute_spec(&mut self, owner: AttrOwner, spec: &AttributeSpec) {
        let id = self.add_attribute(owner, &spec.name, spec.kind, &spec.expression);
        if let Some(t) = &spec.declared_type {
            self.set_attribute_type(id, t.clone());
        }
        self.set_dynamic(id, spec.dynamic);
        for nested in &spec.attributes {
            self.add_attribute_spec(AttrOwner::Attribute(id), nested);
        }
    }

    fn resolve_port_path(&self, container: EntityId, path: &str) -> Result<PortId> {
        let found = match path.split_once('.') {
            None => self.port_by_name(container, path),
            Some((child, port)) => self
                .child_by_name(container, child)
                .and_then(|c| self.port_by_name(c, port)),
        };
        found.ok_or_else(|| {
            SpecializeError::internal(format!(
                "relation in `{}` names unknown port `{}`",
                self.full_name(container),
                path
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_actor_spec() -> EntitySpec {
        serde_json::from_str(
            r#"{
                "name": "top",
                "attributes": [{"name": "gain", "expression": "2.0", "type": "double"}],
                "ports": [{"name": "in", "direction": "input", "type": "double"},
                          {"name": "out", "direction": "output", "type": "double"}],
                "entities": [
                    {"name": "A", "class": "Scale",
                     "ports": [{"name": "input", "direction": "input",
                                "attributes": [{"name": "tokenConsumptionRate", "expression": "1", "kind": "attribute"}]},
                               {"name": "output", "direction": "output"}]},
                    {"name": "B", "class": "Scale",
                     "ports": [{"name": "input", "direction": "input"},
                               {"name": "output", "direction": "output"}]}
                ],
                "relations": [
                    {"name": "r0", "ports": ["in", "A.input"]},
                    {"name": "r1", "ports": ["A.output", "B.input"]},
                    {"name": "r2", "ports": ["B.output", "out"]}
                ]
            }"#,
        )
        .expect("bad json")
    }

    #[test]
    fn builds_from_spec() {
        let g = ActorGraph::from_spec(&two_actor_spec()).unwrap();
        let a = g.entity_by_path("top.A").unwrap();
        assert_eq!(g.entity(a).class_name, "Scale");
        assert!(g.entity(g.root()).composite);
        assert_eq!(g.entity(g.root()).class_name, "CompositeActor");
        let input = g.port_by_name(a, "input").unwrap();
        assert_eq!(g.port_full_name(input), "top.A.input");
        assert_eq!(g.composites_innermost_first(), vec![g.root()]);
    }

    #[test]
    fn inside_and_outside_links() {
        let g = ActorGraph::from_spec(&two_actor_spec()).unwrap();
        let root_in = g.port_by_name(g.root(), "in").unwrap();
        assert_eq!(g.inside_links(root_in).len(), 1);
        assert!(g.outside_links(root_in).is_empty());
        let a = g.entity_by_path("top.A").unwrap();
        let a_in = g.port_by_name(a, "input").unwrap();
        assert_eq!(g.outside_links(a_in).len(), 1);
    }

    #[test]
    fn attribute_paths() {
        let g = ActorGraph::from_spec(&two_actor_spec()).unwrap();
        let attrs = g.attributes_preorder();
        let paths: Vec<String> = attrs.iter().map(|a| g.relative_path(*a)).collect();
        assert_eq!(paths, vec!["gain", "input.tokenConsumptionRate"]);
        let rate = attrs[1];
        assert_eq!(g.owner_entity(rate), g.entity_by_path("top.A").unwrap());
        assert_eq!(
            g.attribute_full_name(rate),
            "top.A.input.tokenConsumptionRate"
        );
        assert!(!g.attribute(rate).kind.is_settable());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut spec = two_actor_spec();
        spec.entities[1].name = "A".to_string();
        assert!(ActorGraph::from_spec(&spec).is_err());
    }

    #[test]
    fn relation_needs_two_ports() {
        let mut g = ActorGraph::new("top", "CompositeActor");
        let root = g.root();
        let p = g.add_port(root, "in", Direction::Input);
        g.connect(root, "lonely", &[p]);
        assert!(g.validate().is_err());
    }

    #[test]
    fn atomic_entity_needs_class() {
        let spec: EntitySpec = serde_json::from_str(
            r#"{"name": "top", "entities": [{"name": "A"}]}"#,
        )
        .unwrap();
        assert!(ActorGraph::from_spec(&spec).is_err());
    }
}
