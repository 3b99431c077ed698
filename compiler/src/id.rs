// id.rs — Stable handles for actor-graph nodes and IR entities
//
// Graph nodes live in arenas inside `ActorGraph`; the handles below index
// those arenas. IR locals and labels are per-method indices. All handles are
// plain integers so that passes can store them in maps without borrowing the
// arena they came from.

use serde::{Deserialize, Serialize};

/// Handle of an entity (atomic actor or composite) in an `ActorGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

/// Handle of a port in an `ActorGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u32);

/// Handle of a relation in an `ActorGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationId(pub u32);

/// Handle of an attribute in an `ActorGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttrId(pub u32);

/// Index of a local variable within one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Jump target within one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl EntityId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl PortId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl RelationId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl AttrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl LocalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
